//! The command-and-control file, `cnc.dat`.
//!
//! One mmap'd file through which every client reaches the driver:
//!
//! ```text
//! [header 128 B]
//! [to-driver MPSC command ring]
//! [to-clients broadcast buffer]
//! [counters metadata]
//! [counters values]
//! [distinct error log]
//! [loss report]
//! ```
//!
//! The driver creates it on launch; clients attach, check magic + version,
//! and derive every section offset from the lengths in the header.

use std::io;
use std::path::Path;

use spate_primitives::bits::{align, CACHE_LINE_LENGTH};
use spate_primitives::broadcast::BROADCAST_TRAILER_LENGTH;
use spate_primitives::counters::{COUNTER_LENGTH, METADATA_LENGTH};
use spate_primitives::mmap::MmapRegion;
use spate_primitives::region::Region;
use spate_primitives::rings::TRAILER_LENGTH;

use crate::config::DriverConfig;

/// File name within the driver directory.
pub const CNC_FILE: &str = "cnc.dat";

/// Magic bytes at the start of `cnc.dat`.
pub const CNC_MAGIC: [u8; 8] = *b"SPATEcnc";

/// CnC format version.
pub const CNC_VERSION: i32 = 1;

/// The fixed header at the start of the file.
#[repr(C)]
pub struct CncHeader {
    pub magic: [u8; 8],
    pub version: i32,
    pub to_driver_length: i32,
    pub to_clients_length: i32,
    pub counters_metadata_length: i32,
    pub counters_values_length: i32,
    pub error_log_length: i32,
    pub loss_report_length: i32,
    _pad0: i32,
    pub client_liveness_timeout_ns: i64,
    pub start_timestamp_ms: i64,
    pub pid: i64,
    _reserved: [u8; 64],
}

const _: () = assert!(core::mem::size_of::<CncHeader>() == 128);

/// Header size; the first section starts here.
pub const CNC_HEADER_LENGTH: usize = 128;

/// Section offsets computed from a header.
#[derive(Debug, Clone, Copy)]
struct Sections {
    to_driver: (usize, usize),
    to_clients: (usize, usize),
    counters_metadata: (usize, usize),
    counters_values: (usize, usize),
    error_log: (usize, usize),
    loss_report: (usize, usize),
    total_length: usize,
}

fn compute_sections(
    to_driver_length: usize,
    to_clients_length: usize,
    counters_values_length: usize,
    error_log_length: usize,
    loss_report_length: usize,
) -> Sections {
    let counters_metadata_length =
        counters_values_length / COUNTER_LENGTH * METADATA_LENGTH;

    let mut offset = CNC_HEADER_LENGTH;
    let mut section = |length: usize| {
        let start = align(offset, CACHE_LINE_LENGTH);
        offset = start + length;
        (start, length)
    };

    let to_driver = section(to_driver_length + TRAILER_LENGTH);
    let to_clients = section(to_clients_length + BROADCAST_TRAILER_LENGTH);
    let counters_metadata = section(counters_metadata_length);
    let counters_values = section(counters_values_length);
    let error_log = section(error_log_length);
    let loss_report = section(loss_report_length);

    Sections {
        to_driver,
        to_clients,
        counters_metadata,
        counters_values,
        error_log,
        loss_report,
        total_length: offset,
    }
}

/// A created or attached `cnc.dat` mapping.
pub struct CncFile {
    mmap: MmapRegion,
    sections: Sections,
}

impl CncFile {
    /// Create the file under `dir` and initialise its header.
    pub fn create(dir: &Path, config: &DriverConfig) -> io::Result<Self> {
        let sections = compute_sections(
            config.to_driver_buffer_length,
            config.to_clients_buffer_length,
            config.counters_values_buffer_length,
            config.error_buffer_length,
            config.loss_report_buffer_length,
        );

        let path = dir.join(CNC_FILE);
        let mmap = MmapRegion::create(&path, sections.total_length, config.pre_touch_mapped_memory)?;

        let region = mmap.region();
        // SAFETY: freshly created mapping, no other process attached yet.
        let header = unsafe { region.get_mut::<CncHeader>(0) };
        header.version = CNC_VERSION;
        header.to_driver_length = config.to_driver_buffer_length as i32;
        header.to_clients_length = config.to_clients_buffer_length as i32;
        header.counters_metadata_length = sections.counters_metadata.1 as i32;
        header.counters_values_length = config.counters_values_buffer_length as i32;
        header.error_log_length = config.error_buffer_length as i32;
        header.loss_report_length = config.loss_report_buffer_length as i32;
        header.client_liveness_timeout_ns = config.client_liveness_timeout_ns;
        header.start_timestamp_ms = crate::clock::epoch_ms();
        header.pid = std::process::id() as i64;
        // Magic last: an attacher that sees it sees a complete header.
        header.magic = CNC_MAGIC;

        Ok(Self { mmap, sections })
    }

    /// Attach to an existing file under `dir`.
    pub fn attach(dir: &Path) -> io::Result<Self> {
        let mmap = MmapRegion::attach(&dir.join(CNC_FILE))?;
        if mmap.len() < CNC_HEADER_LENGTH {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "cnc file too short"));
        }

        let region = mmap.region();
        let header = unsafe { region.get::<CncHeader>(0) };
        if header.magic != CNC_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad cnc magic"));
        }
        if header.version != CNC_VERSION {
            return Err(io::Error::other(format!(
                "cnc version mismatch: file {} expected {CNC_VERSION}",
                header.version
            )));
        }

        let sections = compute_sections(
            header.to_driver_length as usize,
            header.to_clients_length as usize,
            header.counters_values_length as usize,
            header.error_log_length as usize,
            header.loss_report_length as usize,
        );
        if mmap.len() < sections.total_length {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "cnc file truncated"));
        }

        Ok(Self { mmap, sections })
    }

    pub fn header(&self) -> &CncHeader {
        // SAFETY: `Region` is a bare pointer+len pair, so the returned
        // reference's validity is tied to `self`, not to the temporary
        // `Region` value the getter is called through.
        let region = self.mmap.region();
        unsafe { &*(region.offset(0) as *const CncHeader) }
    }

    fn section(&self, (offset, length): (usize, usize)) -> Region {
        self.mmap.region().slice(offset, length)
    }

    pub fn to_driver_region(&self) -> Region {
        self.section(self.sections.to_driver)
    }

    pub fn to_clients_region(&self) -> Region {
        self.section(self.sections.to_clients)
    }

    pub fn counters_metadata_region(&self) -> Region {
        self.section(self.sections.counters_metadata)
    }

    pub fn counters_values_region(&self) -> Region {
        self.section(self.sections.counters_values)
    }

    pub fn error_log_region(&self) -> Region {
        self.section(self.sections.error_log)
    }

    pub fn loss_report_region(&self) -> Region {
        self.section(self.sections.loss_report)
    }

    /// Keep or delete the file when this mapping drops.
    pub fn set_owns_file(&mut self, owns: bool) {
        if owns {
            self.mmap.take_ownership();
        } else {
            self.mmap.release_ownership();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spate_primitives::rings::MpscRingBuffer;

    fn small_config(dir: &Path) -> DriverConfig {
        let mut config = DriverConfig::default();
        config.dir = dir.to_path_buf();
        config.to_driver_buffer_length = 64 * 1024;
        config.to_clients_buffer_length = 64 * 1024;
        config.counters_values_buffer_length = 64 * 1024;
        config.error_buffer_length = 64 * 1024;
        config.loss_report_buffer_length = 64 * 1024;
        config
    }

    #[test]
    fn create_then_attach_shares_the_command_ring() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());

        let created = CncFile::create(dir.path(), &config).unwrap();
        let attached = CncFile::attach(dir.path()).unwrap();

        assert_eq!(attached.header().pid, std::process::id() as i64);
        assert_eq!(
            attached.header().client_liveness_timeout_ns,
            config.client_liveness_timeout_ns
        );

        // A record written through the attached mapping is read through the
        // creating one.
        let client_ring = MpscRingBuffer::new(attached.to_driver_region()).unwrap();
        let driver_ring = MpscRingBuffer::new(created.to_driver_region()).unwrap();
        client_ring.write(3, b"keepalive").unwrap();

        let mut seen = None;
        driver_ring.read(|t, p| seen = Some((t, p.to_vec())), 4);
        assert_eq!(seen, Some((3, b"keepalive".to_vec())));
    }

    #[test]
    fn version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        let created = CncFile::create(dir.path(), &config).unwrap();

        unsafe { created.mmap.region().get_mut::<CncHeader>(0) }.version = 99;
        assert!(CncFile::attach(dir.path()).is_err());
    }
}
