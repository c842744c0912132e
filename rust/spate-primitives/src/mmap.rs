//! File-backed memory-mapped regions shared between driver and clients.
//!
//! The driver creates every shared file (CnC file, log buffers) and clients
//! attach to them; an attached mapping never deletes the backing file, the
//! creating mapping does unless ownership is released (a log buffer that
//! must linger past driver shutdown, for instance).

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::region::Region;

/// A file-backed `MAP_SHARED` memory region.
pub struct MmapRegion {
    ptr: *mut u8,
    len: usize,
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
    owns_file: bool,
}

impl MmapRegion {
    /// Create the backing file at `path`, size it, and map it.
    ///
    /// The file is created 0600 and truncated. Pass `pre_touch` to fault in
    /// every page up front so the first publication claim does not take
    /// page-fault latency.
    pub fn create(path: &Path, size: usize, pre_touch: bool) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size must be > 0"));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.set_len(size as u64)?;

        let mut region = Self::map(file, path, size)?;
        region.owns_file = true;

        if pre_touch {
            let page = page_size();
            let mut off = 0;
            while off < size {
                // A volatile read-modify-write of zero faults the page in
                // without changing its contents.
                unsafe {
                    let p = region.ptr.add(off);
                    std::ptr::write_volatile(p, std::ptr::read_volatile(p));
                }
                off += page;
            }
        }

        Ok(region)
    }

    /// Attach to an existing file-backed region.
    ///
    /// The mapping length is the current file length.
    pub fn attach(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len() as usize;
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "mapped file is empty"));
        }
        Self::map(file, path, size)
    }

    fn map(file: File, path: &Path, size: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len: size,
            file,
            path: path.to_path_buf(),
            owns_file: false,
        })
    }

    #[inline]
    pub fn region(&self) -> Region {
        // SAFETY: the mapping lives as long as this MmapRegion.
        unsafe { Region::from_raw(self.ptr, self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// After this call the backing file is deleted when the mapping drops.
    pub fn take_ownership(&mut self) {
        self.owns_file = true;
    }

    /// After this call the backing file outlives the mapping.
    pub fn release_ownership(&mut self) {
        self.owns_file = false;
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
        if self.owns_file {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// SAFETY: the mapping is valid for the lifetime of MmapRegion; concurrent
// access discipline is the business of the structures layered on top.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

/// The system page size.
pub fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_attach_share_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("share.dat");

        let created = MmapRegion::create(&path, 4096, true).unwrap();
        created.region().put_bytes(100, &[0xab, 0xcd]);

        let attached = MmapRegion::attach(&path).unwrap();
        let mut out = [0u8; 2];
        attached.region().get_bytes(100, &mut out);
        assert_eq!(out, [0xab, 0xcd]);
    }

    #[test]
    fn creator_deletes_attacher_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owned.dat");

        let created = MmapRegion::create(&path, 1024, false).unwrap();
        {
            let _attached = MmapRegion::attach(&path).unwrap();
        }
        assert!(path.exists());

        drop(created);
        assert!(!path.exists());
    }

    #[test]
    fn released_ownership_keeps_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linger.dat");

        let mut created = MmapRegion::create(&path, 1024, false).unwrap();
        created.release_ownership();
        drop(created);
        assert!(path.exists());
    }
}
