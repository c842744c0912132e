//! The spate media driver.
//!
//! Moves opaque messages over UDP (and shared memory for same-host IPC)
//! between publishers and subscribers in separate processes. Clients never
//! talk to the driver over a socket: everything crosses through the
//! `cnc.dat` command/event buffers and memory-mapped log buffers, which
//! clients write and read directly.
//!
//! Three cooperating agents do the work:
//!
//! - [`conductor::DriverConductor`] owns every registry and the client
//!   protocol
//! - [`sender::DriverSender`] turns committed log-buffer bytes into
//!   datagrams under flow control
//! - [`receiver::DriverReceiver`] rebuilds remote logs from datagrams and
//!   feeds repair (SM/NAK) back
//!
//! [`driver::MediaDriver::launch`] wires them together; [`client`] has a
//! minimal in-process client used by the integration tests.

pub mod agent;
pub mod client;
pub mod clock;
pub mod cnc;
pub mod commands;
pub mod conductor;
pub mod config;
pub mod congestion_control;
pub mod dispatcher;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod flow_control;
pub mod image;
pub mod loss_detector;
pub mod loss_report;
pub mod proxy;
pub mod publication;
pub mod receiver;
pub mod retransmit;
pub mod sender;
pub mod system_counters;
pub mod udp;
pub mod uri;

pub use config::{DriverConfig, ThreadingMode};
pub use driver::MediaDriver;
pub use error::DriverError;
