//! UDP socket lifecycle: channels, transports, readiness polling and
//! multi-destination tracking.

pub mod channel;
pub mod destinations;
pub mod poller;
pub mod transport;

pub use channel::UdpChannel;
pub use destinations::DestinationTracker;
pub use poller::TransportPoller;
pub use transport::UdpTransport;
