//! Agent proxies: the SPSC command queues between conductor, sender and
//! receiver.
//!
//! Ownership of publications, endpoints and images crosses threads only
//! here, as owned values inside command enums. A full queue is
//! back-pressure: the offering side retries a bounded number of times with
//! a spin hint and reports failure to the caller (which records it rather
//! than blocking).

use std::net::SocketAddr;
use std::sync::Arc;

use spate_primitives::spsc_queue::SpscQueue;
use spate_primitives::sync::spin_loop;
use spate_proto::SetupHeader;

use crate::endpoint::{ReceiveChannelEndpoint, SendChannelEndpoint};
use crate::image::PublicationImage;
use crate::publication::NetworkPublication;

/// Queue capacity for each proxy.
pub const PROXY_QUEUE_CAPACITY: usize = 1024;

/// Bounded retries before an offer is abandoned.
const OFFER_RETRIES: usize = 1000;

/// Commands for the sender agent.
pub enum SenderCmd {
    AddEndpoint(Box<SendChannelEndpoint>),
    RemoveEndpoint { endpoint_id: i64 },
    AddPublication(Box<NetworkPublication>),
    RemovePublication { registration_id: i64 },
    AddDestination { endpoint_id: i64, addr: SocketAddr },
    RemoveDestination { endpoint_id: i64, addr: SocketAddr },
}

/// Commands for the receiver agent.
pub enum ReceiverCmd {
    AddEndpoint(Box<ReceiveChannelEndpoint>),
    RemoveEndpoint { endpoint_id: i64 },
    AddSubscription { endpoint_id: i64, stream_id: i32 },
    RemoveSubscription { endpoint_id: i64, stream_id: i32 },
    NewImage(Box<PublicationImage>),
    RemoveImage { correlation_id: i64 },
}

/// Requests from the receiver to the conductor.
pub enum ConductorCmd {
    /// A SETUP arrived for a subscribed stream with no image; the
    /// conductor allocates the log buffers and counters.
    CreateImage {
        endpoint_id: i64,
        setup: SetupHeader,
        control_address: SocketAddr,
        source_identity: String,
    },
}

fn offer_with_retry<T>(queue: &SpscQueue<T>, mut value: T) -> bool {
    for _ in 0..OFFER_RETRIES {
        match queue.offer(value) {
            Ok(()) => return true,
            Err(returned) => {
                value = returned;
                spin_loop();
            }
        }
    }
    false
}

/// Conductor → sender.
#[derive(Clone)]
pub struct SenderProxy {
    queue: Arc<SpscQueue<SenderCmd>>,
}

impl SenderProxy {
    pub fn new(queue: Arc<SpscQueue<SenderCmd>>) -> Self {
        Self { queue }
    }

    #[must_use]
    pub fn offer(&self, cmd: SenderCmd) -> bool {
        offer_with_retry(&self.queue, cmd)
    }
}

/// Conductor → receiver.
#[derive(Clone)]
pub struct ReceiverProxy {
    queue: Arc<SpscQueue<ReceiverCmd>>,
}

impl ReceiverProxy {
    pub fn new(queue: Arc<SpscQueue<ReceiverCmd>>) -> Self {
        Self { queue }
    }

    #[must_use]
    pub fn offer(&self, cmd: ReceiverCmd) -> bool {
        offer_with_retry(&self.queue, cmd)
    }
}

/// Receiver → conductor.
#[derive(Clone)]
pub struct DriverConductorProxy {
    queue: Arc<SpscQueue<ConductorCmd>>,
}

impl DriverConductorProxy {
    pub fn new(queue: Arc<SpscQueue<ConductorCmd>>) -> Self {
        Self { queue }
    }

    #[must_use]
    pub fn offer(&self, cmd: ConductorCmd) -> bool {
        offer_with_retry(&self.queue, cmd)
    }
}
