//! Message types for the Coordinator

use tokio::sync::{mpsc, oneshot};

use crate::domain::{PanelKey, Payload, PreparedRequest, SubgroupId};
use crate::error::StreamingError;
use crate::transport::{RawEvent, StreamHandle};

/// Sending side of one panel subscription
pub type Subscriber = mpsc::UnboundedSender<Result<Payload, StreamingError>>;

/// How a group's channel ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelClose {
    /// The server sent the `close` event
    Graceful,
    /// The stream ended without a `close` event
    ConnectionLost,
    /// The transport reported an error mid-stream
    Interrupted(String),
}

/// Internal requests to the Coordinator task
#[derive(Debug)]
pub enum CoordRequest {
    /// Fill a slot of a group's round and subscribe to the key's data
    Register {
        group: SubgroupId,
        request: PreparedRequest,
        subscriber: Option<Subscriber>,
    },

    /// Create a fresh subgroup seeded with the given keys
    CreateSubgroup {
        seed: Vec<PanelKey>,
        reply_tx: oneshot::Sender<SubgroupId>,
    },

    /// Ask whether a group is currently live
    LookupSubgroup {
        group: SubgroupId,
        reply_tx: oneshot::Sender<bool>,
    },

    /// A round did not complete in time (internal)
    RoundTimedOut { group: SubgroupId },

    /// The batch of a group was accepted by the endpoint (internal)
    BatchAccepted { group: SubgroupId, handle: StreamHandle },

    /// The batch of a group could not be submitted (internal)
    BatchFailed { group: SubgroupId, error: StreamingError },

    /// An event arrived on a group's channel (internal)
    ChannelEvent { group: SubgroupId, event: RawEvent },

    /// A group's channel ended (internal)
    ChannelClosed { group: SubgroupId, reason: ChannelClose },

    /// Get current metrics
    GetMetrics {
        reply_tx: oneshot::Sender<StreamingMetrics>,
    },

    /// Shutdown the coordinator
    Shutdown,
}

/// Coordinator metrics for observability
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamingMetrics {
    pub open_groups: usize,
    /// Torn-down groups whose error is kept for late registrations
    pub failed_groups: usize,
    pub pending_slots: usize,
    pub batches_submitted: u64,
    pub batches_failed: u64,
    pub rounds_timed_out: u64,
    pub events_routed: u64,
    pub events_dropped: u64,
    pub decode_errors: u64,
}
