//! Request aggregation and response demultiplexing
//!
//! The Coordinator is a single task owning every group of the page:
//! - **Round:** one-shot barrier collecting one request per expected key
//! - **Submission:** the completed batch goes out in one transport call
//! - **Demultiplexing:** channel events are routed back to the subscribed key
//!
//! Subgroups are independent (round, routing table) pairs with their own
//! endpoint, created for panels that can only start once others finished.

mod config;
mod core;
mod demux;
mod handle;
mod messages;
mod round;

pub use config::CoordinatorConfig;
pub use core::Coordinator;
pub use demux::{Demultiplexer, Routing};
pub use handle::{PanelRequestRegistry, PanelStream};
pub use messages::{ChannelClose, CoordRequest, StreamingMetrics, Subscriber};
pub use round::{AggregationRound, Batch, RoundCompletion, RoundState, SubmitOutcome};
