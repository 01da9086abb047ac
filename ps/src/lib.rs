//! panelstream - request aggregation and stream demultiplexing for panel pages
//!
//! A page of panels answers one user query. Rather than each panel calling its
//! backend on its own, every panel registers its request with a coordinator.
//! Once all expected panels have registered, the coordinator submits them in a
//! single batch and routes the streamed, tagged answers back to the panel
//! that asked. Panels that need other panels' results start later, each in
//! its own subgroup.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod graph;
pub mod panels;
pub mod session;
pub mod transport;

pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorConfig, PanelRequestRegistry, PanelStream};
pub use domain::{PanelId, PanelKey, PanelRequest, Payload, SubgroupId};
pub use error::StreamingError;
pub use graph::{GraphError, PanelDependencyGraph};
pub use session::{PageSession, PanelUpdate};
pub use transport::{HttpTransport, MemoryTransport, Transport};
