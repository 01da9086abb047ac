//! Streaming error types

use std::time::Duration;

use thiserror::Error;

use crate::domain::{PanelKey, SubgroupId};

/// Errors delivered to panels or returned by the coordinator API
///
/// The type is `Clone` because a single batch failure is fanned out to every
/// panel of that batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamingError {
    #[error("Batch submission failed with status {status}: {message}")]
    SubmitStatus { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    #[error("Failed to process response for panel {key}: {message}")]
    Decode { key: PanelKey, message: String },

    #[error("Backend reported an error for panel {key}: {message}")]
    Backend { key: PanelKey, message: String },

    #[error("Panel {key} is not expected in group {group}")]
    UnexpectedPanel { group: SubgroupId, key: PanelKey },

    #[error("Group {group} was not complete after {timeout:?}")]
    RoundTimeout { group: SubgroupId, timeout: Duration },

    #[error("Data channel of group {group} interrupted: {message}")]
    ChannelInterrupted { group: SubgroupId, message: String },

    #[error("Subgroup {0} does not exist")]
    UnknownSubgroup(SubgroupId),

    #[error("Coordinator channel closed")]
    CoordinatorClosed,
}

impl StreamingError {
    /// Whether the error hit every panel of a batch rather than one panel
    pub fn is_batch_wide(&self) -> bool {
        match self {
            StreamingError::SubmitStatus { .. } => true,
            StreamingError::Transport(_) => true,
            StreamingError::InvalidResponse(_) => true,
            StreamingError::InvalidUrl(_) => true,
            StreamingError::RoundTimeout { .. } => true,
            StreamingError::ChannelInterrupted { .. } => true,
            StreamingError::Decode { .. } => false,
            StreamingError::Backend { .. } => false,
            StreamingError::UnexpectedPanel { .. } => false,
            StreamingError::UnknownSubgroup(_) => false,
            StreamingError::CoordinatorClosed => false,
        }
    }

    /// The panel query the error is scoped to, if any
    pub fn key(&self) -> Option<PanelKey> {
        match self {
            StreamingError::Decode { key, .. }
            | StreamingError::Backend { key, .. }
            | StreamingError::UnexpectedPanel { key, .. } => Some(*key),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for StreamingError {
    fn from(e: reqwest::Error) -> Self {
        StreamingError::Transport(e.to_string())
    }
}

impl From<url::ParseError> for StreamingError {
    fn from(e: url::ParseError) -> Self {
        StreamingError::InvalidUrl(e.to_string())
    }
}
