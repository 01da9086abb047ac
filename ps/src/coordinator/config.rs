//! Coordinator configuration

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::StreamingError;

/// Streaming coordinator configuration (`streaming` section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Root endpoint of the batch service; absent disables streaming
    #[serde(rename = "root-url", default)]
    pub root_url: Option<String>,

    /// Channel buffer size for coordinator requests
    #[serde(rename = "channel-buffer", default = "default_channel_buffer")]
    pub channel_buffer: usize,

    /// Abandon a round still incomplete after this many milliseconds
    #[serde(rename = "ready-timeout-ms", default)]
    pub ready_timeout_ms: Option<u64>,

    /// Fail subscribers on a mid-stream channel error instead of completing them
    #[serde(rename = "surface-stream-errors", default)]
    pub surface_stream_errors: bool,

    /// Timeout for connecting and for the submission call
    #[serde(rename = "request-timeout-ms", default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Opaque tag sent with every batch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Value>,
}

fn default_channel_buffer() -> usize {
    debug!("default_channel_buffer: called");
    1000
}

fn default_request_timeout_ms() -> u64 {
    debug!("default_request_timeout_ms: called");
    30_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        debug!("CoordinatorConfig::default: called");
        Self {
            root_url: None,
            channel_buffer: 1000,
            ready_timeout_ms: None,
            surface_stream_errors: false,
            request_timeout_ms: 30_000,
            tag: None,
        }
    }
}

impl CoordinatorConfig {
    /// Config with streaming enabled against `root_url`
    pub fn with_root(root_url: impl Into<String>) -> Self {
        Self {
            root_url: Some(root_url.into()),
            ..Default::default()
        }
    }

    /// Parsed root endpoint; `None` when streaming is disabled
    pub fn root(&self) -> Result<Option<Url>, StreamingError> {
        debug!(root_url = ?self.root_url, "CoordinatorConfig::root: called");
        match self.root_url.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => Ok(Some(Url::parse(raw)?)),
        }
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
