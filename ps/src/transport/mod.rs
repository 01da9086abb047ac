//! Transport between the coordinator and the batch endpoint
//!
//! A completed batch is submitted with one call; the answer names a
//! server-pushed channel that carries the tagged data events of that batch.

mod http;
mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::domain::PreparedRequest;
use crate::error::StreamingError;

pub use http::HttpTransport;
pub use memory::{MemoryChannel, MemorySubmission, MemoryTransport};

/// Body of a batch submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchBody {
    pub requests: Vec<PreparedRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<Value>,
}

/// Answer of the batch endpoint
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct SubmitResponse {
    pub id: String,
}

/// Address of the channel belonging to one submitted batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub id: String,
    pub channel_url: Url,
}

impl StreamHandle {
    /// The channel lives at the stream id joined to the endpoint it was submitted to
    pub fn new(endpoint: &Url, id: impl Into<String>) -> Result<Self, StreamingError> {
        let id = id.into();
        let channel_url = join_endpoint(endpoint, &id)?;
        Ok(Self { id, channel_url })
    }
}

/// A named event as it arrived on the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub name: String,
    pub data: String,
}

impl RawEvent {
    pub fn new(name: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// One item read from a channel
///
/// The channel ends either with a `close` event, with an `Error` item or by
/// the stream simply ending (connection closed by the server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelItem {
    Message(RawEvent),
    Error(String),
}

pub type ChannelStream = BoxStream<'static, ChannelItem>;

/// Batch submission and channel opening
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit one batch; transport failures and non-2xx answers are errors
    async fn submit(&self, endpoint: &Url, body: &BatchBody) -> Result<StreamHandle, StreamingError>;

    /// Open the server-pushed channel of a submitted batch
    async fn open_channel(&self, handle: &StreamHandle) -> Result<ChannelStream, StreamingError>;
}

/// Join a path segment below `root`, treating `root` as a directory
pub fn join_endpoint(root: &Url, segment: &str) -> Result<Url, StreamingError> {
    let mut base = root.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(segment)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PanelId, PanelKey, PanelRequest};

    #[test]
    fn test_join_endpoint_adds_directory_slash() {
        let root = Url::parse("http://localhost:8080/data-stream").unwrap();
        let joined = join_endpoint(&root, "abc").unwrap();
        assert_eq!(joined.as_str(), "http://localhost:8080/data-stream/abc");

        let root = Url::parse("http://localhost:8080/data-stream/").unwrap();
        let joined = join_endpoint(&root, "abc").unwrap();
        assert_eq!(joined.as_str(), "http://localhost:8080/data-stream/abc");
    }

    #[test]
    fn test_join_endpoint_nests_subgroups() {
        let root = Url::parse("http://localhost/ds").unwrap();
        let sub = join_endpoint(&root, "sg-2").unwrap();
        let channel = StreamHandle::new(&sub, "42").unwrap();
        assert_eq!(channel.channel_url.as_str(), "http://localhost/ds/sg-2/42");
        assert_eq!(channel.id, "42");
    }

    #[test]
    fn test_batch_body_shape() {
        let body = BatchBody {
            requests: vec![
                PanelRequest::get(PanelKey::single(PanelId(0)), "http://b/x").prepare(),
                PanelRequest::opt_out(PanelKey::single(PanelId(1))).prepare(),
            ],
            tag: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["requests"].as_array().unwrap().len(), 2);
        assert!(json.get("tag").is_none());
        assert_eq!(json["requests"][1]["tileId"], 1);
        assert!(json["requests"][1]["url"].is_null());

        let tagged = BatchBody {
            requests: Vec::new(),
            tag: Some(serde_json::json!({"q": "house"})),
        };
        let json = serde_json::to_value(&tagged).unwrap();
        assert_eq!(json["tag"]["q"], "house");
    }
}
