//! Tagged events and payload decoding
//!
//! The streamed channel carries named events. Data events are named
//! `DataTile-{panel}` or `DataTile-{panel}.{query}`; the sentinel `close`
//! ends the channel.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use super::id::{PanelId, PanelKey};
use super::request::is_json_content;
use crate::error::StreamingError;

pub const TAG_PREFIX: &str = "DataTile-";
pub const CLOSE_EVENT: &str = "close";

/// Parse an event name into the key it is addressed to
///
/// Returns `None` for names that are not data events.
pub fn parse_tag(name: &str) -> Option<PanelKey> {
    let rest = name.strip_prefix(TAG_PREFIX)?;
    match rest.split_once('.') {
        Some((panel, query)) => Some(PanelKey::new(
            PanelId(panel.parse().ok()?),
            query.parse().ok()?,
        )),
        None => Some(PanelKey::single(PanelId(rest.parse().ok()?))),
    }
}

impl PanelKey {
    /// Event name the server uses for this key
    pub fn event_name(&self) -> String {
        format!("{}{}", TAG_PREFIX, self)
    }
}

/// Decoded data delivered to a panel
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Bytes(Vec<u8>),
    Text(String),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// JSON view of the payload, used when handing data to dependent panels
    pub fn to_json(&self) -> Value {
        match self {
            Payload::Json(v) => v.clone(),
            Payload::Text(s) => Value::String(s.clone()),
            Payload::Bytes(b) => Value::String(STANDARD.encode(b)),
        }
    }
}

/// How the raw text of an event is turned into a [`Payload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodePolicy {
    Json,
    Base64,
    Text,
}

impl DecodePolicy {
    /// JSON content wins over base64, base64 over plain text
    pub fn for_request(content_type: &str, decode_as_base64: bool) -> Self {
        if is_json_content(content_type) {
            DecodePolicy::Json
        } else if decode_as_base64 {
            DecodePolicy::Base64
        } else {
            DecodePolicy::Text
        }
    }

    /// Decode event data addressed to `key`
    ///
    /// A JSON object carrying a non-null `error` member is reported as a
    /// backend error rather than data.
    pub fn decode(&self, key: PanelKey, data: &str) -> Result<Payload, StreamingError> {
        match self {
            DecodePolicy::Json => {
                let value: Value = serde_json::from_str(data).map_err(|e| StreamingError::Decode {
                    key,
                    message: e.to_string(),
                })?;
                if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
                    let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
                    return Err(StreamingError::Backend { key, message });
                }
                Ok(Payload::Json(value))
            }
            DecodePolicy::Base64 => STANDARD
                .decode(data.trim())
                .map(Payload::Bytes)
                .map_err(|e| StreamingError::Decode {
                    key,
                    message: e.to_string(),
                }),
            DecodePolicy::Text => Ok(Payload::Text(data.to_string())),
        }
    }
}

/// One decoded unit of data routed to a panel query
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub key: PanelKey,
    pub payload: Payload,
}
