//! Panel requests and their wire form
//!
//! A [`PanelRequest`] is what a panel adapter produces. Before it enters an
//! aggregation round it is turned into a [`PreparedRequest`]: the body is
//! encoded according to method and content type and the item takes the shape
//! expected by the batch endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::form_urlencoded;

use super::event::DecodePolicy;
use super::id::{PanelId, PanelKey};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded; charset=UTF-8";

/// HTTP method used by the backend request a panel wants performed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
}

/// A request registered by one panel query
#[derive(Debug, Clone, PartialEq)]
pub struct PanelRequest {
    pub key: PanelKey,
    /// `None` means the panel has nothing to fetch (opt-out sentinel)
    pub url: Option<String>,
    pub method: HttpMethod,
    /// Structured arguments, encoded at preparation time
    pub body: Option<Value>,
    pub content_type: String,
    pub decode_as_base64: bool,
    /// The backend itself streams several events for this request
    pub is_server_pushed: bool,
    /// Read the data produced for another panel instead of fetching a URL
    pub read_from: Option<PanelId>,
}

impl PanelRequest {
    /// A GET request for the given key
    pub fn get(key: impl Into<PanelKey>, url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: Some(url.into()),
            method: HttpMethod::Get,
            body: None,
            content_type: CONTENT_TYPE_JSON.to_string(),
            decode_as_base64: false,
            is_server_pushed: false,
            read_from: None,
        }
    }

    /// The "nothing to fetch" sentinel; it still fills the key's slot
    pub fn opt_out(key: impl Into<PanelKey>) -> Self {
        Self {
            url: None,
            ..Self::get(key, String::new())
        }
    }

    /// Request the data of another panel of the same batch
    pub fn from_panel(key: impl Into<PanelKey>, source: PanelId) -> Self {
        Self {
            url: None,
            read_from: Some(source),
            ..Self::get(key, String::new())
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn base64(mut self) -> Self {
        self.decode_as_base64 = true;
        self
    }

    pub fn server_pushed(mut self) -> Self {
        self.is_server_pushed = true;
        self
    }

    pub fn is_opt_out(&self) -> bool {
        self.url.is_none() && self.read_from.is_none()
    }

    /// Encode the body and produce the batch item
    ///
    /// GET bodies are moved into the query string, JSON bodies are serialized
    /// and anything else is form-encoded. Opt-out and other-panel requests
    /// carry an empty body.
    pub fn prepare(&self) -> PreparedRequest {
        let mut url = self.url.clone();
        let body = match (url.as_mut(), &self.body) {
            (Some(url), Some(args)) if self.method == HttpMethod::Get => {
                let encoded = encode_args(args);
                if !encoded.is_empty() {
                    url.push(if url.contains('?') { '&' } else { '?' });
                    url.push_str(&encoded);
                }
                String::new()
            }
            (Some(_), Some(args)) if is_json_content(&self.content_type) => args.to_string(),
            (Some(_), Some(args)) => encode_args(args),
            _ => String::new(),
        };

        PreparedRequest {
            panel: self.key.panel,
            query: self.key.query,
            read_from: self.read_from,
            url,
            method: self.method,
            body,
            content_type: self.content_type.clone(),
            decode_as_base64: self.decode_as_base64,
            is_server_pushed: self.is_server_pushed,
        }
    }
}

/// One request item as enumerated in the batch submission body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedRequest {
    #[serde(rename = "tileId")]
    pub panel: PanelId,
    #[serde(rename = "queryIdx", default, skip_serializing_if = "is_zero")]
    pub query: u32,
    #[serde(rename = "otherTileId", default, skip_serializing_if = "Option::is_none")]
    pub read_from: Option<PanelId>,
    #[serde(default)]
    pub url: Option<String>,
    pub method: HttpMethod,
    pub body: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    #[serde(rename = "base64EncodeResult", default, skip_serializing_if = "is_false")]
    pub decode_as_base64: bool,
    #[serde(rename = "isEventSource", default, skip_serializing_if = "is_false")]
    pub is_server_pushed: bool,
}

impl PreparedRequest {
    pub fn key(&self) -> PanelKey {
        PanelKey::new(self.panel, self.query)
    }

    pub fn is_opt_out(&self) -> bool {
        self.url.is_none() && self.read_from.is_none()
    }

    pub fn decode_policy(&self) -> DecodePolicy {
        DecodePolicy::for_request(&self.content_type, self.decode_as_base64)
    }
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Whether a content type denotes JSON (parameters such as charset ignored)
pub fn is_json_content(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|mime| mime.trim().eq_ignore_ascii_case(CONTENT_TYPE_JSON))
        .unwrap_or(false)
}

/// Form-encode structured arguments
///
/// Object members become `key=value` pairs, array members repeat the key and
/// `null` encodes as an empty value. A bare string is taken as already encoded.
pub fn encode_args(args: &Value) -> String {
    match args {
        Value::Object(members) => {
            let mut serializer = form_urlencoded::Serializer::new(String::new());
            for (name, value) in members {
                match value {
                    Value::Array(items) => {
                        for item in items {
                            serializer.append_pair(name, &arg_value(item));
                        }
                    }
                    other => {
                        serializer.append_pair(name, &arg_value(other));
                    }
                }
            }
            serializer.finish()
        }
        Value::String(raw) => raw.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn arg_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(p: u32) -> PanelKey {
        PanelKey::single(PanelId(p))
    }

    #[test]
    fn test_get_body_moves_into_query_string() {
        let req = PanelRequest::get(key(1), "http://backend/freqs").with_body(json!({"q": "a b", "n": 10}));
        let prepared = req.prepare();
        assert_eq!(prepared.url.as_deref(), Some("http://backend/freqs?n=10&q=a+b"));
        assert_eq!(prepared.body, "");
    }

    #[test]
    fn test_get_body_appends_to_existing_query() {
        let req = PanelRequest::get(key(1), "http://backend/freqs?corp=syn").with_body(json!({"q": "x"}));
        assert_eq!(
            req.prepare().url.as_deref(),
            Some("http://backend/freqs?corp=syn&q=x")
        );
    }

    #[test]
    fn test_post_json_body_serialized() {
        let req = PanelRequest::get(key(2), "http://backend/conc")
            .with_method(HttpMethod::Post)
            .with_body(json!({"query": "house"}));
        let prepared = req.prepare();
        assert_eq!(prepared.body, r#"{"query":"house"}"#);
        assert_eq!(prepared.url.as_deref(), Some("http://backend/conc"));
    }

    #[test]
    fn test_post_form_body_encoded() {
        let req = PanelRequest::get(key(2), "http://backend/conc")
            .with_method(HttpMethod::Post)
            .with_content_type(CONTENT_TYPE_FORM)
            .with_body(json!({"attr": ["word", "lemma"], "empty": null}));
        assert_eq!(req.prepare().body, "attr=word&attr=lemma&empty=");
    }

    #[test]
    fn test_opt_out_has_no_url_and_empty_body() {
        let req = PanelRequest::opt_out(key(3)).with_body(json!({"ignored": true}));
        assert!(req.is_opt_out());
        let prepared = req.prepare();
        assert!(prepared.is_opt_out());
        assert_eq!(prepared.url, None);
        assert_eq!(prepared.body, "");
    }

    #[test]
    fn test_other_panel_request_is_not_opt_out() {
        let req = PanelRequest::from_panel(key(4), PanelId(1));
        assert!(!req.is_opt_out());
        assert_eq!(req.prepare().read_from, Some(PanelId(1)));
    }

    #[test]
    fn test_prepared_request_wire_shape() {
        let prepared = PanelRequest::get(PanelKey::new(PanelId(5), 1), "http://b/x")
            .base64()
            .server_pushed()
            .prepare();
        let json = serde_json::to_value(&prepared).unwrap();
        assert_eq!(json["tileId"], 5);
        assert_eq!(json["queryIdx"], 1);
        assert_eq!(json["method"], "GET");
        assert_eq!(json["contentType"], "application/json");
        assert_eq!(json["base64EncodeResult"], true);
        assert_eq!(json["isEventSource"], true);
        assert!(json.get("otherTileId").is_none());
    }

    #[test]
    fn test_opt_out_serializes_null_url() {
        let json = serde_json::to_value(PanelRequest::opt_out(key(9)).prepare()).unwrap();
        assert!(json["url"].is_null());
        assert!(json.get("queryIdx").is_none());
        assert!(json.get("base64EncodeResult").is_none());
    }

    #[test]
    fn test_is_json_content_ignores_parameters() {
        assert!(is_json_content("application/json"));
        assert!(is_json_content("Application/JSON; charset=utf-8"));
        assert!(!is_json_content(CONTENT_TYPE_FORM));
        assert!(!is_json_content("text/plain"));
    }
}
