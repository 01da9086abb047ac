//! Core domain types: identifiers, requests and tagged events

mod event;
mod id;
mod request;

pub use event::{CLOSE_EVENT, DecodePolicy, Payload, TAG_PREFIX, TaggedEvent, parse_tag};
pub use id::{PanelId, PanelKey, SubgroupId};
pub use request::{
    CONTENT_TYPE_FORM, CONTENT_TYPE_JSON, HttpMethod, PanelRequest, PreparedRequest, encode_args, is_json_content,
};
