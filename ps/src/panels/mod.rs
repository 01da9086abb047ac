//! Panel adapters
//!
//! An adapter turns the state of one panel, plus the results of the panels it
//! reads subqueries from, into the requests registered with the coordinator.
//! Adapters are opaque to the coordinator; the builtins here cover static
//! requests, disabled panels and panels that mirror another panel's data.

mod factory;

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::{PanelConf, RequestConf};
use crate::domain::{PanelId, PanelKey, PanelRequest, Payload};
use crate::graph::PanelNode;

pub use factory::{BUILTIN_PANELS, FactoryError, PanelConstructor, PanelFactoryTable};

/// Errors raised while an adapter builds its requests
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PanelError {
    #[error("Panel {0} needs upstream results but none arrived")]
    MissingUpstream(String),

    #[error("Panel {0} mirrors another panel but names no source")]
    MissingSource(String),

    #[error("Panel {panel} declares {requests} requests for {queries} queries")]
    TooManyRequests { panel: String, requests: usize, queries: u32 },
}

/// Results of the subquery providers of a panel, keyed by provider
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamData {
    results: BTreeMap<PanelId, Vec<Payload>>,
}

impl UpstreamData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, panel: PanelId, payloads: Vec<Payload>) {
        self.results.insert(panel, payloads);
    }

    pub fn get(&self, panel: PanelId) -> Option<&[Payload]> {
        self.results.get(&panel).map(Vec::as_slice)
    }

    /// No provider delivered anything
    pub fn is_empty(&self) -> bool {
        self.results.values().all(Vec::is_empty)
    }

    /// All provider payloads as one JSON array, providers in id order
    pub fn to_json(&self) -> Value {
        Value::Array(
            self.results
                .values()
                .flat_map(|payloads| payloads.iter().map(Payload::to_json))
                .collect(),
        )
    }
}

/// Builds the requests of one panel
pub trait PanelAdapter: Send + Sync {
    /// Name under which the adapter is registered
    fn panel_type(&self) -> &'static str;

    /// Requests for every query of `node`
    fn build_requests(&self, node: &PanelNode, upstream: &UpstreamData) -> Result<Vec<PanelRequest>, PanelError>;
}

/// Requests taken from configuration, one entry per query
///
/// When upstream results are available and a request body is a JSON object,
/// the results are added to it as `subqueries`.
pub struct StaticTile {
    requests: Vec<RequestConf>,
}

impl StaticTile {
    pub const TYPE: &'static str = "StaticTile";

    pub fn new(requests: Vec<RequestConf>) -> Self {
        Self { requests }
    }

    pub fn create(conf: &PanelConf) -> Box<dyn PanelAdapter> {
        Box::new(Self::new(conf.requests.clone()))
    }
}

impl PanelAdapter for StaticTile {
    fn panel_type(&self) -> &'static str {
        Self::TYPE
    }

    fn build_requests(&self, node: &PanelNode, upstream: &UpstreamData) -> Result<Vec<PanelRequest>, PanelError> {
        debug!(panel = %node.id, requests = self.requests.len(), "StaticTile::build_requests: called");
        if self.requests.len() > node.queries as usize {
            return Err(PanelError::TooManyRequests {
                panel: node.name.clone(),
                requests: self.requests.len(),
                queries: node.queries,
            });
        }
        if !node.self_sufficient && upstream.is_empty() {
            return Err(PanelError::MissingUpstream(node.name.clone()));
        }

        let subqueries = (!upstream.is_empty()).then(|| upstream.to_json());
        let requests = node
            .keys()
            .into_iter()
            .map(|key| {
                let Some(conf) = self.requests.get(key.query as usize) else {
                    return PanelRequest::opt_out(key);
                };
                let mut request = conf.to_request(key);
                if let (Some(subq), Some(Value::Object(body))) = (&subqueries, request.body.as_mut()) {
                    body.insert("subqueries".to_string(), subq.clone());
                }
                request
            })
            .collect();
        Ok(requests)
    }
}

/// A panel with nothing to fetch; every query opts out
pub struct EmptyTile;

impl EmptyTile {
    pub const TYPE: &'static str = "EmptyTile";

    pub fn create(_conf: &PanelConf) -> Box<dyn PanelAdapter> {
        Box::new(Self)
    }
}

impl PanelAdapter for EmptyTile {
    fn panel_type(&self) -> &'static str {
        Self::TYPE
    }

    fn build_requests(&self, node: &PanelNode, _upstream: &UpstreamData) -> Result<Vec<PanelRequest>, PanelError> {
        Ok(node.keys().into_iter().map(PanelRequest::opt_out).collect())
    }
}

/// Shows the data the server produced for another panel
pub struct MirrorTile;

impl MirrorTile {
    pub const TYPE: &'static str = "MirrorTile";

    pub fn create(_conf: &PanelConf) -> Box<dyn PanelAdapter> {
        Box::new(Self)
    }
}

impl PanelAdapter for MirrorTile {
    fn panel_type(&self) -> &'static str {
        Self::TYPE
    }

    fn build_requests(&self, node: &PanelNode, _upstream: &UpstreamData) -> Result<Vec<PanelRequest>, PanelError> {
        let source = node
            .read_data_from
            .ok_or_else(|| PanelError::MissingSource(node.name.clone()))?;
        Ok(node
            .keys()
            .into_iter()
            .map(|key: PanelKey| PanelRequest::from_panel(key, source))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HttpMethod;
    use serde_json::json;

    fn request_conf(url: &str, body: Option<Value>) -> RequestConf {
        RequestConf {
            url: Some(url.to_string()),
            method: HttpMethod::Post,
            body,
            content_type: crate::domain::CONTENT_TYPE_JSON.to_string(),
            base64: false,
            server_pushed: false,
        }
    }

    #[test]
    fn test_static_tile_pads_missing_queries() {
        let node = PanelNode::new(PanelId(0), "cmp").with_queries(2);
        let tile = StaticTile::new(vec![request_conf("http://b/0", None)]);
        let requests = tile.build_requests(&node, &UpstreamData::new()).unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].url.as_deref(), Some("http://b/0"));
        assert!(requests[1].is_opt_out());
        assert_eq!(requests[1].key, PanelKey::new(PanelId(0), 1));
    }

    #[test]
    fn test_static_tile_rejects_extra_requests() {
        let node = PanelNode::new(PanelId(0), "single");
        let tile = StaticTile::new(vec![request_conf("http://b/0", None), request_conf("http://b/1", None)]);
        assert!(matches!(
            tile.build_requests(&node, &UpstreamData::new()),
            Err(PanelError::TooManyRequests { .. })
        ));
    }

    #[test]
    fn test_static_tile_adds_subqueries() {
        let node = PanelNode::new(PanelId(2), "colls")
            .read_subq_from([PanelId(0)])
            .needs_upstream();
        let tile = StaticTile::new(vec![request_conf("http://b/colls", Some(json!({"attr": "word"})))]);

        let err = tile.build_requests(&node, &UpstreamData::new()).unwrap_err();
        assert_eq!(err, PanelError::MissingUpstream("colls".to_string()));

        let mut upstream = UpstreamData::new();
        upstream.insert(PanelId(0), vec![Payload::Json(json!({"lines": 3}))]);
        let requests = tile.build_requests(&node, &upstream).unwrap();
        assert_eq!(
            requests[0].body,
            Some(json!({"attr": "word", "subqueries": [{"lines": 3}]}))
        );
    }

    #[test]
    fn test_empty_tile_opts_out_every_query() {
        let node = PanelNode::new(PanelId(1), "off").with_queries(3);
        let requests = EmptyTile.build_requests(&node, &UpstreamData::new()).unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(PanelRequest::is_opt_out));
    }

    #[test]
    fn test_mirror_tile() {
        let mut node = PanelNode::new(PanelId(3), "mirror");
        assert!(MirrorTile.build_requests(&node, &UpstreamData::new()).is_err());

        node.read_data_from = Some(PanelId(0));
        let requests = MirrorTile.build_requests(&node, &UpstreamData::new()).unwrap();
        assert_eq!(requests[0].read_from, Some(PanelId(0)));
        assert!(!requests[0].is_opt_out());
    }

    #[test]
    fn test_upstream_json() {
        let mut upstream = UpstreamData::new();
        assert!(upstream.is_empty());
        upstream.insert(PanelId(1), vec![Payload::Text("b".to_string())]);
        upstream.insert(PanelId(0), vec![Payload::Text("a".to_string())]);
        assert!(!upstream.is_empty());
        assert_eq!(upstream.to_json(), json!(["a", "b"]));
        assert_eq!(upstream.get(PanelId(1)).map(|p| p.len()), Some(1));
    }
}
