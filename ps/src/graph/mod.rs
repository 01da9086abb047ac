//! Panel dependency graph
//!
//! Built once per page load from the resolved panel configuration. Each panel
//! knows the panels it must wait for (its blocking set) and the panels whose
//! results it reads as subqueries. Subquery providers are always part of the
//! blocking set: a panel cannot read results that do not exist yet.
//!
//! Construction validates the configuration and fails fast on:
//! - duplicate panels
//! - references to panels that are not configured
//! - panels that need upstream data but declare nothing to wait for
//! - panels reading another panel's data from outside the main round
//! - cycles in the blocking relation

mod activation;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use thiserror::Error;
use tracing::debug;

use crate::config::PanelConf;
use crate::domain::{PanelId, PanelKey};

pub use activation::ActivationTracker;

/// Configuration errors of the dependency graph; fatal at startup
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("Duplicate panel: {0}")]
    DuplicatePanel(String),

    #[error("Panel {panel} references unknown panel {reference}")]
    UnknownReference { panel: String, reference: String },

    #[error("Panel {0} cannot build its request on its own and waits for no other panel")]
    NotSelfSufficient(String),

    #[error("Panel {panel} reads the data of {mirrored}, but both must start in the main round")]
    SplitMirror { panel: String, mirrored: String },

    #[error("Dependency cycle detected: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// One panel and its dependency declarations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelNode {
    pub id: PanelId,
    pub name: String,
    /// Number of queries the panel runs (at least 1)
    pub queries: u32,
    pub blocking_on: BTreeSet<PanelId>,
    pub subquery_providers: BTreeSet<PanelId>,
    /// Panel whose data the server forwards to this panel
    pub read_data_from: Option<PanelId>,
    /// The panel can build its own request without upstream data
    pub self_sufficient: bool,
}

impl PanelNode {
    pub fn new(id: PanelId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            queries: 1,
            blocking_on: BTreeSet::new(),
            subquery_providers: BTreeSet::new(),
            read_data_from: None,
            self_sufficient: true,
        }
    }

    pub fn wait_for(mut self, panels: impl IntoIterator<Item = PanelId>) -> Self {
        self.blocking_on.extend(panels);
        self
    }

    pub fn read_subq_from(mut self, panels: impl IntoIterator<Item = PanelId>) -> Self {
        for panel in panels {
            self.subquery_providers.insert(panel);
            self.blocking_on.insert(panel);
        }
        self
    }

    pub fn with_queries(mut self, queries: u32) -> Self {
        self.queries = queries.max(1);
        self
    }

    pub fn needs_upstream(mut self) -> Self {
        self.self_sufficient = false;
        self
    }

    /// Keys of all queries of this panel
    pub fn keys(&self) -> Vec<PanelKey> {
        PanelKey::all_of(self.id, self.queries)
    }
}

/// Immutable dependency structure of one page session
#[derive(Debug, Clone)]
pub struct PanelDependencyGraph {
    nodes: BTreeMap<PanelId, PanelNode>,
}

impl PanelDependencyGraph {
    /// Build and validate a graph from explicit nodes
    pub fn new(nodes: impl IntoIterator<Item = PanelNode>) -> Result<Self, GraphError> {
        let mut map = BTreeMap::new();
        let mut names = HashSet::new();
        for node in nodes {
            if !names.insert(node.name.clone()) || map.contains_key(&node.id) {
                return Err(GraphError::DuplicatePanel(node.name));
            }
            map.insert(node.id, node);
        }
        let graph = Self { nodes: map };
        graph.validate()?;
        debug!(panel_count = graph.nodes.len(), "PanelDependencyGraph::new: validated");
        Ok(graph)
    }

    /// Build a graph from panel configurations
    ///
    /// Panel ids are assigned in declaration order. `wait-for` and
    /// `read-subq-from` both contribute to the blocking set.
    pub fn from_config(panels: &[PanelConf]) -> Result<Self, GraphError> {
        debug!(panel_count = panels.len(), "PanelDependencyGraph::from_config: called");
        let mut ids: HashMap<&str, PanelId> = HashMap::new();
        for (idx, conf) in panels.iter().enumerate() {
            if ids.insert(conf.name.as_str(), PanelId(idx as u32)).is_some() {
                return Err(GraphError::DuplicatePanel(conf.name.clone()));
            }
        }

        let resolve = |panel: &PanelConf, reference: &str| {
            ids.get(reference).copied().ok_or_else(|| GraphError::UnknownReference {
                panel: panel.name.clone(),
                reference: reference.to_string(),
            })
        };

        let mut nodes = Vec::with_capacity(panels.len());
        for (idx, conf) in panels.iter().enumerate() {
            let wait_for = conf
                .wait_for
                .iter()
                .map(|r| resolve(conf, r))
                .collect::<Result<Vec<_>, _>>()?;
            let subq = conf
                .read_subq_from
                .iter()
                .map(|r| resolve(conf, r))
                .collect::<Result<Vec<_>, _>>()?;
            let mut node = PanelNode::new(PanelId(idx as u32), conf.name.clone())
                .wait_for(wait_for)
                .read_subq_from(subq)
                .with_queries(conf.queries);
            node.self_sufficient = conf.self_sufficient;
            if let Some(source) = &conf.read_data_from {
                node.read_data_from = Some(resolve(conf, source)?);
            }
            nodes.push(node);
        }

        Self::new(nodes)
    }

    fn validate(&self) -> Result<(), GraphError> {
        for node in self.nodes.values() {
            let referenced = node
                .blocking_on
                .iter()
                .chain(node.subquery_providers.iter())
                .chain(node.read_data_from.iter());
            for dep in referenced {
                if !self.nodes.contains_key(dep) {
                    return Err(GraphError::UnknownReference {
                        panel: node.name.clone(),
                        reference: dep.to_string(),
                    });
                }
            }
            if !node.self_sufficient && node.blocking_on.is_empty() {
                return Err(GraphError::NotSelfSufficient(node.name.clone()));
            }
            // the server resolves `otherTileId` within one batch only, and every
            // panel outside the main round gets a batch of its own
            if let Some(source) = node.read_data_from {
                let source_blocked = self.nodes.get(&source).is_some_and(|n| !n.blocking_on.is_empty());
                if source == node.id || !node.blocking_on.is_empty() || source_blocked {
                    return Err(GraphError::SplitMirror {
                        panel: node.name.clone(),
                        mirrored: self.name_of(source),
                    });
                }
            }
        }
        self.check_cycles().map_err(GraphError::Cycle)
    }

    /// DFS cycle detection over the blocking relation
    fn check_cycles(&self) -> Result<(), Vec<String>> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut cycle_path = Vec::new();

        for id in self.nodes.keys() {
            if !visited.contains(id) && self.has_cycle_dfs(*id, &mut visited, &mut rec_stack, &mut cycle_path) {
                debug!(?cycle_path, "check_cycles: cycle detected");
                return Err(cycle_path);
            }
        }
        Ok(())
    }

    fn has_cycle_dfs(
        &self,
        id: PanelId,
        visited: &mut HashSet<PanelId>,
        rec_stack: &mut HashSet<PanelId>,
        cycle_path: &mut Vec<String>,
    ) -> bool {
        visited.insert(id);
        rec_stack.insert(id);
        cycle_path.push(self.name_of(id));

        if let Some(node) = self.nodes.get(&id) {
            for dep in &node.blocking_on {
                if !visited.contains(dep) {
                    if self.has_cycle_dfs(*dep, visited, rec_stack, cycle_path) {
                        return true;
                    }
                } else if rec_stack.contains(dep) {
                    cycle_path.push(self.name_of(*dep));
                    return true;
                }
            }
        }

        rec_stack.remove(&id);
        cycle_path.pop();
        false
    }

    fn name_of(&self, id: PanelId) -> String {
        self.nodes
            .get(&id)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// Panels that must finish before `panel` may build its request
    pub fn blocking_panels(&self, panel: PanelId) -> BTreeSet<PanelId> {
        self.nodes.get(&panel).map(|n| n.blocking_on.clone()).unwrap_or_default()
    }

    /// Panels whose results `panel` reads as subqueries
    pub fn subquery_providers(&self, panel: PanelId) -> BTreeSet<PanelId> {
        self.nodes
            .get(&panel)
            .map(|n| n.subquery_providers.clone())
            .unwrap_or_default()
    }

    /// Panels that block nothing but wait on `panel`
    pub fn dependents_of(&self, panel: PanelId) -> Vec<PanelId> {
        self.nodes
            .values()
            .filter(|n| n.blocking_on.contains(&panel))
            .map(|n| n.id)
            .collect()
    }

    pub fn node(&self, panel: PanelId) -> Option<&PanelNode> {
        self.nodes.get(&panel)
    }

    pub fn id_of(&self, name: &str) -> Option<PanelId> {
        self.nodes.values().find(|n| n.name == name).map(|n| n.id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PanelNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Panels with an empty blocking set; they form the main round
    pub fn initial_panels(&self) -> Vec<PanelId> {
        self.nodes
            .values()
            .filter(|n| n.blocking_on.is_empty())
            .map(|n| n.id)
            .collect()
    }

    /// Aggregation keys of the main round
    pub fn initial_keys(&self) -> Vec<PanelKey> {
        self.initial_panels()
            .into_iter()
            .filter_map(|id| self.nodes.get(&id))
            .flat_map(|n| n.keys())
            .collect()
    }

    /// Panels ordered so that every panel follows all of its blocking panels
    pub fn activation_order(&self) -> Vec<PanelId> {
        let mut visited = HashSet::new();
        let mut result = Vec::with_capacity(self.nodes.len());
        for id in self.nodes.keys() {
            self.topo_dfs(*id, &mut visited, &mut result);
        }
        result
    }

    fn topo_dfs(&self, id: PanelId, visited: &mut HashSet<PanelId>, result: &mut Vec<PanelId>) {
        if !visited.insert(id) {
            return;
        }
        if let Some(node) = self.nodes.get(&id) {
            for dep in &node.blocking_on {
                self.topo_dfs(*dep, visited, result);
            }
        }
        result.push(id);
    }

    /// Fresh tracker for one page session
    pub fn tracker(&self) -> ActivationTracker {
        ActivationTracker::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(id: u32) -> PanelId {
        PanelId(id)
    }

    fn conf(name: &str) -> PanelConf {
        PanelConf {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_lookup_sets() {
        let graph = PanelDependencyGraph::new(vec![
            PanelNode::new(p(0), "conc"),
            PanelNode::new(p(1), "freqs").wait_for([p(0)]),
            PanelNode::new(p(2), "colls").read_subq_from([p(0)]).wait_for([p(1)]),
        ])
        .unwrap();

        assert!(graph.blocking_panels(p(0)).is_empty());
        assert_eq!(graph.blocking_panels(p(2)), BTreeSet::from([p(0), p(1)]));
        assert_eq!(graph.subquery_providers(p(2)), BTreeSet::from([p(0)]));
        assert!(graph.subquery_providers(p(1)).is_empty());
        assert!(graph.blocking_panels(p(42)).is_empty());
        assert_eq!(graph.dependents_of(p(0)), vec![p(1), p(2)]);
    }

    #[test]
    fn test_cycle_detection_with_cycle() {
        let result = PanelDependencyGraph::new(vec![
            PanelNode::new(p(0), "a").wait_for([p(2)]),
            PanelNode::new(p(1), "b").wait_for([p(0)]),
            PanelNode::new(p(2), "c").wait_for([p(1)]),
        ]);
        match result {
            Err(GraphError::Cycle(path)) => {
                assert!(path.len() >= 2);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("Expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_detection_self_cycle() {
        let result = PanelDependencyGraph::new(vec![PanelNode::new(p(0), "a").wait_for([p(0)])]);
        assert!(matches!(result, Err(GraphError::Cycle(_))));
    }

    #[test]
    fn test_unknown_reference() {
        let result = PanelDependencyGraph::new(vec![PanelNode::new(p(0), "a").wait_for([p(9)])]);
        assert!(matches!(result, Err(GraphError::UnknownReference { .. })));
    }

    #[test]
    fn test_not_self_sufficient_without_blockers() {
        let result = PanelDependencyGraph::new(vec![PanelNode::new(p(0), "a").needs_upstream()]);
        assert_eq!(result.unwrap_err(), GraphError::NotSelfSufficient("a".to_string()));

        // the same panel is fine once it waits for someone
        let graph = PanelDependencyGraph::new(vec![
            PanelNode::new(p(0), "a"),
            PanelNode::new(p(1), "b").needs_upstream().read_subq_from([p(0)]),
        ]);
        assert!(graph.is_ok());
    }

    #[test]
    fn test_duplicate_panel() {
        let result = PanelDependencyGraph::new(vec![PanelNode::new(p(0), "a"), PanelNode::new(p(1), "a")]);
        assert_eq!(result.unwrap_err(), GraphError::DuplicatePanel("a".to_string()));
    }

    #[test]
    fn test_activation_order_respects_blockers() {
        let graph = PanelDependencyGraph::new(vec![
            PanelNode::new(p(0), "late").wait_for([p(1)]),
            PanelNode::new(p(1), "middle").wait_for([p(2)]),
            PanelNode::new(p(2), "first"),
        ])
        .unwrap();
        let order = graph.activation_order();
        let pos = |id| order.iter().position(|x| *x == id).unwrap();
        assert_eq!(order.len(), 3);
        assert!(pos(p(2)) < pos(p(1)));
        assert!(pos(p(1)) < pos(p(0)));
    }

    #[test]
    fn test_initial_keys_expand_queries() {
        let graph = PanelDependencyGraph::new(vec![
            PanelNode::new(p(0), "cmp").with_queries(2),
            PanelNode::new(p(1), "single"),
            PanelNode::new(p(2), "blocked").wait_for([p(1)]),
        ])
        .unwrap();
        assert_eq!(
            graph.initial_keys(),
            vec![
                PanelKey::new(p(0), 0),
                PanelKey::new(p(0), 1),
                PanelKey::single(p(1))
            ]
        );
    }

    #[test]
    fn test_from_config_assigns_ids_in_order() {
        let mut freqs = conf("freqs");
        freqs.wait_for = vec!["conc".to_string()];
        let mut colls = conf("colls");
        colls.read_subq_from = vec!["conc".to_string()];
        colls.wait_for = vec!["conc".to_string()];
        let graph = PanelDependencyGraph::from_config(&[conf("conc"), freqs, colls]).unwrap();

        assert_eq!(graph.id_of("conc"), Some(p(0)));
        assert_eq!(graph.id_of("colls"), Some(p(2)));
        // duplicates between wait-for and read-subq-from collapse
        assert_eq!(graph.blocking_panels(p(2)), BTreeSet::from([p(0)]));
        assert_eq!(graph.subquery_providers(p(2)), BTreeSet::from([p(0)]));
    }

    #[test]
    fn test_from_config_unknown_name() {
        let mut freqs = conf("freqs");
        freqs.wait_for = vec!["missing".to_string()];
        let err = PanelDependencyGraph::from_config(&[freqs]).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownReference {
                panel: "freqs".to_string(),
                reference: "missing".to_string()
            }
        );
    }

    #[test]
    fn test_from_config_cycle_reports_names() {
        let mut a = conf("a");
        a.wait_for = vec!["b".to_string()];
        let mut b = conf("b");
        b.wait_for = vec!["a".to_string()];
        let err = PanelDependencyGraph::from_config(&[a, b]).unwrap_err();
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn test_from_config_read_data_from() {
        let mut mirror = conf("mirror");
        mirror.read_data_from = Some("conc".to_string());
        let graph = PanelDependencyGraph::from_config(&[conf("conc"), mirror]).unwrap();
        let node = graph.node(p(1)).unwrap();
        assert_eq!(node.read_data_from, Some(p(0)));
        assert!(node.blocking_on.is_empty());
    }

    #[test]
    fn test_mirror_must_share_the_main_round() {
        let mut late = conf("late");
        late.wait_for = vec!["conc".to_string()];

        // blocked source
        let mut mirror = conf("mirror");
        mirror.read_data_from = Some("late".to_string());
        let err = PanelDependencyGraph::from_config(&[conf("conc"), late.clone(), mirror]).unwrap_err();
        assert_eq!(
            err,
            GraphError::SplitMirror {
                panel: "mirror".to_string(),
                mirrored: "late".to_string()
            }
        );

        // blocked mirror
        let mut mirror = conf("mirror");
        mirror.read_data_from = Some("conc".to_string());
        mirror.wait_for = vec!["late".to_string()];
        let err = PanelDependencyGraph::from_config(&[conf("conc"), late, mirror]).unwrap_err();
        assert!(matches!(err, GraphError::SplitMirror { .. }));

        // reading itself
        let mut mirror = conf("mirror");
        mirror.read_data_from = Some("mirror".to_string());
        assert!(matches!(
            PanelDependencyGraph::from_config(&[mirror]),
            Err(GraphError::SplitMirror { .. })
        ));
    }
}
