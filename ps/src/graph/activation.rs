//! Activation tracking for one page session

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::PanelDependencyGraph;
use crate::domain::PanelId;

/// Tracks which panels may start, given which panels have finished
///
/// A panel becomes ready once every panel in its blocking set has finished,
/// successfully or not. Each panel is reported ready exactly once.
#[derive(Debug, Clone)]
pub struct ActivationTracker {
    waiting: BTreeMap<PanelId, BTreeSet<PanelId>>,
    activated: BTreeSet<PanelId>,
    finished: BTreeSet<PanelId>,
    total: usize,
}

impl ActivationTracker {
    pub fn new(graph: &PanelDependencyGraph) -> Self {
        let waiting: BTreeMap<_, _> = graph.nodes().map(|n| (n.id, n.blocking_on.clone())).collect();
        Self {
            total: waiting.len(),
            waiting,
            activated: BTreeSet::new(),
            finished: BTreeSet::new(),
        }
    }

    /// Panels that can start right away
    pub fn start(&mut self) -> Vec<PanelId> {
        self.take_ready()
    }

    /// Record that `panel` finished; returns the panels this unblocked
    pub fn mark_finished(&mut self, panel: PanelId) -> Vec<PanelId> {
        if !self.finished.insert(panel) {
            return Vec::new();
        }
        for blockers in self.waiting.values_mut() {
            blockers.remove(&panel);
        }
        let ready = self.take_ready();
        debug!(%panel, ?ready, "ActivationTracker::mark_finished: called");
        ready
    }

    fn take_ready(&mut self) -> Vec<PanelId> {
        let ready: Vec<PanelId> = self
            .waiting
            .iter()
            .filter(|(id, blockers)| blockers.is_empty() && !self.activated.contains(*id))
            .map(|(id, _)| *id)
            .collect();
        self.activated.extend(ready.iter().copied());
        ready
    }

    pub fn is_activated(&self, panel: PanelId) -> bool {
        self.activated.contains(&panel)
    }

    pub fn is_finished(&self, panel: PanelId) -> bool {
        self.finished.contains(&panel)
    }

    /// Every panel has finished
    pub fn is_done(&self) -> bool {
        self.finished.len() >= self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PanelNode;

    fn p(id: u32) -> PanelId {
        PanelId(id)
    }

    fn graph() -> PanelDependencyGraph {
        PanelDependencyGraph::new(vec![
            PanelNode::new(p(0), "conc"),
            PanelNode::new(p(1), "wlist"),
            PanelNode::new(p(2), "colls").read_subq_from([p(0)]),
            PanelNode::new(p(3), "both").wait_for([p(0), p(1)]),
        ])
        .unwrap()
    }

    #[test]
    fn test_start_returns_unblocked() {
        let mut tracker = graph().tracker();
        assert_eq!(tracker.start(), vec![p(0), p(1)]);
        assert!(tracker.start().is_empty());
        assert!(tracker.is_activated(p(0)));
        assert!(!tracker.is_activated(p(2)));
    }

    #[test]
    fn test_waits_for_all_blockers() {
        let mut tracker = graph().tracker();
        tracker.start();
        assert_eq!(tracker.mark_finished(p(0)), vec![p(2)]);
        assert_eq!(tracker.mark_finished(p(1)), vec![p(3)]);
        // repeated finish is a no-op
        assert!(tracker.mark_finished(p(1)).is_empty());
    }

    #[test]
    fn test_is_done() {
        let mut tracker = graph().tracker();
        tracker.start();
        for id in 0..4 {
            assert!(!tracker.is_done());
            tracker.mark_finished(p(id));
        }
        assert!(tracker.is_done());
        assert!(tracker.is_finished(p(3)));
    }
}
