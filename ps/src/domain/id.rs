//! Panel, query and subgroup identifiers

use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric panel identifier
///
/// Identifiers are assigned in configuration declaration order, starting at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PanelId(pub u32);

impl PanelId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PanelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PanelId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// One query of one panel
///
/// Single-query panels always use query index 0. The key is the unit of
/// aggregation (one slot per key in a round) and of routing (one subscription
/// set per key on a channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PanelKey {
    pub panel: PanelId,
    pub query: u32,
}

impl PanelKey {
    pub fn new(panel: PanelId, query: u32) -> Self {
        Self { panel, query }
    }

    /// Key of a single-query panel
    pub fn single(panel: PanelId) -> Self {
        Self { panel, query: 0 }
    }

    /// All keys of a panel running `queries` queries
    pub fn all_of(panel: PanelId, queries: u32) -> Vec<Self> {
        (0..queries.max(1)).map(|query| Self { panel, query }).collect()
    }
}

impl From<PanelId> for PanelKey {
    fn from(panel: PanelId) -> Self {
        Self::single(panel)
    }
}

impl fmt::Display for PanelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.query == 0 {
            write!(f, "{}", self.panel)
        } else {
            write!(f, "{}.{}", self.panel, self.query)
        }
    }
}

/// Identifier of an aggregation group
///
/// Group 0 is the main page-load group; subgroups are numbered from 1 upwards
/// and an id is never handed out twice within one coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubgroupId(pub u64);

impl SubgroupId {
    pub const MAIN: SubgroupId = SubgroupId(0);

    pub fn is_main(&self) -> bool {
        self.0 == 0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Path segment under which this subgroup's root endpoint lives
    pub fn path_segment(&self) -> String {
        format!("sg-{}", self.0)
    }
}

impl fmt::Display for SubgroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_main() {
            write!(f, "__global__")
        } else {
            write!(f, "sg-{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panel_key_display() {
        assert_eq!(PanelKey::single(PanelId(7)).to_string(), "7");
        assert_eq!(PanelKey::new(PanelId(7), 2).to_string(), "7.2");
    }

    #[test]
    fn test_all_of_never_empty() {
        assert_eq!(PanelKey::all_of(PanelId(1), 0), vec![PanelKey::single(PanelId(1))]);
        assert_eq!(PanelKey::all_of(PanelId(1), 3).len(), 3);
    }

    #[test]
    fn test_subgroup_ids() {
        assert!(SubgroupId::MAIN.is_main());
        let next = SubgroupId::MAIN.next();
        assert!(!next.is_main());
        assert_eq!(next.to_string(), "sg-1");
        assert_eq!(SubgroupId::MAIN.to_string(), "__global__");
        assert!(next.next() > next);
    }
}
