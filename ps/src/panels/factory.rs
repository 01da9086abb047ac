//! Panel factory table
//!
//! Maps panel type names to adapter constructors. The table is an explicit
//! value built once at startup from the compile-time list of builtins.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use super::{EmptyTile, MirrorTile, PanelAdapter, StaticTile};
use crate::config::PanelConf;
use crate::domain::PanelId;

pub type PanelConstructor = fn(&PanelConf) -> Box<dyn PanelAdapter>;

/// Builtin panel implementations
pub const BUILTIN_PANELS: &[(&str, PanelConstructor)] = &[
    (StaticTile::TYPE, StaticTile::create),
    (EmptyTile::TYPE, EmptyTile::create),
    (MirrorTile::TYPE, MirrorTile::create),
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FactoryError {
    #[error("Panel type {0} is registered twice")]
    Collision(String),

    #[error("Panel {panel} has unknown type {panel_type}")]
    UnknownType { panel: String, panel_type: String },
}

/// Registry of panel constructors
pub struct PanelFactoryTable {
    factories: HashMap<String, PanelConstructor>,
}

impl PanelFactoryTable {
    /// Empty table
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Table holding the builtin panels
    pub fn builtin() -> Self {
        let factories = BUILTIN_PANELS
            .iter()
            .map(|(name, ctor)| (name.to_string(), *ctor))
            .collect();
        Self { factories }
    }

    /// Add a panel type; a name can be registered once
    pub fn register(&mut self, name: &str, ctor: PanelConstructor) -> Result<(), FactoryError> {
        debug!(%name, "PanelFactoryTable::register: called");
        if self.factories.contains_key(name) {
            return Err(FactoryError::Collision(name.to_string()));
        }
        self.factories.insert(name.to_string(), ctor);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Adapter for one configured panel; disabled panels get an [`EmptyTile`]
    pub fn create(&self, conf: &PanelConf) -> Result<Box<dyn PanelAdapter>, FactoryError> {
        if conf.disabled {
            debug!(panel = %conf.name, "PanelFactoryTable::create: disabled, using EmptyTile");
            return Ok(EmptyTile::create(conf));
        }
        let ctor = self
            .factories
            .get(&conf.panel_type)
            .ok_or_else(|| FactoryError::UnknownType {
                panel: conf.name.clone(),
                panel_type: conf.panel_type.clone(),
            })?;
        Ok(ctor(conf))
    }

    /// Adapters for all panels, keyed by the id given by declaration order
    pub fn build_all(&self, panels: &[PanelConf]) -> Result<HashMap<PanelId, Box<dyn PanelAdapter>>, FactoryError> {
        panels
            .iter()
            .enumerate()
            .map(|(idx, conf)| self.create(conf).map(|adapter| (PanelId(idx as u32), adapter)))
            .collect()
    }
}

impl Default for PanelFactoryTable {
    fn default() -> Self {
        Self::builtin()
    }
}
