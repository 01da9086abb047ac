//! panelstream configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::coordinator::CoordinatorConfig;
use crate::domain::{CONTENT_TYPE_JSON, HttpMethod, PanelKey, PanelRequest};
use crate::graph::PanelDependencyGraph;
use crate::panels::PanelFactoryTable;

/// Main panelstream configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Streaming coordinator configuration
    pub streaming: CoordinatorConfig,

    /// Panels of the page, in declaration order
    pub panels: Vec<PanelConf>,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Builds the dependency graph and the panel adapters so that cycles,
    /// unknown references and unknown panel types fail at startup.
    pub fn validate(&self) -> Result<()> {
        self.streaming.root().context("Invalid streaming root-url")?;
        PanelDependencyGraph::from_config(&self.panels).context("Invalid panel dependencies")?;
        PanelFactoryTable::builtin()
            .build_all(&self.panels)
            .context("Invalid panel configuration")?;
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .panelstream.yml
        let local_config = PathBuf::from(".panelstream.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/panelstream/panelstream.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("panelstream").join("panelstream.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// One panel of the page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelConf {
    pub name: String,

    /// Panel implementation, looked up in the factory table
    #[serde(rename = "type", default = "default_panel_type")]
    pub panel_type: String,

    /// Number of queries the panel runs
    #[serde(default = "default_queries")]
    pub queries: u32,

    /// Panels that must finish before this one starts
    #[serde(rename = "wait-for", default)]
    pub wait_for: Vec<String>,

    /// Panels whose results are passed to this one as subqueries
    #[serde(rename = "read-subq-from", default)]
    pub read_subq_from: Vec<String>,

    /// Panel whose data the server hands to this one
    #[serde(rename = "read-data-from", default)]
    pub read_data_from: Option<String>,

    #[serde(default)]
    pub disabled: bool,

    /// Whether the panel can build its request without upstream results
    #[serde(rename = "self-sufficient", default = "default_self_sufficient")]
    pub self_sufficient: bool,

    /// One entry per query
    #[serde(default)]
    pub requests: Vec<RequestConf>,
}

fn default_panel_type() -> String {
    "StaticTile".to_string()
}

fn default_queries() -> u32 {
    1
}

fn default_self_sufficient() -> bool {
    true
}

impl Default for PanelConf {
    fn default() -> Self {
        Self {
            name: String::new(),
            panel_type: default_panel_type(),
            queries: default_queries(),
            wait_for: Vec::new(),
            read_subq_from: Vec::new(),
            read_data_from: None,
            disabled: false,
            self_sufficient: default_self_sufficient(),
            requests: Vec::new(),
        }
    }
}

/// Backend request of one panel query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestConf {
    /// Absent means the query has nothing to fetch
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub method: HttpMethod,

    #[serde(default)]
    pub body: Option<Value>,

    #[serde(rename = "content-type", default = "default_content_type")]
    pub content_type: String,

    /// Deliver the result as raw bytes
    #[serde(default)]
    pub base64: bool,

    /// The backend streams several events for this request
    #[serde(rename = "server-pushed", default)]
    pub server_pushed: bool,
}

fn default_content_type() -> String {
    CONTENT_TYPE_JSON.to_string()
}

impl RequestConf {
    /// Panel request for `key` described by this entry
    pub fn to_request(&self, key: PanelKey) -> PanelRequest {
        let Some(url) = &self.url else {
            return PanelRequest::opt_out(key);
        };
        let mut request = PanelRequest::get(key, url.clone())
            .with_method(self.method)
            .with_content_type(self.content_type.clone());
        if let Some(body) = &self.body {
            request = request.with_body(body.clone());
        }
        if self.base64 {
            request = request.base64();
        }
        if self.server_pushed {
            request = request.server_pushed();
        }
        request
    }
}
