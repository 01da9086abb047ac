//! Page session: activates panels in dependency order
//!
//! Panels without blockers register into the main round. Every other panel is
//! activated in a subgroup of its own once all of its blocking panels have
//! finished, with the results of its subquery providers at hand.

use std::collections::HashMap;
use std::sync::Arc;

use eyre::{Context, Result};
use futures::StreamExt;
use futures::stream::select_all;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::{Coordinator, PanelRequestRegistry};
use crate::domain::{PanelId, PanelKey, PanelRequest, Payload, SubgroupId};
use crate::graph::PanelDependencyGraph;
use crate::panels::{PanelAdapter, PanelFactoryTable, UpstreamData};
use crate::transport::Transport;

/// Progress of one panel, keyed by panel identity
#[derive(Debug, Clone, PartialEq)]
pub enum PanelUpdate {
    Activated { panel: PanelId, group: SubgroupId },
    Data { key: PanelKey, payload: Payload },
    Failed { key: PanelKey, error: String },
    Finished { panel: PanelId },
}

/// Counts at the end of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub finished: usize,
    pub failed: usize,
}

struct PanelOutcome {
    panel: PanelId,
    payloads: Vec<Payload>,
    failed: bool,
}

/// One page load
pub struct PageSession {
    graph: PanelDependencyGraph,
    adapters: HashMap<PanelId, Box<dyn PanelAdapter>>,
    registry: PanelRequestRegistry,
}

impl PageSession {
    pub fn new(
        graph: PanelDependencyGraph,
        adapters: HashMap<PanelId, Box<dyn PanelAdapter>>,
        registry: PanelRequestRegistry,
    ) -> Self {
        Self {
            graph,
            adapters,
            registry,
        }
    }

    /// Build graph and adapters from `config` and start a coordinator for them
    pub fn launch(config: &Config, transport: Arc<dyn Transport>) -> Result<(Self, JoinHandle<()>)> {
        let graph = PanelDependencyGraph::from_config(&config.panels).context("Invalid panel dependencies")?;
        let adapters = PanelFactoryTable::builtin()
            .build_all(&config.panels)
            .context("Invalid panel configuration")?;
        let coordinator = Coordinator::new(config.streaming.clone(), transport, graph.initial_keys())
            .context("Failed to create coordinator")?;
        let (registry, task) = coordinator.spawn();
        Ok((Self::new(graph, adapters, registry), task))
    }

    /// Registry of the main group
    pub fn registry(&self) -> &PanelRequestRegistry {
        &self.registry
    }

    pub fn graph(&self) -> &PanelDependencyGraph {
        &self.graph
    }

    /// Drive every panel to completion, reporting progress on `updates`
    pub async fn run(self, updates: mpsc::UnboundedSender<PanelUpdate>) -> Result<SessionSummary> {
        info!(panels = self.graph.len(), "Page session started");
        let mut tracker = self.graph.tracker();
        let mut results: HashMap<PanelId, Vec<Payload>> = HashMap::new();
        let mut tasks: JoinSet<PanelOutcome> = JoinSet::new();
        let mut summary = SessionSummary::default();

        for panel in tracker.start() {
            self.activate(panel, &self.registry, &results, &mut tasks, &updates)
                .await?;
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.context("Panel task failed")?;
            let panel = outcome.panel;
            debug!(%panel, payloads = outcome.payloads.len(), failed = outcome.failed, "PageSession::run: panel finished");
            summary.finished += 1;
            if outcome.failed {
                summary.failed += 1;
            }
            results.insert(panel, outcome.payloads);
            let _ = updates.send(PanelUpdate::Finished { panel });

            for next in tracker.mark_finished(panel) {
                let Some(node) = self.graph.node(next) else {
                    continue;
                };
                let registry = self
                    .registry
                    .start_subgroup_for(node.keys())
                    .await
                    .context("Failed to start subgroup")?;
                self.activate(next, &registry, &results, &mut tasks, &updates).await?;
            }
        }

        info!(finished = summary.finished, failed = summary.failed, "Page session finished");
        Ok(summary)
    }

    async fn activate(
        &self,
        panel: PanelId,
        registry: &PanelRequestRegistry,
        results: &HashMap<PanelId, Vec<Payload>>,
        tasks: &mut JoinSet<PanelOutcome>,
        updates: &mpsc::UnboundedSender<PanelUpdate>,
    ) -> Result<()> {
        let Some(node) = self.graph.node(panel) else {
            return Ok(());
        };
        debug!(%panel, group = %registry.group(), "PageSession::activate: called");
        let _ = updates.send(PanelUpdate::Activated {
            panel,
            group: registry.group(),
        });

        let mut upstream = UpstreamData::new();
        for provider in &node.subquery_providers {
            if let Some(payloads) = results.get(provider) {
                upstream.insert(*provider, payloads.clone());
            }
        }

        let built = match self.adapters.get(&panel) {
            Some(adapter) => adapter.build_requests(node, &upstream),
            None => Ok(Vec::new()),
        };
        let mut failed = false;
        let mut requests = match built {
            Ok(requests) => requests,
            Err(e) => {
                warn!(%panel, error = %e, "Panel could not build its requests");
                failed = true;
                for key in node.keys() {
                    let _ = updates.send(PanelUpdate::Failed {
                        key,
                        error: e.to_string(),
                    });
                }
                Vec::new()
            }
        };
        // every expected key must fill its slot or the round never completes
        for key in node.keys() {
            if !requests.iter().any(|r| r.key == key) {
                requests.push(PanelRequest::opt_out(key));
            }
        }

        let mut streams = Vec::with_capacity(requests.len());
        for request in requests {
            let key = request.key;
            let stream = registry.register_request(request).await?;
            streams.push(stream.map(move |item| (key, item)).boxed());
        }

        let updates = updates.clone();
        tasks.spawn(async move {
            let mut payloads = Vec::new();
            let mut merged = select_all(streams);
            while let Some((key, item)) = merged.next().await {
                match item {
                    Ok(payload) => {
                        payloads.push(payload.clone());
                        let _ = updates.send(PanelUpdate::Data { key, payload });
                    }
                    Err(e) => {
                        failed = true;
                        let _ = updates.send(PanelUpdate::Failed {
                            key,
                            error: e.to_string(),
                        });
                    }
                }
            }
            PanelOutcome {
                panel,
                payloads,
                failed,
            }
        });
        Ok(())
    }
}
