//! Main Coordinator task implementation

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::config::CoordinatorConfig;
use super::demux::{Demultiplexer, Routing};
use super::handle::PanelRequestRegistry;
use super::messages::{ChannelClose, CoordRequest, StreamingMetrics};
use super::round::{AggregationRound, RoundCompletion, SubmitOutcome};
use crate::domain::{CLOSE_EVENT, PanelKey, SubgroupId};
use crate::error::StreamingError;
use crate::transport::{ChannelItem, Transport, join_endpoint};

/// Live state of one group: its round, its routing table and the task
/// submitting its batch and pumping its channel
struct GroupState {
    round: AggregationRound,
    demux: Demultiplexer,
    task: JoinHandle<()>,
}

impl Drop for GroupState {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Everything the submission task of a group needs
struct SubmissionJob {
    group: SubgroupId,
    endpoint: Url,
    completion: RoundCompletion,
    transport: Arc<dyn Transport>,
    coord_tx: mpsc::Sender<CoordRequest>,
    ready_timeout: Option<Duration>,
    tag: Option<Value>,
}

impl SubmissionJob {
    async fn run(self) {
        let SubmissionJob {
            group,
            endpoint,
            completion,
            transport,
            coord_tx,
            ready_timeout,
            tag,
        } = self;

        let batch = match ready_timeout {
            Some(limit) => match tokio::time::timeout(limit, completion).await {
                Ok(batch) => batch,
                Err(_) => {
                    let _ = coord_tx.send(CoordRequest::RoundTimedOut { group }).await;
                    return;
                }
            },
            None => completion.await,
        };
        let Some(batch) = batch else {
            debug!(%group, "SubmissionJob::run: round dropped before completing");
            return;
        };

        if batch.is_empty() {
            debug!(%group, "SubmissionJob::run: empty batch, nothing to submit");
            let _ = coord_tx
                .send(CoordRequest::ChannelClosed {
                    group,
                    reason: ChannelClose::Graceful,
                })
                .await;
            return;
        }

        info!(%group, batch_id = %batch.id, requests = batch.len(), %endpoint, "Submitting batch");
        let handle = match transport.submit(&endpoint, &batch.to_body(tag)).await {
            Ok(handle) => handle,
            Err(error) => {
                let _ = coord_tx.send(CoordRequest::BatchFailed { group, error }).await;
                return;
            }
        };
        let mut channel = match transport.open_channel(&handle).await {
            Ok(channel) => channel,
            Err(error) => {
                let _ = coord_tx.send(CoordRequest::BatchFailed { group, error }).await;
                return;
            }
        };
        if coord_tx
            .send(CoordRequest::BatchAccepted { group, handle })
            .await
            .is_err()
        {
            return;
        }

        while let Some(item) = channel.next().await {
            match item {
                ChannelItem::Message(event) => {
                    let is_close = event.name == CLOSE_EVENT;
                    if coord_tx.send(CoordRequest::ChannelEvent { group, event }).await.is_err() || is_close {
                        return;
                    }
                }
                ChannelItem::Error(message) => {
                    let _ = coord_tx
                        .send(CoordRequest::ChannelClosed {
                            group,
                            reason: ChannelClose::Interrupted(message),
                        })
                        .await;
                    return;
                }
            }
        }

        let _ = coord_tx
            .send(CoordRequest::ChannelClosed {
                group,
                reason: ChannelClose::ConnectionLost,
            })
            .await;
    }
}

/// The Coordinator owns every round and routing table
///
/// It runs as a single task; panels talk to it only through
/// [`PanelRequestRegistry`] handles.
pub struct Coordinator {
    config: CoordinatorConfig,
    tx: mpsc::Sender<CoordRequest>,
    rx: mpsc::Receiver<CoordRequest>,
    transport: Arc<dyn Transport>,
    root: Option<Url>,
    initial_keys: Vec<PanelKey>,
}

impl Coordinator {
    /// Create a Coordinator whose main round expects `initial_keys`
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn Transport>,
        initial_keys: Vec<PanelKey>,
    ) -> Result<Self, StreamingError> {
        debug!(initial = initial_keys.len(), "Coordinator::new: called");
        let root = config.root()?;
        let (tx, rx) = mpsc::channel(config.channel_buffer.max(1));
        Ok(Self {
            config,
            tx,
            rx,
            transport,
            root,
            initial_keys,
        })
    }

    /// Get a sender for creating handles
    pub fn sender(&self) -> mpsc::Sender<CoordRequest> {
        self.tx.clone()
    }

    /// Registry bound to the main group
    pub fn registry(&self) -> PanelRequestRegistry {
        PanelRequestRegistry::new(self.tx.clone(), SubgroupId::MAIN)
    }

    /// Whether a root endpoint is configured
    pub fn is_streaming_enabled(&self) -> bool {
        self.root.is_some()
    }

    /// Spawn the Coordinator task and return the main registry
    pub fn spawn(self) -> (PanelRequestRegistry, JoinHandle<()>) {
        let registry = self.registry();
        let task = tokio::spawn(self.run());
        (registry, task)
    }

    fn open_group(
        &self,
        group: SubgroupId,
        endpoint: Url,
        expected: Vec<PanelKey>,
        groups: &mut HashMap<SubgroupId, GroupState>,
    ) {
        debug!(%group, %endpoint, expected = expected.len(), "Coordinator::open_group: called");
        let (round, completion) = AggregationRound::open(group, expected);
        let job = SubmissionJob {
            group,
            endpoint,
            completion,
            transport: self.transport.clone(),
            coord_tx: self.tx.clone(),
            ready_timeout: self.config.ready_timeout(),
            tag: self.config.tag.clone(),
        };
        let task = tokio::spawn(job.run());
        groups.insert(
            group,
            GroupState {
                round,
                demux: Demultiplexer::new(group),
                task,
            },
        );
    }

    /// Run the Coordinator task
    ///
    /// This consumes the Coordinator and runs until shutdown is requested.
    pub async fn run(mut self) {
        // Internal state
        let mut groups: HashMap<SubgroupId, GroupState> = HashMap::new();
        // errors of failed groups; an issued id that is neither live nor
        // failed belongs to a group that closed
        let mut failed: HashMap<SubgroupId, StreamingError> = HashMap::new();
        let mut last_group = SubgroupId::MAIN;

        // Metrics
        let mut metrics = StreamingMetrics::default();

        match self.root.clone() {
            Some(root) => {
                let initial = std::mem::take(&mut self.initial_keys);
                self.open_group(SubgroupId::MAIN, root, initial, &mut groups);
            }
            None => info!("No root endpoint configured, streaming disabled"),
        }

        info!("Coordinator started");

        while let Some(req) = self.rx.recv().await {
            match req {
                CoordRequest::Register {
                    group,
                    request,
                    subscriber,
                } => {
                    let key = request.key();
                    debug!(%group, %key, opt_out = request.is_opt_out(), "Registering request");

                    if self.root.is_none() {
                        // dropping the subscriber completes its stream
                        continue;
                    }

                    let Some(state) = groups.get_mut(&group) else {
                        match failed.get(&group) {
                            Some(err) => {
                                if let Some(sub) = subscriber {
                                    let _ = sub.send(Err(err.clone()));
                                }
                            }
                            None if group <= last_group => {}
                            None => {
                                warn!(%group, %key, "Registration for unknown subgroup");
                                if let Some(sub) = subscriber {
                                    let _ = sub.send(Err(StreamingError::UnknownSubgroup(group)));
                                }
                            }
                        }
                        continue;
                    };

                    match state.round.submit(request.clone()) {
                        outcome if outcome.is_accepted() => state.demux.add_route(&request),
                        SubmitOutcome::Unexpected => {
                            warn!(%group, %key, "Request for a panel outside the round");
                            if let Some(sub) = subscriber {
                                let _ = sub.send(Err(StreamingError::UnexpectedPanel { group, key }));
                            }
                            continue;
                        }
                        _ => {}
                    }

                    if let Some(sub) = subscriber {
                        state.demux.subscribe(key, sub);
                    }
                }

                CoordRequest::CreateSubgroup { seed, reply_tx } => {
                    last_group = last_group.next();
                    let group = last_group;
                    debug!(%group, seed = seed.len(), "Creating subgroup");

                    if let Some(root) = &self.root {
                        match join_endpoint(root, &group.path_segment()) {
                            Ok(endpoint) => self.open_group(group, endpoint, seed, &mut groups),
                            Err(err) => {
                                warn!(%group, %err, "Failed to derive subgroup endpoint");
                                failed.insert(group, err);
                            }
                        }
                    }
                    let _ = reply_tx.send(group);
                }

                CoordRequest::LookupSubgroup { group, reply_tx } => {
                    let _ = reply_tx.send(self.root.is_none() || groups.contains_key(&group));
                }

                CoordRequest::RoundTimedOut { group } => {
                    if let Some(mut state) = groups.remove(&group) {
                        let timeout = self.config.ready_timeout().unwrap_or_default();
                        warn!(%group, pending = ?state.round.pending_keys(), ?timeout, "Round timed out");
                        state.round.abandon();
                        let err = StreamingError::RoundTimeout { group, timeout };
                        state.demux.fail(err.clone());
                        failed.insert(group, err);
                        metrics.rounds_timed_out += 1;
                    }
                }

                CoordRequest::BatchAccepted { group, handle } => {
                    info!(%group, stream_id = %handle.id, channel = %handle.channel_url, "Batch accepted");
                    if let Some(state) = groups.get_mut(&group) {
                        state.round.mark_submitted();
                    }
                    metrics.batches_submitted += 1;
                }

                CoordRequest::BatchFailed { group, error } => {
                    warn!(%group, %error, "Batch submission failed");
                    if let Some(mut state) = groups.remove(&group) {
                        state.demux.fail(error.clone());
                    }
                    failed.insert(group, error);
                    metrics.batches_failed += 1;
                }

                CoordRequest::ChannelEvent { group, event } => {
                    let Some(state) = groups.get_mut(&group) else {
                        debug!(%group, name = %event.name, "Event for a closed group dropped");
                        metrics.events_dropped += 1;
                        continue;
                    };
                    match state.demux.route(&event) {
                        Routing::Delivered(_) => metrics.events_routed += 1,
                        Routing::Dropped => metrics.events_dropped += 1,
                        Routing::DecodeFailed(err) => {
                            warn!(%group, %err, "Failed to decode event");
                            metrics.decode_errors += 1;
                        }
                        Routing::Closed => {
                            info!(%group, "Channel closed by server");
                            groups.remove(&group);
                        }
                    }
                }

                CoordRequest::ChannelClosed { group, reason } => {
                    let Some(mut state) = groups.remove(&group) else {
                        continue;
                    };
                    match reason {
                        ChannelClose::Graceful | ChannelClose::ConnectionLost => {
                            info!(%group, ?reason, "Channel closed");
                            state.demux.close();
                        }
                        ChannelClose::Interrupted(message) => {
                            warn!(%group, %message, "Channel interrupted");
                            if self.config.surface_stream_errors {
                                let err = StreamingError::ChannelInterrupted { group, message };
                                state.demux.fail(err.clone());
                                failed.insert(group, err);
                            } else {
                                state.demux.close();
                            }
                        }
                    }
                }

                CoordRequest::GetMetrics { reply_tx } => {
                    metrics.open_groups = groups.len();
                    metrics.failed_groups = failed.len();
                    metrics.pending_slots = groups.values().map(|g| g.round.remaining()).sum();
                    let _ = reply_tx.send(metrics.clone());
                }

                CoordRequest::Shutdown => {
                    info!("Coordinator shutting down");
                    break;
                }
            }
        }

        // dropping the groups completes all subscribers and stops their tasks
        groups.clear();
        info!("Coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{PanelId, PanelRequest, Payload};
    use crate::transport::MemoryTransport;
    use futures::StreamExt;

    fn key(p: u32) -> PanelKey {
        PanelKey::single(PanelId(p))
    }

    fn config() -> CoordinatorConfig {
        CoordinatorConfig::with_root("http://memory/ds/")
    }

    fn spawn(config: CoordinatorConfig, keys: Vec<PanelKey>) -> (PanelRequestRegistry, MemoryTransport) {
        let transport = MemoryTransport::new();
        let coord = Coordinator::new(config, Arc::new(transport.clone()), keys).unwrap();
        let (registry, _task) = coord.spawn();
        (registry, transport)
    }

    #[tokio::test]
    async fn test_coordinator_metrics_and_shutdown() {
        let transport = MemoryTransport::new();
        let coord = Coordinator::new(config(), Arc::new(transport), vec![key(0), key(1)]).unwrap();
        assert!(coord.is_streaming_enabled());
        let (registry, task) = coord.spawn();

        let metrics = registry.metrics().await.unwrap();
        assert_eq!(metrics.open_groups, 1);
        assert_eq!(metrics.pending_slots, 2);

        registry.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(registry.metrics().await, Err(StreamingError::CoordinatorClosed)));
    }

    #[tokio::test]
    async fn test_single_batch_after_barrier() {
        let (registry, transport) = spawn(config(), vec![key(0), key(1)]);

        let mut s0 = registry
            .register_request(PanelRequest::get(key(0), "http://b/0"))
            .await
            .unwrap();
        assert!(transport.try_next_submission().await.is_none());

        let mut s1 = registry
            .register_request(PanelRequest::get(key(1), "http://b/1"))
            .await
            .unwrap();
        let submission = transport.next_submission().await.unwrap();
        assert_eq!(submission.body.requests.len(), 2);
        assert_eq!(submission.endpoint.as_str(), "http://memory/ds/");

        submission.channel.send_data(key(1), r#"{"b": 1}"#);
        submission.channel.send_data(key(0), r#"{"a": 0}"#);
        submission.channel.close();

        assert_eq!(s0.next().await, Some(Ok(Payload::Json(serde_json::json!({"a": 0})))));
        assert_eq!(s0.next().await, None);
        assert_eq!(s1.next().await, Some(Ok(Payload::Json(serde_json::json!({"b": 1})))));
        assert_eq!(s1.next().await, None);
    }

    #[tokio::test]
    async fn test_unexpected_panel_gets_error() {
        let (registry, _transport) = spawn(config(), vec![key(0)]);
        let mut stray = registry
            .register_request(PanelRequest::get(key(5), "http://b/5"))
            .await
            .unwrap();
        assert_eq!(
            stray.next().await,
            Some(Err(StreamingError::UnexpectedPanel {
                group: SubgroupId::MAIN,
                key: key(5)
            }))
        );
        assert_eq!(stray.next().await, None);
    }

    #[tokio::test]
    async fn test_streaming_disabled_completes_everything() {
        let transport = MemoryTransport::new();
        let coord = Coordinator::new(CoordinatorConfig::default(), Arc::new(transport.clone()), vec![key(0)]).unwrap();
        assert!(!coord.is_streaming_enabled());
        let (registry, _task) = coord.spawn();

        let mut stream = registry
            .register_request(PanelRequest::get(key(0), "http://b/0"))
            .await
            .unwrap();
        assert_eq!(stream.next().await, None);

        let sub = registry.start_new_subgroup(PanelId(3), &[]).await.unwrap();
        assert!(registry.subgroup(sub.group()).await.is_ok());
        assert_eq!(transport.attempts(), 0);
    }

    #[tokio::test]
    async fn test_ready_timeout_fails_round() {
        let config = CoordinatorConfig {
            ready_timeout_ms: Some(50),
            ..config()
        };
        let (registry, transport) = spawn(config, vec![key(0), key(1)]);
        let mut s0 = registry
            .register_request(PanelRequest::get(key(0), "http://b/0"))
            .await
            .unwrap();

        let item = s0.next().await;
        assert_eq!(
            item,
            Some(Err(StreamingError::RoundTimeout {
                group: SubgroupId::MAIN,
                timeout: Duration::from_millis(50)
            }))
        );
        assert_eq!(s0.next().await, None);
        assert_eq!(transport.attempts(), 0);

        let metrics = registry.metrics().await.unwrap();
        assert_eq!(metrics.rounds_timed_out, 1);
        assert_eq!(metrics.open_groups, 0);
    }

    #[tokio::test]
    async fn test_tag_is_sent_with_batch() {
        let config = CoordinatorConfig {
            tag: Some(serde_json::json!({"query": "house"})),
            ..config()
        };
        let (registry, transport) = spawn(config, vec![key(0)]);
        let _s0 = registry.register_request(PanelRequest::opt_out(key(0))).await.unwrap();
        let submission = transport.next_submission().await.unwrap();
        assert_eq!(submission.body.tag, Some(serde_json::json!({"query": "house"})));
        assert!(submission.body.requests[0].is_opt_out());
    }

    #[tokio::test]
    async fn test_closed_groups_keep_no_state() {
        let transport = MemoryTransport::new();
        let coord = Coordinator::new(config(), Arc::new(transport.clone()), vec![key(0)]).unwrap();
        let tx = coord.sender();
        let (registry, _task) = coord.spawn();
        let mut closed = Vec::new();
        for p in 1..=3 {
            let sub = registry.start_new_subgroup(PanelId(p), &[]).await.unwrap();
            let _stream = sub
                .register_request(PanelRequest::get(key(p), "http://b/x"))
                .await
                .unwrap();
            transport.next_submission().await.unwrap().channel.close();
            closed.push(sub);
        }
        let failing = registry.start_new_subgroup(PanelId(4), &[]).await.unwrap();
        transport.fail_next_submit(502, "Bad Gateway").await;
        let mut failed_stream = failing
            .register_request(PanelRequest::get(key(4), "http://b/x"))
            .await
            .unwrap();
        assert!(matches!(failed_stream.next().await, Some(Err(StreamingError::SubmitStatus { .. }))));
        for sub in &closed {
            // wait until the close reached the coordinator
            while registry.subgroup(sub.group()).await.is_ok() {
                tokio::task::yield_now().await;
            }
        }

        let metrics = registry.metrics().await.unwrap();
        assert_eq!(metrics.open_groups, 1);
        assert_eq!(metrics.failed_groups, 1);

        // late registrations still tell a closed group from a failed or unknown one
        let mut late = closed[0]
            .register_request(PanelRequest::get(key(1), "http://b/x"))
            .await
            .unwrap();
        assert_eq!(late.next().await, None);
        let mut late = failing
            .register_request(PanelRequest::get(key(4), "http://b/x"))
            .await
            .unwrap();
        assert!(matches!(late.next().await, Some(Err(StreamingError::SubmitStatus { .. }))));
        let unknown = PanelRequestRegistry::new(tx, SubgroupId(42));
        let mut stray = unknown
            .register_request(PanelRequest::get(key(5), "http://b/x"))
            .await
            .unwrap();
        assert_eq!(stray.next().await, Some(Err(StreamingError::UnknownSubgroup(SubgroupId(42)))));
    }

    #[tokio::test]
    async fn test_empty_main_round_submits_nothing() {
        let (registry, transport) = spawn(config(), Vec::new());
        // let the empty round settle
        let _ = registry.metrics().await.unwrap();
        tokio::task::yield_now().await;
        let metrics = registry.metrics().await.unwrap();
        assert_eq!(metrics.pending_slots, 0);
        assert_eq!(transport.attempts(), 0);
    }
}
