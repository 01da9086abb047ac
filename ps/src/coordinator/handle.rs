//! PanelRequestRegistry - the per-panel facade onto the Coordinator

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::messages::{CoordRequest, StreamingMetrics};
use crate::domain::{PanelId, PanelKey, PanelRequest, Payload, SubgroupId};
use crate::error::StreamingError;

/// Data of one panel query
///
/// Yields the payloads addressed to its key in server-send order. An error
/// item is always the last item. Dropping the stream unsubscribes; the
/// shared channel keeps running for everyone else.
#[derive(Debug)]
pub struct PanelStream {
    key: PanelKey,
    rx: mpsc::UnboundedReceiver<Result<Payload, StreamingError>>,
}

impl PanelStream {
    pub(crate) fn new(key: PanelKey, rx: mpsc::UnboundedReceiver<Result<Payload, StreamingError>>) -> Self {
        Self { key, rx }
    }

    pub fn key(&self) -> PanelKey {
        self.key
    }

    /// Stop receiving data for this key
    pub fn unsubscribe(self) {
        debug!(key = %self.key, "PanelStream::unsubscribe: called");
    }

    /// Collect every payload until the stream ends
    ///
    /// Returns the payloads received before an error together with the error.
    pub async fn collect_all(mut self) -> (Vec<Payload>, Option<StreamingError>) {
        let mut payloads = Vec::new();
        while let Some(item) = self.rx.recv().await {
            match item {
                Ok(payload) => payloads.push(payload),
                Err(err) => return (payloads, Some(err)),
            }
        }
        (payloads, None)
    }
}

impl Stream for PanelStream {
    type Item = Result<Payload, StreamingError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Handle through which panels register their requests with one group
///
/// This handle is cloneable and cheap; all state lives in the Coordinator.
#[derive(Debug, Clone)]
pub struct PanelRequestRegistry {
    tx: mpsc::Sender<CoordRequest>,
    group: SubgroupId,
}

impl PanelRequestRegistry {
    pub(crate) fn new(tx: mpsc::Sender<CoordRequest>, group: SubgroupId) -> Self {
        debug!(%group, "PanelRequestRegistry::new: called");
        Self { tx, group }
    }

    /// Group this registry submits into
    pub fn group(&self) -> SubgroupId {
        self.group
    }

    /// Register the request of one panel query and subscribe to its data
    ///
    /// The body is encoded before submission (GET bodies become query
    /// strings). An opt-out request fills its slot and the returned stream
    /// completes without data. Registering the same key again subscribes to
    /// the same data without fetching it twice.
    pub async fn register_request(&self, request: PanelRequest) -> Result<PanelStream, StreamingError> {
        let key = request.key;
        debug!(group = %self.group, %key, "PanelRequestRegistry::register_request: called");
        let prepared = request.prepare();
        let (sub_tx, sub_rx) = mpsc::unbounded_channel();
        let subscriber = if prepared.is_opt_out() { None } else { Some(sub_tx) };

        self.tx
            .send(CoordRequest::Register {
                group: self.group,
                request: prepared,
                subscriber,
            })
            .await
            .map_err(|_| StreamingError::CoordinatorClosed)?;

        debug!("PanelRequestRegistry::register_request: sent");
        Ok(PanelStream::new(key, sub_rx))
    }

    /// Open a fresh subgroup seeded with `panel` and its `dependents`
    pub async fn start_new_subgroup(
        &self,
        panel: PanelId,
        dependents: &[PanelId],
    ) -> Result<PanelRequestRegistry, StreamingError> {
        debug!(%panel, dependents = dependents.len(), "PanelRequestRegistry::start_new_subgroup: called");
        let seed = std::iter::once(panel)
            .chain(dependents.iter().copied())
            .map(PanelKey::single)
            .collect();
        self.start_subgroup_for(seed).await
    }

    /// Open a fresh subgroup whose round expects exactly `seed`
    pub async fn start_subgroup_for(&self, seed: Vec<PanelKey>) -> Result<PanelRequestRegistry, StreamingError> {
        debug!(seed = seed.len(), "PanelRequestRegistry::start_subgroup_for: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordRequest::CreateSubgroup { seed, reply_tx })
            .await
            .map_err(|_| StreamingError::CoordinatorClosed)?;

        let group = reply_rx.await.map_err(|_| StreamingError::CoordinatorClosed)?;
        debug!(%group, "PanelRequestRegistry::start_subgroup_for: created");
        Ok(Self::new(self.tx.clone(), group))
    }

    /// Registry bound to an existing, still live subgroup
    pub async fn subgroup(&self, group: SubgroupId) -> Result<PanelRequestRegistry, StreamingError> {
        debug!(%group, "PanelRequestRegistry::subgroup: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordRequest::LookupSubgroup { group, reply_tx })
            .await
            .map_err(|_| StreamingError::CoordinatorClosed)?;

        if reply_rx.await.map_err(|_| StreamingError::CoordinatorClosed)? {
            Ok(Self::new(self.tx.clone(), group))
        } else {
            Err(StreamingError::UnknownSubgroup(group))
        }
    }

    /// Snapshot of the coordinator's counters
    pub async fn metrics(&self) -> Result<StreamingMetrics, StreamingError> {
        debug!("PanelRequestRegistry::metrics: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(CoordRequest::GetMetrics { reply_tx })
            .await
            .map_err(|_| StreamingError::CoordinatorClosed)?;
        reply_rx.await.map_err(|_| StreamingError::CoordinatorClosed)
    }

    /// Stop the coordinator; every open stream completes
    pub async fn shutdown(&self) -> Result<(), StreamingError> {
        debug!("PanelRequestRegistry::shutdown: called");
        self.tx
            .send(CoordRequest::Shutdown)
            .await
            .map_err(|_| StreamingError::CoordinatorClosed)
    }
}
