//! In-process transport
//!
//! Submissions are queued for the test (or preview driver) to pick up; each
//! accepted submission comes with a [`MemoryChannel`] used to push events
//! down the channel the coordinator opens.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use url::Url;

use super::{BatchBody, ChannelItem, ChannelStream, RawEvent, StreamHandle, Transport};
use crate::domain::{CLOSE_EVENT, PanelKey};
use crate::error::StreamingError;

/// Sending side of one in-memory channel
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<ChannelItem>,
}

impl MemoryChannel {
    /// Push a named event; ignored once the coordinator dropped the channel
    pub fn send(&self, name: impl Into<String>, data: impl Into<String>) {
        let _ = self.tx.send(ChannelItem::Message(RawEvent::new(name, data)));
    }

    /// Push a data event addressed to `key`
    pub fn send_data(&self, key: PanelKey, data: impl Into<String>) {
        self.send(key.event_name(), data);
    }

    /// Push the `close` sentinel
    pub fn close(&self) {
        self.send(CLOSE_EVENT, "");
    }

    /// Push a mid-stream transport error
    pub fn fail(&self, message: impl Into<String>) {
        let _ = self.tx.send(ChannelItem::Error(message.into()));
    }

    /// End the stream without a `close` event
    pub fn disconnect(self) {
        drop(self.tx);
    }
}

/// One accepted batch submission
#[derive(Debug, Clone)]
pub struct MemorySubmission {
    pub endpoint: Url,
    pub body: BatchBody,
    pub handle: StreamHandle,
    pub channel: MemoryChannel,
}

struct Inner {
    submissions_tx: mpsc::UnboundedSender<MemorySubmission>,
    submissions_rx: Mutex<mpsc::UnboundedReceiver<MemorySubmission>>,
    channels: Mutex<HashMap<String, mpsc::UnboundedReceiver<ChannelItem>>>,
    scripted_failures: Mutex<VecDeque<StreamingError>>,
    next_id: AtomicU64,
    attempts: AtomicUsize,
}

/// Transport that keeps everything in process
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (submissions_tx, submissions_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                submissions_tx,
                submissions_rx: Mutex::new(submissions_rx),
                channels: Mutex::new(HashMap::new()),
                scripted_failures: Mutex::new(VecDeque::new()),
                next_id: AtomicU64::new(1),
                attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the next submission fail with the given HTTP status
    pub async fn fail_next_submit(&self, status: u16, message: impl Into<String>) {
        self.inner
            .scripted_failures
            .lock()
            .await
            .push_back(StreamingError::SubmitStatus {
                status,
                message: message.into(),
            });
    }

    /// Wait for the next accepted submission
    pub async fn next_submission(&self) -> Option<MemorySubmission> {
        self.inner.submissions_rx.lock().await.recv().await
    }

    /// Accepted submission that is already queued, if any
    pub async fn try_next_submission(&self) -> Option<MemorySubmission> {
        self.inner.submissions_rx.lock().await.try_recv().ok()
    }

    /// Number of submit calls, failed ones included
    pub fn attempts(&self) -> usize {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn submit(&self, endpoint: &Url, body: &BatchBody) -> Result<StreamHandle, StreamingError> {
        debug!(%endpoint, requests = body.requests.len(), "MemoryTransport::submit: called");
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.inner.scripted_failures.lock().await.pop_front() {
            debug!(%err, "MemoryTransport::submit: scripted failure");
            return Err(err);
        }

        let id = format!("stream-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let handle = StreamHandle::new(endpoint, id.clone())?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.channels.lock().await.insert(id, rx);

        let submission = MemorySubmission {
            endpoint: endpoint.clone(),
            body: body.clone(),
            handle: handle.clone(),
            channel: MemoryChannel { tx },
        };
        self.inner
            .submissions_tx
            .send(submission)
            .map_err(|_| StreamingError::Transport("memory transport closed".to_string()))?;
        Ok(handle)
    }

    async fn open_channel(&self, handle: &StreamHandle) -> Result<ChannelStream, StreamingError> {
        debug!(stream_id = %handle.id, "MemoryTransport::open_channel: called");
        let rx = self
            .inner
            .channels
            .lock()
            .await
            .remove(&handle.id)
            .ok_or_else(|| StreamingError::InvalidResponse(format!("unknown stream id {}", handle.id)))?;

        let items = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(items.boxed())
    }
}
