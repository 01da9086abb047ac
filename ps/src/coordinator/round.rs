//! Aggregation rounds
//!
//! A round is seeded with one empty slot per expected key. Each key may be
//! filled exactly once (first write wins); the round completes the instant the
//! last slot is filled and hands its batch to the [`RoundCompletion`] future.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{PanelKey, PreparedRequest, SubgroupId};
use crate::transport::BatchBody;

/// The complete set of requests of one round
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub id: Uuid,
    pub group: SubgroupId,
    /// Requests in seeding order, opt-out sentinels included
    pub requests: Vec<PreparedRequest>,
    pub completed_at: DateTime<Utc>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn keys(&self) -> Vec<PanelKey> {
        self.requests.iter().map(PreparedRequest::key).collect()
    }

    /// Submission body carrying this batch
    pub fn to_body(&self, tag: Option<Value>) -> BatchBody {
        BatchBody {
            requests: self.requests.clone(),
            tag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundState {
    Collecting,
    Complete,
    Submitted,
    Abandoned,
}

/// Result of offering a request to a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Slot filled, `remaining` slots still empty
    Accepted { remaining: usize },
    /// Slot filled and the round is now complete
    Completed,
    /// The key already had a request; ignored
    Duplicate,
    /// The key is not part of this round
    Unexpected,
    /// The round was abandoned
    Closed,
}

impl SubmitOutcome {
    /// Whether the offered request now occupies its slot
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. } | SubmitOutcome::Completed)
    }
}

/// Resolves once with the round's batch
///
/// Yields `None` if the round is dropped or abandoned before completing.
#[derive(Debug)]
pub struct RoundCompletion {
    rx: oneshot::Receiver<Batch>,
}

impl Future for RoundCompletion {
    type Output = Option<Batch>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

/// One-shot barrier over the expected keys of a group
#[derive(Debug)]
pub struct AggregationRound {
    group: SubgroupId,
    slots: Vec<(PanelKey, Option<PreparedRequest>)>,
    index: HashMap<PanelKey, usize>,
    remaining: usize,
    state: RoundState,
    completion_tx: Option<oneshot::Sender<Batch>>,
}

impl AggregationRound {
    /// Seed an empty slot per expected key
    ///
    /// Repeated keys collapse into one slot. An empty expected set completes
    /// immediately with an empty batch.
    pub fn open(group: SubgroupId, expected: impl IntoIterator<Item = PanelKey>) -> (Self, RoundCompletion) {
        let (completion_tx, rx) = oneshot::channel();
        let mut slots = Vec::new();
        let mut index = HashMap::new();
        for key in expected {
            if !index.contains_key(&key) {
                index.insert(key, slots.len());
                slots.push((key, None));
            }
        }
        debug!(%group, expected = slots.len(), "AggregationRound::open: called");

        let mut round = Self {
            group,
            remaining: slots.len(),
            slots,
            index,
            state: RoundState::Collecting,
            completion_tx: Some(completion_tx),
        };
        if round.remaining == 0 {
            round.complete();
        }
        (round, RoundCompletion { rx })
    }

    /// Fill the slot of `request`'s key, first write wins
    pub fn submit(&mut self, request: PreparedRequest) -> SubmitOutcome {
        let key = request.key();
        if self.state == RoundState::Abandoned {
            return SubmitOutcome::Closed;
        }
        let Some(&idx) = self.index.get(&key) else {
            debug!(group = %self.group, %key, "AggregationRound::submit: unexpected key");
            return SubmitOutcome::Unexpected;
        };
        let slot = &mut self.slots[idx].1;
        if slot.is_some() {
            debug!(group = %self.group, %key, "AggregationRound::submit: duplicate ignored");
            return SubmitOutcome::Duplicate;
        }

        *slot = Some(request);
        self.remaining -= 1;
        debug!(group = %self.group, %key, remaining = self.remaining, "AggregationRound::submit: slot filled");
        if self.remaining == 0 {
            self.complete();
            SubmitOutcome::Completed
        } else {
            SubmitOutcome::Accepted {
                remaining: self.remaining,
            }
        }
    }

    fn complete(&mut self) {
        self.state = RoundState::Complete;
        let requests = self.slots.iter().filter_map(|(_, req)| req.clone()).collect();
        let batch = Batch {
            id: Uuid::now_v7(),
            group: self.group,
            requests,
            completed_at: Utc::now(),
        };
        if let Some(tx) = self.completion_tx.take() {
            // the completion future may already be gone (group torn down)
            let _ = tx.send(batch);
        }
    }

    /// Record that the batch went out
    pub fn mark_submitted(&mut self) {
        if self.state == RoundState::Complete {
            self.state = RoundState::Submitted;
        }
    }

    /// Give up on a round that is still collecting
    pub fn abandon(&mut self) {
        if self.state == RoundState::Collecting {
            self.state = RoundState::Abandoned;
            self.completion_tx = None;
        }
    }

    pub fn group(&self) -> SubgroupId {
        self.group
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }

    pub fn expects(&self, key: &PanelKey) -> bool {
        self.index.contains_key(key)
    }

    /// Expected keys whose slot is still empty
    pub fn pending_keys(&self) -> Vec<PanelKey> {
        self.slots
            .iter()
            .filter(|(_, req)| req.is_none())
            .map(|(key, _)| *key)
            .collect()
    }
}
