//! Stream demultiplexer
//!
//! Routes the events of one group's channel to the subscribers of the key each
//! event is tagged with. A key keeps receiving events in channel order until
//! the channel closes; a decode or backend error finishes only the affected
//! key. Closing completes every remaining subscriber.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use super::messages::Subscriber;
use crate::domain::{CLOSE_EVENT, DecodePolicy, PanelKey, PreparedRequest, SubgroupId, TaggedEvent, parse_tag};
use crate::error::StreamingError;
use crate::transport::RawEvent;

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Closed,
    Failed(StreamingError),
}

/// What happened to one channel event
#[derive(Debug, Clone, PartialEq)]
pub enum Routing {
    /// Delivered to this many live subscribers
    Delivered(usize),
    /// Nobody was waiting for it, or it was not addressed to a known key
    Dropped,
    /// The key's data could not be decoded; its subscribers got the error
    DecodeFailed(StreamingError),
    /// The `close` sentinel; every subscriber was completed
    Closed,
}

/// Per-group routing table from keys to subscribers
#[derive(Debug)]
pub struct Demultiplexer {
    group: SubgroupId,
    routes: HashMap<PanelKey, DecodePolicy>,
    subscribers: HashMap<PanelKey, Vec<Subscriber>>,
    finished: HashSet<PanelKey>,
    outcome: Option<Outcome>,
}

impl Demultiplexer {
    pub fn new(group: SubgroupId) -> Self {
        Self {
            group,
            routes: HashMap::new(),
            subscribers: HashMap::new(),
            finished: HashSet::new(),
            outcome: None,
        }
    }

    /// Learn how the data of an accepted request is decoded
    ///
    /// An opt-out never receives data, so its key is finished right away.
    pub fn add_route(&mut self, request: &PreparedRequest) {
        let key = request.key();
        if request.is_opt_out() {
            self.finish(key);
            return;
        }
        self.routes.insert(key, request.decode_policy());
    }

    /// Attach a subscriber to `key`
    ///
    /// Subscribers to a key that is already finished are completed at once;
    /// after a group failure they receive the group's error.
    pub fn subscribe(&mut self, key: PanelKey, subscriber: Subscriber) {
        match &self.outcome {
            Some(Outcome::Failed(err)) => {
                let _ = subscriber.send(Err(err.clone()));
            }
            Some(Outcome::Closed) => {}
            None if self.finished.contains(&key) => {}
            None => self.subscribers.entry(key).or_default().push(subscriber),
        }
    }

    /// Decode an event into the tagged unit it carries
    ///
    /// Returns `None` for events not addressed to a key of this group.
    pub fn decode(&self, event: &RawEvent) -> Option<Result<TaggedEvent, StreamingError>> {
        let key = parse_tag(&event.name)?;
        let policy = self.routes.get(&key)?;
        Some(
            policy
                .decode(key, &event.data)
                .map(|payload| TaggedEvent { key, payload }),
        )
    }

    /// Route one channel event
    pub fn route(&mut self, event: &RawEvent) -> Routing {
        if event.name == CLOSE_EVENT {
            self.close();
            return Routing::Closed;
        }
        if self.outcome.is_some() {
            return Routing::Dropped;
        }
        let Some(decoded) = self.decode(event) else {
            debug!(group = %self.group, name = %event.name, "Demultiplexer::route: unroutable event dropped");
            return Routing::Dropped;
        };

        match decoded {
            Ok(tagged) => {
                let key = tagged.key;
                if self.finished.contains(&key) {
                    debug!(group = %self.group, %key, "Demultiplexer::route: event after finish dropped");
                    return Routing::Dropped;
                }
                let delivered = match self.subscribers.get_mut(&key) {
                    Some(subs) => {
                        subs.retain(|sub| sub.send(Ok(tagged.payload.clone())).is_ok());
                        subs.len()
                    }
                    None => 0,
                };
                if delivered == 0 {
                    debug!(group = %self.group, %key, "Demultiplexer::route: no live subscriber");
                    Routing::Dropped
                } else {
                    Routing::Delivered(delivered)
                }
            }
            Err(err) => {
                let key = err.key();
                debug!(group = %self.group, ?key, %err, "Demultiplexer::route: decode failed");
                if let Some(key) = key {
                    for sub in self.subscribers.remove(&key).unwrap_or_default() {
                        let _ = sub.send(Err(err.clone()));
                    }
                    self.finished.insert(key);
                }
                Routing::DecodeFailed(err)
            }
        }
    }

    fn finish(&mut self, key: PanelKey) {
        self.finished.insert(key);
        // dropping the senders completes the subscribers' streams
        self.subscribers.remove(&key);
    }

    /// Complete every remaining subscriber
    pub fn close(&mut self) {
        debug!(group = %self.group, subscribers = self.subscriber_count(), "Demultiplexer::close: called");
        self.subscribers.clear();
        self.outcome = Some(Outcome::Closed);
    }

    /// Fail every remaining subscriber with `err`
    pub fn fail(&mut self, err: StreamingError) {
        debug!(group = %self.group, %err, "Demultiplexer::fail: called");
        for (_, subs) in self.subscribers.drain() {
            for sub in subs {
                let _ = sub.send(Err(err.clone()));
            }
        }
        self.outcome = Some(Outcome::Failed(err));
    }

    /// Number of live subscriptions across all keys
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .values()
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).count())
            .sum()
    }

    pub fn is_finished(&self, key: &PanelKey) -> bool {
        self.finished.contains(key)
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.is_some()
    }
}
