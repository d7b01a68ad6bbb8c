//! Event bus for ledger and donation change notifications
//!
//! One bounded broadcast channel carries every [`ChangeEvent`]; subscriptions
//! filter by topic on the receiving side. Using a single channel keeps the
//! order of one publish call intact for a subscriber that listens on several
//! topics (a `StatsChanged` always precedes the `BadgeAwarded` events from the
//! same action).
//!
//! Publishing never waits on subscribers. A subscriber that falls more than
//! `capacity` events behind loses the oldest ones and is told how many it
//! missed; it must then resync from a fresh snapshot. Nothing is replayed.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, trace};

use crate::types::{ChangeEvent, Topic};

/// A published event with its bus-wide sequence number
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    pub seq: u64,
    pub event: ChangeEvent,
}

/// Why a subscription produced no event
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    /// Events were dropped before this subscriber read them; resync required
    #[error("subscriber lagged, {0} events missed")]
    Lagged(u64),

    #[error("event bus closed")]
    Closed,
}

/// Set of topics a subscriber listens on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicSet(BTreeSet<Topic>);

impl TopicSet {
    pub fn all() -> Self {
        Self(Topic::ALL.into_iter().collect())
    }

    pub fn only(topic: Topic) -> Self {
        Self(BTreeSet::from([topic]))
    }

    pub fn contains(&self, topic: Topic) -> bool {
        self.0.contains(&topic)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Topic> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Topic> for TopicSet {
    fn from_iter<I: IntoIterator<Item = Topic>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Event bus for broadcasting change notifications
pub struct EventBus {
    sender: broadcast::Sender<Envelope>,
    // Guards sequence assignment and send together so sequence numbers
    // arrive in order and a batch is never interleaved with another.
    next_seq: Mutex<u64>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a new event bus holding at most `capacity` undelivered events per subscriber
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            next_seq: Mutex::new(1),
        }
    }

    /// Publish one event. Returns the number of subscribers reached.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.publish_all(vec![event])
    }

    /// Publish a batch contiguously, in order.
    pub fn publish_all(&self, events: Vec<ChangeEvent>) -> usize {
        let mut next_seq = match self.next_seq.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut reached = 0;
        for event in events {
            let envelope = Envelope {
                seq: *next_seq,
                event,
            };
            *next_seq += 1;
            trace!(seq = envelope.seq, event = ?envelope.event, "Publishing change event");
            // Ignore send errors (no subscribers)
            reached = self.sender.send(envelope).unwrap_or(0);
        }
        reached
    }

    /// Subscribe to a set of topics. Dropping the subscription unsubscribes.
    pub fn subscribe(&self, topics: TopicSet) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            topics,
        }
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Live, topic-filtered feed of change events
pub struct Subscription {
    receiver: broadcast::Receiver<Envelope>,
    topics: TopicSet,
}

impl Subscription {
    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    /// Wait for the next event on one of the subscribed topics
    pub async fn recv(&mut self) -> Result<Envelope, SubscriptionError> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if self.topics.contains(envelope.event.topic()) => return Ok(envelope),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(SubscriptionError::Lagged(n)),
                Err(broadcast::error::RecvError::Closed) => return Err(SubscriptionError::Closed),
            }
        }
    }

    /// Convert into a stream; ends when the bus is dropped
    pub fn into_stream(self) -> impl Stream<Item = Result<Envelope, SubscriptionError>> + Send + 'static {
        let topics = self.topics;
        BroadcastStream::new(self.receiver).filter_map(move |item| {
            let item = match item {
                Ok(envelope) if topics.contains(envelope.event.topic()) => Some(Ok(envelope)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(n)) => Some(Err(SubscriptionError::Lagged(n))),
            };
            futures_util::future::ready(item)
        })
    }
}

/// Spawn a background task that logs every event at debug level
pub fn spawn_logging_listener(bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut subscription = bus.subscribe(TopicSet::all());

    tokio::spawn(async move {
        loop {
            match subscription.recv().await {
                Ok(Envelope { seq, event }) => match event {
                    ChangeEvent::StatsChanged { user_id, points, donation_count } => {
                        debug!(seq, %user_id, points, donation_count, "Stats changed");
                    }
                    ChangeEvent::BadgeAwarded { user_id, badge_id } => {
                        debug!(seq, %user_id, %badge_id, "Badge awarded");
                    }
                    ChangeEvent::DonationChanged { donation_id, op } => {
                        debug!(seq, %donation_id, ?op, "Donation changed");
                    }
                },
                Err(SubscriptionError::Lagged(n)) => {
                    debug!(skipped = n, "Event logger lagged, skipped events");
                }
                Err(SubscriptionError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
