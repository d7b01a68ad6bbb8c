//! Live change feed over WebSocket
//!
//! ## Protocol
//!
//! Connect: `ws://localhost:8080/ws?topics=stats,badges`
//!
//! Omitting `topics` subscribes to everything. Messages (server → client):
//! - `subscribed` - topics in effect, sent once after connect
//! - `event` - one change event with its bus sequence number
//! - `resync` - events were dropped; re-read standings and the leaderboard
//! - `heartbeat` - periodic keep-alive
//! - `pong` - reply to a client `ping`
//! - `error` - unparseable client message
//!
//! Messages (client → server):
//! - `ping` - keep-alive ping
//!
//! ```json
//! {"type": "event", "seq": 42, "event": {"type": "badge_awarded", "user_id": "ada", "badge_id": "food-hero"}}
//! {"type": "resync", "missed": 3}
//! ```

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use super::SharedState;
use crate::bus::{Subscription, SubscriptionError, TopicSet};
use crate::error::{LedgerError, Result};
use crate::types::{ChangeEvent, Topic};

const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Message sent from server to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    Subscribed { topics: Vec<Topic> },
    Event { seq: u64, event: ChangeEvent },
    /// The client missed `missed` events and must re-fetch
    Resync { missed: u64 },
    Heartbeat { timestamp: String, interval_secs: u64 },
    Pong { timestamp: String },
    Error { message: String },
}

/// Message received from client
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
}

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    pub topics: Option<String>,
}

/// Parse `stats,badges,...`; missing or blank means every topic
pub fn parse_topics(raw: Option<&str>) -> Result<TopicSet> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Ok(TopicSet::all());
    };
    let topics: TopicSet = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<Topic>().map_err(LedgerError::Validation))
        .collect::<Result<_>>()?;
    if topics.is_empty() {
        return Err(LedgerError::Validation(format!("no topics in {:?}", raw)));
    }
    Ok(topics)
}

/// GET /ws
pub async fn feed(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Query(query): Query<FeedQuery>,
) -> Result<Response> {
    let topics = parse_topics(query.topics.as_deref())?;
    // Subscribe before the upgrade completes so nothing published meanwhile is missed.
    let subscription = state.services.bus.subscribe(topics);
    Ok(ws.on_upgrade(move |socket| handle_feed(socket, subscription)))
}

async fn handle_feed(socket: WebSocket, mut subscription: Subscription) {
    let (mut sender, mut receiver) = socket.split();
    let topics: Vec<Topic> = subscription.topics().iter().collect();
    info!(?topics, "Feed client connected");

    if send(&mut sender, &FeedMessage::Subscribed { topics }).await.is_err() {
        return;
    }

    let period = Duration::from_secs(HEARTBEAT_INTERVAL_SECS);
    let mut heartbeat = interval_at(Instant::now() + period, period);

    loop {
        let outgoing = tokio::select! {
            next = subscription.recv() => match next {
                Ok(envelope) => FeedMessage::Event { seq: envelope.seq, event: envelope.event },
                Err(SubscriptionError::Lagged(missed)) => {
                    debug!(missed, "Feed client lagged");
                    FeedMessage::Resync { missed }
                }
                Err(SubscriptionError::Closed) => break,
            },

            _ = heartbeat.tick() => FeedMessage::Heartbeat {
                timestamp: now_iso(),
                interval_secs: HEARTBEAT_INTERVAL_SECS,
            },

            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Ping) => FeedMessage::Pong { timestamp: now_iso() },
                    Err(e) => FeedMessage::Error { message: format!("invalid message: {}", e) },
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("Feed WebSocket error: {}", e);
                    break;
                }
            },
        };

        if send(&mut sender, &outgoing).await.is_err() {
            break;
        }
    }

    info!("Feed client disconnected");
}

async fn send<S>(sender: &mut S, message: &FeedMessage) -> std::result::Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to encode feed message: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(json)).await.map_err(|_| ())
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topics() {
        assert_eq!(parse_topics(None).unwrap(), TopicSet::all());
        assert_eq!(parse_topics(Some(" ")).unwrap(), TopicSet::all());

        let set = parse_topics(Some("stats, badges")).unwrap();
        assert!(set.contains(Topic::Stats) && set.contains(Topic::Badges));
        assert!(!set.contains(Topic::Donations));

        assert!(matches!(parse_topics(Some("stats,weather")), Err(LedgerError::Validation(_))));
        assert!(matches!(parse_topics(Some(",,")), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_event_message_shape() {
        let message = FeedMessage::Event {
            seq: 7,
            event: ChangeEvent::BadgeAwarded {
                user_id: "ada".into(),
                badge_id: "food-hero".into(),
            },
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["event"]["type"], "badge_awarded");
    }
}
