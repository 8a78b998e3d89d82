//! Subscription broker
//!
//! Every run gets a room: a broadcast channel carrying its output lines and
//! events while it is live. A join first replays what is already on disk,
//! then subscribes if the room is still open. The disk read and the
//! subscribe are not atomic, so a line written between the two can be
//! missed by that one subscriber; it is still in the log file.

use crate::events::EventRecord;
use crate::types::RunId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// A message delivered to room subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamMessage {
    /// Output text, one or more complete lines
    Log { data: String },

    /// A lifecycle milestone
    Event(EventRecord),

    /// The subscriber fell behind and skipped this many messages
    Lagged { missed: u64 },

    /// No further messages will follow
    End,
}

impl StreamMessage {
    pub fn log(data: impl Into<String>) -> Self {
        Self::Log { data: data.into() }
    }
}

/// Per-run broadcast rooms
#[derive(Debug)]
pub struct RoomBroker {
    capacity: usize,
    rooms: Mutex<HashMap<RunId, broadcast::Sender<StreamMessage>>>,
}

impl RoomBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Open the room for `id`; returns false if it was already open
    pub fn open(&self, id: &RunId) -> bool {
        let mut rooms = self.rooms.lock();
        if rooms.contains_key(id) {
            return false;
        }
        let (tx, _) = broadcast::channel(self.capacity);
        rooms.insert(id.clone(), tx);
        debug!(run_id = %id, "Opened room");
        true
    }

    pub fn is_open(&self, id: &RunId) -> bool {
        self.rooms.lock().contains_key(id)
    }

    /// Send `message` to everyone in the room; returns the receiver count
    pub fn publish(&self, id: &RunId, message: StreamMessage) -> usize {
        match self.rooms.lock().get(id) {
            Some(tx) => tx.send(message).unwrap_or(0),
            None => 0,
        }
    }

    /// Broadcast `End` and close the room
    pub fn end(&self, id: &RunId) {
        if let Some(tx) = self.rooms.lock().remove(id) {
            let _ = tx.send(StreamMessage::End);
            debug!(run_id = %id, subscribers = tx.receiver_count(), "Closed room");
        }
    }

    pub fn subscribe(&self, id: &RunId) -> Option<broadcast::Receiver<StreamMessage>> {
        self.rooms.lock().get(id).map(broadcast::Sender::subscribe)
    }

    /// Finish a join whose replay has already been read
    pub fn attach(&self, id: &RunId, replay: String, events: Vec<EventRecord>) -> Join {
        let live = self.subscribe(id);
        debug!(run_id = %id, live = live.is_some(), "Joined room");
        Join {
            id: id.clone(),
            replay,
            events,
            live,
            ended: false,
        }
    }
}

/// The result of joining a run's room
#[derive(Debug)]
pub struct Join {
    pub id: RunId,

    /// Log content written before the join
    pub replay: String,

    /// Compacted events recorded before the join
    pub events: Vec<EventRecord>,

    live: Option<broadcast::Receiver<StreamMessage>>,
    ended: bool,
}

impl Join {
    /// Whether the room was open at join time
    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Replay as messages: the log first, then each event
    pub fn replay_messages(&self) -> Vec<StreamMessage> {
        let mut messages = Vec::with_capacity(self.events.len() + 1);
        if !self.replay.is_empty() {
            messages.push(StreamMessage::log(self.replay.clone()));
        }
        messages.extend(self.events.iter().cloned().map(StreamMessage::Event));
        messages
    }

    /// Next live message.
    ///
    /// Yields `End` exactly once (immediately if the room was already
    /// closed at join time), then `None`.
    pub async fn next(&mut self) -> Option<StreamMessage> {
        if self.ended {
            return None;
        }
        let Some(live) = self.live.as_mut() else {
            self.ended = true;
            return Some(StreamMessage::End);
        };

        let message = match live.recv().await {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(run_id = %self.id, missed, "Subscriber lagged behind room");
                return Some(StreamMessage::Lagged { missed });
            }
            Err(broadcast::error::RecvError::Closed) => StreamMessage::End,
        };

        if message == StreamMessage::End {
            self.ended = true;
            self.live = None;
        }
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_in_order() {
        let broker = RoomBroker::new(16);
        let id = RunId::new("1");
        assert!(broker.open(&id));
        assert!(!broker.open(&id));

        let mut join = broker.attach(&id, String::new(), Vec::new());
        assert!(join.is_live());

        broker.publish(&id, StreamMessage::log("a\n"));
        broker.publish(&id, StreamMessage::log("b\n"));
        broker.end(&id);

        assert_eq!(join.next().await, Some(StreamMessage::log("a\n")));
        assert_eq!(join.next().await, Some(StreamMessage::log("b\n")));
        assert_eq!(join.next().await, Some(StreamMessage::End));
        assert_eq!(join.next().await, None);
    }

    #[tokio::test]
    async fn test_join_after_end_delivers_only_end() {
        let broker = RoomBroker::new(16);
        let id = RunId::new("1");
        broker.open(&id);
        broker.end(&id);
        assert!(!broker.is_open(&id));

        let mut join = broker.attach(&id, "full log\n".to_string(), Vec::new());
        assert!(!join.is_live());
        assert_eq!(join.replay_messages(), vec![StreamMessage::log("full log\n")]);
        assert_eq!(join.next().await, Some(StreamMessage::End));
        assert_eq!(join.next().await, None);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_told_what_it_missed() {
        let broker = RoomBroker::new(2);
        let id = RunId::new("1");
        broker.open(&id);
        let mut join = broker.attach(&id, String::new(), Vec::new());

        for line in ["1\n", "2\n", "3\n", "4\n"] {
            broker.publish(&id, StreamMessage::log(line));
        }

        assert_eq!(join.next().await, Some(StreamMessage::Lagged { missed: 2 }));
        assert_eq!(join.next().await, Some(StreamMessage::log("3\n")));
    }

    #[test]
    fn test_publish_without_room_is_dropped() {
        let broker = RoomBroker::new(4);
        assert_eq!(broker.publish(&RunId::new("x"), StreamMessage::End), 0);
    }

    #[test]
    fn test_wire_format() {
        let log = serde_json::to_value(StreamMessage::log("line\n")).unwrap();
        assert_eq!(log, serde_json::json!({ "type": "log", "data": "line\n" }));

        let event = serde_json::to_value(StreamMessage::Event(EventRecord {
            event: "job-start".to_string(),
            job_name: "site".to_string(),
            timestamp: 5,
        }))
        .unwrap();
        assert_eq!(event["type"], "event");
        assert_eq!(event["jobName"], "site");

        let end = serde_json::to_value(StreamMessage::End).unwrap();
        assert_eq!(end, serde_json::json!({ "type": "end" }));
    }
}
