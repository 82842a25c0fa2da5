//! Event Bus (C1): per-session publish/subscribe with bounded replay.
//!
//! A subscriber always sees the full current buffer snapshot followed by
//! live events in global order, with no duplicates and no gaps across the
//! snapshot/live boundary. Per-session monotone `seq` numbers make this
//! robust in a way the teacher's "skip N duplicates" heuristic is not
//! (spec.md §9 design note): the listener registers before the snapshot
//! is read, and the subscriber de-duplicates live events by `seq` rather
//! than by position.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::types::{Event, EventType};

/// Replay buffer capacity; overflow drops the oldest event and records a
/// single `buffer_overflow` event per session.
pub const REPLAY_BUFFER_CAP: usize = 10_000;

/// Per-subscriber channel capacity before the bus drops a lagging
/// subscriber.
pub const SUBSCRIBER_QUEUE_CAP: usize = 256;

struct SessionBus {
    next_seq: u64,
    buffer: Vec<Event>,
    overflowed: bool,
    subscribers: Vec<mpsc::Sender<Event>>,
}

impl SessionBus {
    fn new() -> Self {
        Self { next_seq: 1, buffer: Vec::new(), overflowed: false, subscribers: Vec::new() }
    }
}

/// A finite sequence of events for one subscriber: the buffer snapshot
/// followed by live events, terminating on `session_done` or disconnect.
pub struct Subscription {
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Pull the next event, or `None` once the sequence has ended.
    pub async fn next(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}

pub struct EventBus {
    sessions: Mutex<HashMap<Uuid, SessionBus>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    /// Append an event to the session's replay buffer and deliver it to
    /// every current subscriber. Publication never fails the publisher:
    /// a full subscriber queue drops that subscriber with a terminal
    /// `subscriber_lagged` event instead of blocking or erroring.
    #[instrument(skip(self, data))]
    pub fn emit(&self, session_id: Uuid, worker_id: Option<&str>, event_type: EventType, data: Value) -> Event {
        let mut sessions = self.sessions.lock().unwrap();
        let bus = sessions.entry(session_id).or_insert_with(SessionBus::new);

        let event = Event {
            seq: bus.next_seq,
            session_id,
            worker_id: worker_id.map(String::from),
            event_type,
            data,
            timestamp: chrono::Utc::now(),
        };
        bus.next_seq += 1;

        if bus.buffer.len() >= REPLAY_BUFFER_CAP {
            bus.buffer.remove(0);
            if !bus.overflowed {
                bus.overflowed = true;
                let overflow_event = Event {
                    seq: bus.next_seq,
                    session_id,
                    worker_id: None,
                    event_type: EventType::BufferOverflow,
                    data: Value::Null,
                    timestamp: chrono::Utc::now(),
                };
                bus.next_seq += 1;
                bus.buffer.push(overflow_event.clone());
                Self::deliver(bus, overflow_event);
            }
        }
        bus.buffer.push(event.clone());
        Self::deliver(bus, event.clone());
        event
    }

    fn deliver(bus: &mut SessionBus, event: Event) {
        let mut lagged = Vec::new();
        for (idx, sender) in bus.subscribers.iter().enumerate() {
            if sender.try_send(event.clone()).is_err() {
                lagged.push(idx);
            }
        }
        for idx in lagged.into_iter().rev() {
            let sender = bus.subscribers.remove(idx);
            let terminal = Event {
                seq: event.seq,
                session_id: event.session_id,
                worker_id: None,
                event_type: EventType::SubscriberLagged,
                data: Value::Null,
                timestamp: chrono::Utc::now(),
            };
            // best-effort: a fresh bounded send, ignored if still full.
            let _ = sender.try_send(terminal);
            warn!(session_id = %event.session_id, "dropped a lagging subscriber");
        }
    }

    /// Register a subscriber, then return the buffer snapshot followed
    /// by live events. Registering the channel before reading the buffer
    /// and filtering live events by `seq <= snapshot's max seq` removes
    /// any snapshot/live race.
    #[instrument(skip(self))]
    pub fn subscribe(&self, session_id: Uuid) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAP);
        let mut sessions = self.sessions.lock().unwrap();
        let bus = sessions.entry(session_id).or_insert_with(SessionBus::new);

        bus.subscribers.push(tx.clone());
        let snapshot = bus.buffer.clone();
        drop(sessions);

        let (out_tx, out_rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAP);
        let last_snapshot_seq = snapshot.last().map(|e| e.seq).unwrap_or(0);
        tokio::spawn(async move {
            for event in snapshot {
                let is_done = event.event_type == EventType::SessionDone;
                if out_tx.send(event).await.is_err() {
                    return;
                }
                // A joiner arriving after the session already finished
                // gets the full replay and nothing else — there will
                // never be a live event for this session again, and the
                // `tx` clone held in `bus.subscribers` outlives this task.
                if is_done {
                    return;
                }
            }
            let mut live_rx = rx;
            while let Some(event) = live_rx.recv().await {
                if event.seq <= last_snapshot_seq {
                    continue;
                }
                let is_done = event.event_type == EventType::SessionDone;
                if out_tx.send(event).await.is_err() {
                    return;
                }
                if is_done {
                    return;
                }
            }
        });

        Subscription { receiver: out_rx }
    }

    /// Free the buffer for a session. Idempotent.
    pub fn cleanup(&self, session_id: Uuid) {
        self.sessions.lock().unwrap().remove(&session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_then_live_have_dense_seq_no_duplicates() {
        let bus = EventBus::new();
        let session_id = Uuid::new_v4();

        for i in 0..50 {
            bus.emit(session_id, None, EventType::Thinking, serde_json::json!({"i": i}));
        }

        let mut sub = bus.subscribe(session_id);

        for i in 50..100 {
            bus.emit(session_id, None, EventType::Thinking, serde_json::json!({"i": i}));
        }
        bus.emit(session_id, None, EventType::SessionDone, Value::Null);

        let mut seqs = Vec::new();
        while let Some(event) = sub.next().await {
            seqs.push(event.seq);
        }

        assert_eq!(seqs.len(), 101);
        for (idx, seq) in seqs.iter().enumerate() {
            assert_eq!(*seq, (idx + 1) as u64);
        }
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let bus = EventBus::new();
        let session_id = Uuid::new_v4();
        bus.emit(session_id, None, EventType::SessionStarted, Value::Null);
        bus.cleanup(session_id);
        bus.cleanup(session_id);
        assert!(bus.sessions.lock().unwrap().get(&session_id).is_none());
    }

    #[tokio::test]
    async fn subscriber_joining_after_done_still_gets_full_replay() {
        let bus = EventBus::new();
        let session_id = Uuid::new_v4();
        bus.emit(session_id, None, EventType::SessionStarted, Value::Null);
        bus.emit(session_id, None, EventType::SessionDone, Value::Null);

        let mut sub = bus.subscribe(session_id);
        let mut count = 0;
        while sub.next().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
