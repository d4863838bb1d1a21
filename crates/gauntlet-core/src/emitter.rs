//! Ordered, replayable room events.
//!
//! Each room (one per sprint) has a sequence allocated by a shared
//! [`SequenceCounter`], a bounded time-limited replay buffer, and a
//! broadcast channel for live delivery. Allocation, buffering and broadcast
//! happen under one per-room lock, so live order always equals sequence
//! order.
//!
//! Observers never apply backpressure: a slow subscriber lags on the
//! broadcast channel and catches up from the buffer instead.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gauntlet_state::{ContentDigest, SequenceCounter, StorageError};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::{Event, EventMeta, EventType};
use crate::metrics::METRICS;
use crate::obs;

fn default_retention_secs() -> u64 {
    3600
}

fn default_max_buffered_events() -> usize {
    10_000
}

fn default_channel_capacity() -> usize {
    1024
}

/// Replay buffer and channel sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmitterConfig {
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_max_buffered_events")]
    pub max_buffered_events: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            max_buffered_events: default_max_buffered_events(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl EmitterConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Errors from the emitter.
#[derive(Debug, thiserror::Error)]
pub enum EmitterError {
    #[error("sequence allocation failed for room {room}: {source}")]
    Sequence {
        room: String,
        #[source]
        source: StorageError,
    },
}

/// Result type for emitter operations.
pub type Result<T> = std::result::Result<T, EmitterError>;

/// Events after a given sequence, as far as the buffer still holds them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayBatch {
    pub events: Vec<Event>,
    /// The buffer no longer holds `since + 1`; some events were pruned
    pub truncated: bool,
}

struct RoomState {
    buffer: VecDeque<Event>,
    last_sequence: u64,
    /// None once the room is closed
    tx: Option<broadcast::Sender<Event>>,
}

impl RoomState {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            buffer: VecDeque::new(),
            last_sequence: 0,
            tx: Some(tx),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>, config: &EmitterConfig) {
        let retention = chrono::Duration::seconds(config.retention_secs as i64);
        while self
            .buffer
            .front()
            .is_some_and(|e| now - e.timestamp > retention)
        {
            self.buffer.pop_front();
        }
        while self.buffer.len() > config.max_buffered_events {
            self.buffer.pop_front();
        }
    }

    fn replay(&self, since: u64) -> ReplayBatch {
        let events: Vec<Event> = self
            .buffer
            .iter()
            .filter(|e| e.sequence > since)
            .cloned()
            .collect();
        let truncated = self.last_sequence > since
            && events.first().map_or(true, |e| e.sequence > since + 1);
        ReplayBatch { events, truncated }
    }
}

type RoomHandle = Arc<Mutex<RoomState>>;

/// Allocates sequences, buffers and broadcasts room events.
pub struct EventEmitter {
    counter: Arc<dyn SequenceCounter>,
    rooms: RwLock<HashMap<String, RoomHandle>>,
    config: EmitterConfig,
}

impl EventEmitter {
    pub fn new(counter: Arc<dyn SequenceCounter>, config: EmitterConfig) -> Self {
        Self {
            counter,
            rooms: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.config
    }

    async fn room(&self, room: &str) -> RoomHandle {
        if let Some(handle) = self.rooms.read().await.get(room) {
            return Arc::clone(handle);
        }
        let mut rooms = self.rooms.write().await;
        Arc::clone(
            rooms
                .entry(room.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(RoomState::new(self.config.channel_capacity)))),
        )
    }

    /// Sequence, buffer and broadcast one event.
    #[instrument(skip(self, payload, meta), fields(room = %room, event_type = %event_type))]
    pub async fn emit(
        &self,
        event_type: EventType,
        room: &str,
        payload: serde_json::Value,
        meta: Option<EventMeta>,
    ) -> Result<Event> {
        let handle = self.room(room).await;
        let mut state = handle.lock().await;

        let sequence = self
            .counter
            .next(room)
            .await
            .map_err(|source| EmitterError::Sequence {
                room: room.to_string(),
                source,
            })?;
        let event = Event {
            id: Uuid::new_v4(),
            event_type,
            sequence,
            timestamp: Utc::now(),
            room: room.to_string(),
            payload,
            meta,
        };

        state.last_sequence = sequence;
        state.buffer.push_back(event.clone());
        state.prune(event.timestamp, &self.config);
        // No receivers is fine; the buffer still has it.
        if let Some(tx) = &state.tx {
            let _ = tx.send(event.clone());
        }

        METRICS.inc_events_emitted();
        debug!(sequence, "event emitted");
        Ok(event)
    }

    /// Buffered events with `sequence > since`.
    pub async fn replay(&self, room: &str, since: u64) -> ReplayBatch {
        let handle = self.room(room).await;
        let mut state = handle.lock().await;
        state.prune(Utc::now(), &self.config);
        state.replay(since)
    }

    /// Last sequence emitted in the room (0 if none).
    pub async fn last_sequence(&self, room: &str) -> u64 {
        let handle = self.room(room).await;
        let state = handle.lock().await;
        state.last_sequence
    }

    /// Drop buffered events older than the retention window as of `now`.
    pub async fn prune_expired_at(&self, now: DateTime<Utc>) {
        let rooms: Vec<RoomHandle> = self.rooms.read().await.values().cloned().collect();
        for handle in rooms {
            handle.lock().await.prune(now, &self.config);
        }
    }

    /// Catch-up batch after `since`, then live events.
    pub async fn subscribe(&self, room: &str, since: u64) -> Subscription {
        let handle = self.room(room).await;
        let mut state = handle.lock().await;
        state.prune(Utc::now(), &self.config);
        // Subscribing under the lock: every later event reaches `rx`.
        let rx = match &state.tx {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        };
        let batch = state.replay(since);
        drop(state);

        Subscription {
            room: room.to_string(),
            handle,
            config: self.config.clone(),
            rx,
            pending: batch.events.into(),
            last_seen: since,
            truncated: batch.truncated,
        }
    }

    /// End live delivery for a room and release its buffer.
    ///
    /// Subscribers drain what they already received, then see the end of
    /// the stream.
    pub async fn close_room(&self, room: &str) {
        let removed = self.rooms.write().await.remove(room);
        if let Some(handle) = removed {
            handle.lock().await.tx = None;
        }
    }

    /// Forward a room's events to an observer from a background task.
    ///
    /// The task ends when the room is closed. Delivery failures are logged and counted; the event stays in the
    /// replay buffer for when the observer reconnects.
    pub async fn attach_observer(
        &self,
        room: &str,
        since: u64,
        transport: Arc<dyn ObserverTransport>,
    ) -> JoinHandle<()> {
        let mut subscription = self.subscribe(room, since).await;
        tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                if let Err(e) = transport.deliver(&event).await {
                    METRICS.inc_delivery_failures();
                    obs::emit_delivery_failure(&event.room, transport.id(), event.sequence, &e);
                }
            }
        })
    }
}

/// A room subscription: catch-up events first, then live ones.
///
/// Yields each sequence at most once and in increasing order. When the
/// live channel drops events (a lagging consumer), the missing range is
/// re-read from the replay buffer.
pub struct Subscription {
    room: String,
    handle: RoomHandle,
    config: EmitterConfig,
    rx: broadcast::Receiver<Event>,
    pending: VecDeque<Event>,
    last_seen: u64,
    truncated: bool,
}

impl Subscription {
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Whether the catch-up batch (or a later recovery) had to skip pruned events.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    async fn recover(&mut self) {
        let mut state = self.handle.lock().await;
        state.prune(Utc::now(), &self.config);
        let batch = state.replay(self.last_seen);
        drop(state);
        self.truncated |= batch.truncated;
        self.pending = batch.events.into();
    }

    /// Next event, waiting for live traffic once caught up.
    ///
    /// Returns `None` after the room is closed and everything was read.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.sequence <= self.last_seen {
                    continue;
                }
                self.last_seen = event.sequence;
                return Some(event);
            }

            match self.rx.recv().await {
                Ok(event) if event.sequence <= self.last_seen => continue,
                Ok(event) if event.sequence == self.last_seen + 1 => {
                    self.last_seen = event.sequence;
                    return Some(event);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    debug!(room = %self.room, last_seen = self.last_seen, "subscription recovering from buffer");
                    self.recover().await;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is ready, without waiting for live traffic.
    pub fn try_next(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.sequence <= self.last_seen {
                    continue;
                }
                self.last_seen = event.sequence;
                return Some(event);
            }
            match self.rx.try_recv() {
                Ok(event) if event.sequence <= self.last_seen => continue,
                Ok(event) if event.sequence == self.last_seen + 1 => {
                    self.last_seen = event.sequence;
                    return Some(event);
                }
                _ => return None,
            }
        }
    }
}

/// Push side of an observer connection.
#[async_trait]
pub trait ObserverTransport: Send + Sync {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    async fn deliver(&self, event: &Event) -> anyhow::Result<()>;
}

/// SHA-256 over the ordered (sequence, type, payload) triples.
///
/// Two replays with the same digest carry the same events in the same
/// order; ids and timestamps are ignored.
pub fn replay_digest(events: &[Event]) -> ContentDigest {
    let mut bytes = Vec::new();
    for e in events {
        bytes.extend_from_slice(e.sequence.to_string().as_bytes());
        bytes.push(b'|');
        bytes.extend_from_slice(e.event_type.as_str().as_bytes());
        bytes.push(b'|');
        bytes.extend_from_slice(e.payload.to_string().as_bytes());
        bytes.push(b'\n');
    }
    ContentDigest::from_bytes(&bytes)
}
