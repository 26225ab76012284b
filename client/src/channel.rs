//! Event channel contract shared by the in-process hub and the WebSocket
//! client.
//!
//! Transports deliver every event to every subscriber of the room, the
//! publisher included. Dropping our own events is the sync engine's job and
//! happens in exactly one place (`SyncEngine::is_own`).

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::protocol::SyncEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Live relay only; subscribers that are away miss the event
    Ephemeral,
    /// Ordered per-room log plus derived room-change notifications
    Durable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

pub type EventHandler = Arc<dyn Fn(SyncEvent) + Send + Sync>;

#[async_trait]
pub trait EventChannel: Send + Sync {
    fn delivery(&self) -> Delivery;

    fn status(&self) -> watch::Receiver<ConnectionStatus>;

    async fn publish(&self, room_id: Uuid, event: SyncEvent) -> SyncResult<()>;

    /// Register `handler` for the room. With durable delivery, logged events
    /// after `since_seq` are replayed first.
    async fn subscribe(
        &self,
        room_id: Uuid,
        since_seq: Option<u64>,
        handler: EventHandler,
    ) -> SyncResult<Subscription>;
}

/// Unsubscribe handle. Removal is synchronous, on `unsubscribe` or drop.
pub struct Subscription {
    room_id: Uuid,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(room_id: Uuid, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            room_id,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("room_id", &self.room_id)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Per-room handler table
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    by_room: Mutex<HashMap<Uuid, Vec<(u64, EventHandler)>>>,
}

impl HandlerRegistry {
    pub fn add(&self, room_id: Uuid, handler: EventHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.by_room
            .lock()
            .entry(room_id)
            .or_default()
            .push((id, handler));
        id
    }

    /// Remove a handler; returns how many remain for the room
    pub fn remove(&self, room_id: Uuid, handler_id: u64) -> usize {
        let mut rooms = self.by_room.lock();
        let Some(handlers) = rooms.get_mut(&room_id) else {
            return 0;
        };
        handlers.retain(|(id, _)| *id != handler_id);
        let remaining = handlers.len();
        if remaining == 0 {
            rooms.remove(&room_id);
        }
        remaining
    }

    pub fn count(&self, room_id: Uuid) -> usize {
        self.by_room.lock().get(&room_id).map_or(0, Vec::len)
    }

    /// Invoke every handler of the room, outside the table lock
    pub fn dispatch(&self, room_id: Uuid, event: &SyncEvent) {
        let handlers: Vec<EventHandler> = self
            .by_room
            .lock()
            .get(&room_id)
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in handlers {
            handler(event.clone());
        }
    }
}
