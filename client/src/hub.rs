//! In-process room store and event channel. Used for single-process parties
//! and as the reference transport in tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::channel::{
    ConnectionStatus, Delivery, EventChannel, EventHandler, HandlerRegistry, Subscription,
};
use crate::constants::EVENT_LOG_LIMIT;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{Room, RoomInit, RoomPatch, SyncEvent};
use crate::store::RoomStore;
use crate::utils::current_unix_millis;

/// Durable publishes and subscribes deliver while holding the hub lock, so
/// an event is either replayed or delivered live, never both or neither.
/// Handlers therefore must not call back into the hub; queue instead.
pub struct LocalHub {
    delivery: Delivery,
    log_limit: usize,
    state: Mutex<HubState>,
    handlers: Arc<HandlerRegistry>,
    status: watch::Sender<ConnectionStatus>,
}

#[derive(Default)]
struct HubState {
    rooms: HashMap<String, Room>,
    codes: HashMap<Uuid, String>,
    logs: HashMap<Uuid, EventLog>,
}

/// Bounded, ordered event log. Sequence numbers start at 1 and never repeat.
#[derive(Default)]
struct EventLog {
    head_seq: u64,
    events: VecDeque<(u64, SyncEvent)>,
}

impl EventLog {
    fn append(&mut self, event: SyncEvent, limit: usize) -> u64 {
        self.head_seq += 1;
        self.events.push_back((self.head_seq, event));
        while self.events.len() > limit.max(1) {
            self.events.pop_front();
        }
        self.head_seq
    }

    fn since(&self, seq: u64) -> impl Iterator<Item = &SyncEvent> + '_ {
        self.events
            .iter()
            .filter(move |(logged, _)| *logged > seq)
            .map(|(_, event)| event)
    }
}

impl LocalHub {
    pub fn new(delivery: Delivery) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connected);
        Self {
            delivery,
            log_limit: EVENT_LOG_LIMIT,
            state: Mutex::new(HubState::default()),
            handlers: Arc::new(HandlerRegistry::default()),
            status,
        }
    }

    pub fn ephemeral() -> Self {
        Self::new(Delivery::Ephemeral)
    }

    pub fn durable() -> Self {
        Self::new(Delivery::Durable)
    }

    pub fn with_log_limit(mut self, limit: usize) -> Self {
        self.log_limit = limit;
        self
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, room_id: Uuid) -> usize {
        self.handlers.count(room_id)
    }

    pub fn room(&self, code: &str) -> Option<Room> {
        self.state.lock().rooms.get(code).cloned()
    }
}

#[async_trait]
impl RoomStore for LocalHub {
    async fn get_room(&self, code: &str) -> SyncResult<Option<Room>> {
        Ok(self.room(code))
    }

    async fn create_room(&self, code: &str, host_id: &str, initial: RoomInit) -> SyncResult<Room> {
        let mut state = self.state.lock();
        if let Some(existing) = state.rooms.get(code) {
            return Ok(existing.clone());
        }
        let room = Room {
            id: Uuid::new_v4(),
            code: code.to_string(),
            host_id: host_id.to_string(),
            video: initial.video,
            is_playing: initial.is_playing,
            position: initial.position.max(0.0),
            last_updated: current_unix_millis(),
            updated_by: Some(host_id.to_string()),
            last_event_seq: 0,
        };
        state.codes.insert(room.id, code.to_string());
        state.rooms.insert(code.to_string(), room.clone());
        tracing::info!("Room {} created locally by {}", code, host_id);
        Ok(room)
    }

    async fn update_room(&self, room_id: Uuid, sender_id: &str, patch: RoomPatch) -> SyncResult<()> {
        let changed = {
            let mut state = self.state.lock();
            let code = state
                .codes
                .get(&room_id)
                .cloned()
                .ok_or_else(|| SyncError::RoomNotFound(room_id.to_string()))?;
            let seq = state.logs.get(&room_id).map_or(0, |log| log.head_seq);
            let room = state
                .rooms
                .get_mut(&code)
                .ok_or_else(|| SyncError::RoomNotFound(code.clone()))?;
            if room.host_id != sender_id {
                return Err(SyncError::Rejected(
                    "Only the host may update room state".to_string(),
                ));
            }
            room.apply(&patch, sender_id, current_unix_millis());
            room.last_event_seq = seq;
            room.clone()
        };

        if self.delivery == Delivery::Durable {
            self.handlers.dispatch(room_id, &changed.change_event());
        }
        Ok(())
    }
}

#[async_trait]
impl EventChannel for LocalHub {
    fn delivery(&self) -> Delivery {
        self.delivery
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    async fn publish(&self, room_id: Uuid, event: SyncEvent) -> SyncResult<()> {
        if self.delivery == Delivery::Ephemeral {
            self.handlers.dispatch(room_id, &event);
            return Ok(());
        }

        let mut state = self.state.lock();
        let seq = state
            .logs
            .entry(room_id)
            .or_default()
            .append(event.clone(), self.log_limit);
        if let Some(code) = state.codes.get(&room_id).cloned() {
            if let Some(room) = state.rooms.get_mut(&code) {
                room.last_event_seq = seq;
            }
        }
        self.handlers.dispatch(room_id, &event);
        Ok(())
    }

    async fn subscribe(
        &self,
        room_id: Uuid,
        since_seq: Option<u64>,
        handler: EventHandler,
    ) -> SyncResult<Subscription> {
        let handler_id = {
            let state = (self.delivery == Delivery::Durable).then(|| self.state.lock());
            let backlog = state
                .as_ref()
                .zip(since_seq)
                .and_then(|(state, since)| Some((state.logs.get(&room_id)?, since)));
            if let Some((log, since)) = backlog {
                for event in log.since(since) {
                    handler(event.clone());
                }
            }
            self.handlers.add(room_id, handler)
        };

        let handlers = Arc::clone(&self.handlers);
        Ok(Subscription::new(room_id, move || {
            handlers.remove(room_id, handler_id);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EventBody;

    fn collector() -> (EventHandler, Arc<Mutex<Vec<SyncEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (Arc::new(move |event| sink.lock().push(event)), seen)
    }

    #[tokio::test]
    async fn ephemeral_hub_misses_events_sent_before_subscribing() {
        let hub = LocalHub::ephemeral();
        let room = hub.create_room("r", "host", RoomInit::default()).await.unwrap();
        hub.publish(room.id, SyncEvent::new("host", EventBody::Play { position: None }))
            .await
            .unwrap();

        let (handler, seen) = collector();
        let _sub = hub.subscribe(room.id, Some(0), handler).await.unwrap();
        hub.update_room(room.id, "host", RoomPatch::default()).await.unwrap();
        assert!(seen.lock().is_empty());

        hub.publish(room.id, SyncEvent::new("host", EventBody::Seek { position: 3.0 }))
            .await
            .unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn durable_hub_replays_and_derives_snapshots() {
        let hub = LocalHub::durable();
        let room = hub.create_room("r", "host", RoomInit::default()).await.unwrap();
        for position in [1.0, 2.0, 3.0] {
            hub.publish(room.id, SyncEvent::new("host", EventBody::Seek { position }))
                .await
                .unwrap();
        }
        assert_eq!(hub.room("r").unwrap().last_event_seq, 3);

        let (handler, seen) = collector();
        let _sub = hub.subscribe(room.id, Some(1), handler).await.unwrap();
        assert_eq!(
            seen.lock()
                .iter()
                .map(|e| e.body.clone())
                .collect::<Vec<_>>(),
            vec![
                EventBody::Seek { position: 2.0 },
                EventBody::Seek { position: 3.0 }
            ]
        );

        hub.update_room(
            room.id,
            "host",
            RoomPatch {
                is_playing: Some(true),
                ..RoomPatch::default()
            },
        )
        .await
        .unwrap();
        let last = seen.lock().last().cloned().unwrap();
        assert_eq!(last.sender_id, "host");
        assert!(matches!(last.body, EventBody::StateSnapshot(ref s) if s.is_playing));
    }

    #[tokio::test]
    async fn durable_log_keeps_only_the_newest_events() {
        let hub = LocalHub::durable().with_log_limit(2);
        let room = hub.create_room("r", "host", RoomInit::default()).await.unwrap();
        for position in [1.0, 2.0, 3.0, 4.0] {
            hub.publish(room.id, SyncEvent::new("host", EventBody::Seek { position }))
                .await
                .unwrap();
        }
        assert_eq!(hub.room("r").unwrap().last_event_seq, 4);

        let (handler, seen) = collector();
        let _sub = hub.subscribe(room.id, Some(0), handler).await.unwrap();
        assert_eq!(
            seen.lock()
                .iter()
                .map(|e| e.body.clone())
                .collect::<Vec<_>>(),
            vec![
                EventBody::Seek { position: 3.0 },
                EventBody::Seek { position: 4.0 }
            ]
        );

        hub.update_room(room.id, "host", RoomPatch::default()).await.unwrap();
        assert_eq!(hub.room("r").unwrap().last_event_seq, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscribing_mid_stream_sees_every_event_once() {
        let hub = Arc::new(LocalHub::durable());
        let room_id = hub.create_room("r", "host", RoomInit::default()).await.unwrap().id;

        let publisher = {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                for n in 1..=200 {
                    hub.publish(
                        room_id,
                        SyncEvent::new("host", EventBody::Seek { position: n as f64 }),
                    )
                    .await
                    .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        tokio::task::yield_now().await;
        let (handler, seen) = collector();
        let _sub = hub.subscribe(room_id, Some(0), handler).await.unwrap();
        publisher.await.unwrap();

        let positions: Vec<f64> = seen
            .lock()
            .iter()
            .filter_map(|e| match e.body {
                EventBody::Seek { position } => Some(position),
                _ => None,
            })
            .collect();
        assert_eq!(positions, (1..=200).map(f64::from).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn create_returns_existing_room() {
        let hub = LocalHub::durable();
        let first = hub.create_room("r", "a", RoomInit::default()).await.unwrap();
        let second = hub.create_room("r", "b", RoomInit::default()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.host_id, "a");

        let err = hub
            .update_room(first.id, "b", RoomPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected(_)));
    }
}
