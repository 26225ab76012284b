use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use url::Url;
use uuid::Uuid;

use crate::protocol::{ClientInfo, LoggedEvent, RoomInit, RoomPatch, RoomRecord, VideoReference};

const LOG_TAG: &str = "[WatchParty Server]";
pub const DEFAULT_EVENT_LOG_LIMIT: usize = 500;
const MAX_CODE_LEN: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StateError {
    #[error("Room not found")]
    RoomNotFound,
    #[error("Only the host may update room state")]
    NotHost,
    #[error("Invalid room code: {0}")]
    InvalidCode(String),
    #[error("Invalid video url: {0}")]
    InvalidVideo(String),
}

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    /// All rooms: code -> canonical record
    rooms: Arc<DashMap<String, RoomRecord>>,
    /// Room id -> code index
    room_codes: Arc<DashMap<Uuid, String>>,
    /// Durable per-room event logs
    event_logs: Arc<DashMap<Uuid, Arc<RwLock<EventLog>>>>,
    /// Room subscriptions: room_id -> Vec<client_id>
    subscribers: Arc<DashMap<Uuid, Arc<RwLock<Vec<Uuid>>>>>,
    /// All connected clients: client_id -> ClientInfo
    pub clients: Arc<DashMap<Uuid, ClientInfo>>,
    event_log_limit: usize,
}

/// Bounded, ordered event log. Sequence numbers start at 1 and never repeat.
#[derive(Debug, Default)]
struct EventLog {
    head_seq: u64,
    events: VecDeque<LoggedEvent>,
}

impl EventLog {
    fn append(&mut self, event: Value, limit: usize) -> u64 {
        self.head_seq += 1;
        self.events.push_back(LoggedEvent {
            seq: self.head_seq,
            event,
        });
        while self.events.len() > limit.max(1) {
            self.events.pop_front();
        }
        self.head_seq
    }

    fn since(&self, seq: u64) -> Vec<LoggedEvent> {
        self.events
            .iter()
            .filter(|logged| logged.seq > seq)
            .cloned()
            .collect()
    }
}

/// Exclusive hold on one room's log. Appends fan out and subscribes replay
/// while it is held, so a subscriber gets each event exactly once and in
/// sequence order.
pub struct RoomLog {
    log: OwnedRwLockWriteGuard<EventLog>,
    limit: usize,
}

impl RoomLog {
    pub fn append(&mut self, event: Value) -> u64 {
        self.log.append(event, self.limit)
    }

    pub fn head_seq(&self) -> u64 {
        self.log.head_seq
    }

    pub fn since(&self, seq: u64) -> Vec<LoggedEvent> {
        self.log.since(seq)
    }
}

impl ServerState {
    pub fn new(event_log_limit: usize) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            room_codes: Arc::new(DashMap::new()),
            event_logs: Arc::new(DashMap::new()),
            subscribers: Arc::new(DashMap::new()),
            clients: Arc::new(DashMap::new()),
            event_log_limit,
        }
    }

    pub async fn get_room(&self, code: &str) -> Option<RoomRecord> {
        let record = self.rooms.get(code).map(|room| room.clone())?;
        Some(self.with_head_seq(record).await)
    }

    pub async fn get_room_by_id(&self, room_id: Uuid) -> Option<RoomRecord> {
        let code = self.room_codes.get(&room_id).map(|code| code.clone())?;
        self.get_room(&code).await
    }

    /// Create the room if the code is free, otherwise return the existing one.
    /// The boolean is true only for the writer that actually created it.
    pub async fn create_room(
        &self,
        code: Option<String>,
        host_id: String,
        initial: RoomInit,
    ) -> Result<(RoomRecord, bool), StateError> {
        let code = match code {
            Some(raw) => Self::sanitize_code(&raw).ok_or(StateError::InvalidCode(raw))?,
            None => self.generate_room_code(),
        };
        if let Some(video) = &initial.video {
            Self::validate_video(video)?;
        }

        let (record, created) = match self.rooms.entry(code.clone()) {
            Entry::Occupied(existing) => (existing.get().clone(), false),
            Entry::Vacant(slot) => {
                let record = RoomRecord {
                    id: Uuid::new_v4(),
                    code: code.clone(),
                    host_id: host_id.clone(),
                    video: initial.video,
                    is_playing: initial.is_playing,
                    position: initial.position.max(0.0),
                    last_updated: current_unix_millis(),
                    updated_by: Some(host_id.clone()),
                    last_event_seq: 0,
                };
                slot.insert(record.clone());
                (record, true)
            }
        };

        if created {
            self.room_codes.insert(record.id, code.clone());
            self.event_logs
                .insert(record.id, Arc::new(RwLock::new(EventLog::default())));
            self.subscribers
                .insert(record.id, Arc::new(RwLock::new(Vec::new())));
            tracing::info!("{LOG_TAG} Room {} created by {}", code, host_id);
        } else {
            tracing::debug!("{LOG_TAG} Room {} already exists, returning it", code);
        }

        Ok((self.with_head_seq(record).await, created))
    }

    pub async fn update_room(
        &self,
        room_id: Uuid,
        sender_id: &str,
        patch: RoomPatch,
    ) -> Result<RoomRecord, StateError> {
        if let Some(video) = &patch.video {
            Self::validate_video(video)?;
        }
        let code = self
            .room_codes
            .get(&room_id)
            .map(|code| code.clone())
            .ok_or(StateError::RoomNotFound)?;

        let record = {
            let mut room = self.rooms.get_mut(&code).ok_or(StateError::RoomNotFound)?;
            if room.host_id != sender_id {
                return Err(StateError::NotHost);
            }
            if let Some(video) = patch.video {
                room.video = Some(video);
            }
            if let Some(is_playing) = patch.is_playing {
                room.is_playing = is_playing;
            }
            if let Some(position) = patch.position {
                room.position = position.max(0.0);
            }
            room.last_updated = current_unix_millis();
            room.updated_by = Some(sender_id.to_string());
            room.clone()
        };

        Ok(self.with_head_seq(record).await)
    }

    pub async fn lock_log(&self, room_id: Uuid) -> Result<RoomLog, StateError> {
        let log = self
            .event_logs
            .get(&room_id)
            .map(|log| Arc::clone(&*log))
            .ok_or(StateError::RoomNotFound)?;
        Ok(RoomLog {
            log: log.write_owned().await,
            limit: self.event_log_limit,
        })
    }

    /// Register a subscription. Callers replaying history hold the room's
    /// `RoomLog` across this call.
    pub async fn subscribe(&self, client_id: Uuid, room_id: Uuid) -> Result<(), StateError> {
        let members = self
            .subscribers
            .get(&room_id)
            .map(|members| Arc::clone(&*members))
            .ok_or(StateError::RoomNotFound)?;
        {
            let mut members = members.write().await;
            if !members.contains(&client_id) {
                members.push(client_id);
            }
        }

        if let Some(mut client) = self.clients.get_mut(&client_id) {
            if !client.subscriptions.contains(&room_id) {
                client.subscriptions.push(room_id);
            }
        }

        tracing::info!("{LOG_TAG} Client {} subscribed to room {}", client_id, room_id);
        Ok(())
    }

    pub async fn unsubscribe(&self, client_id: Uuid, room_id: Uuid) {
        if let Some(members) = self
            .subscribers
            .get(&room_id)
            .map(|members| Arc::clone(&*members))
        {
            members.write().await.retain(|id| *id != client_id);
        }
        if let Some(mut client) = self.clients.get_mut(&client_id) {
            client.subscriptions.retain(|id| *id != room_id);
        }
        tracing::info!("{LOG_TAG} Client {} unsubscribed from room {}", client_id, room_id);
    }

    pub async fn get_subscribers(&self, room_id: Uuid) -> Vec<Uuid> {
        if let Some(members_ref) = self.subscribers.get(&room_id) {
            let members_lock = Arc::clone(&*members_ref);
            drop(members_ref);
            let members = members_lock.read().await;
            members.clone()
        } else {
            Vec::new()
        }
    }

    pub fn add_client(&self, client_id: Uuid) {
        self.clients.insert(client_id, ClientInfo::default());
        tracing::info!("{LOG_TAG} Client {} connected", client_id);
    }

    pub async fn remove_client(&self, client_id: Uuid) {
        let rooms = self
            .clients
            .get(&client_id)
            .map(|client| client.subscriptions.clone())
            .unwrap_or_default();
        for room_id in rooms {
            self.unsubscribe(client_id, room_id).await;
        }
        self.clients.remove(&client_id);
        tracing::info!("{LOG_TAG} Client {} disconnected", client_id);
    }

    async fn head_seq(&self, room_id: Uuid) -> u64 {
        let Some(log) = self.event_logs.get(&room_id).map(|log| Arc::clone(&*log)) else {
            return 0;
        };
        let head = log.read().await.head_seq;
        head
    }

    async fn with_head_seq(&self, mut record: RoomRecord) -> RoomRecord {
        record.last_event_seq = self.head_seq(record.id).await;
        record
    }

    fn generate_room_code(&self) -> String {
        loop {
            let raw = (Uuid::new_v4().as_u128() % 1_000_000) as u32;
            let code = format!("{:03}-{:03}", raw / 1000, raw % 1000);
            if !self.rooms.contains_key(&code) {
                break code;
            }
        }
    }

    fn sanitize_code(raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.len() > MAX_CODE_LEN {
            return None;
        }
        trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
            .then(|| trimmed.to_string())
    }

    fn validate_video(video: &VideoReference) -> Result<(), StateError> {
        match Url::parse(&video.url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
            _ => Err(StateError::InvalidVideo(video.url.clone())),
        }
    }
}

pub fn current_unix_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SourceKind;
    use serde_json::json;

    fn youtube() -> VideoReference {
        VideoReference {
            url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
            source_kind: SourceKind::EmbedApi,
        }
    }

    #[tokio::test]
    async fn create_is_first_writer_wins() {
        let state = ServerState::new(DEFAULT_EVENT_LOG_LIMIT);
        let (first, created) = state
            .create_room(Some("abc-123".into()), "host".into(), RoomInit::default())
            .await
            .unwrap();
        assert!(created);

        let (second, created) = state
            .create_room(
                Some("abc-123".into()),
                "intruder".into(),
                RoomInit {
                    video: Some(youtube()),
                    ..RoomInit::default()
                },
            )
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.host_id, "host");
        assert!(second.video.is_none());
    }

    #[tokio::test]
    async fn generated_codes_look_like_nnn_nnn() {
        let state = ServerState::new(DEFAULT_EVENT_LOG_LIMIT);
        let (room, _) = state
            .create_room(None, "host".into(), RoomInit::default())
            .await
            .unwrap();
        assert_eq!(room.code.len(), 7);
        assert_eq!(room.code.as_bytes()[3], b'-');
        assert!(state.get_room(&room.code).await.is_some());
    }

    #[tokio::test]
    async fn rejects_bad_codes_and_urls() {
        let state = ServerState::new(DEFAULT_EVENT_LOG_LIMIT);
        let err = state
            .create_room(Some("no spaces".into()), "host".into(), RoomInit::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidCode(_)));

        let err = state
            .create_room(
                Some("room".into()),
                "host".into(),
                RoomInit {
                    video: Some(VideoReference {
                        url: "javascript:alert(1)".into(),
                        source_kind: SourceKind::FullControl,
                    }),
                    ..RoomInit::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidVideo(_)));
    }

    #[tokio::test]
    async fn only_host_updates_room() {
        let state = ServerState::new(DEFAULT_EVENT_LOG_LIMIT);
        let (room, _) = state
            .create_room(Some("room".into()), "host".into(), RoomInit::default())
            .await
            .unwrap();

        let patch = RoomPatch {
            is_playing: Some(true),
            position: Some(42.0),
            ..RoomPatch::default()
        };
        assert_eq!(
            state.update_room(room.id, "guest", patch.clone()).await.unwrap_err(),
            StateError::NotHost
        );

        let updated = state.update_room(room.id, "host", patch).await.unwrap();
        assert!(updated.is_playing);
        assert_eq!(updated.position, 42.0);
        assert_eq!(updated.updated_by.as_deref(), Some("host"));

        assert_eq!(
            state
                .update_room(Uuid::new_v4(), "host", RoomPatch::default())
                .await
                .unwrap_err(),
            StateError::RoomNotFound
        );
    }

    #[tokio::test]
    async fn event_log_replays_after_sequence_and_is_bounded() {
        let state = ServerState::new(3);
        let (room, _) = state
            .create_room(Some("room".into()), "host".into(), RoomInit::default())
            .await
            .unwrap();

        {
            let mut log = state.lock_log(room.id).await.unwrap();
            for n in 1..=5 {
                assert_eq!(log.append(json!({ "n": n })), n);
            }

            let replay = log.since(3);
            assert_eq!(replay.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
            // oldest entries were dropped by retention
            assert_eq!(log.since(0).len(), 3);
            assert_eq!(log.head_seq(), 5);
        }
        assert_eq!(state.get_room("room").await.unwrap().last_event_seq, 5);
    }

    #[tokio::test]
    async fn removing_client_drops_its_subscriptions() {
        let state = ServerState::new(DEFAULT_EVENT_LOG_LIMIT);
        let (room, _) = state
            .create_room(Some("room".into()), "host".into(), RoomInit::default())
            .await
            .unwrap();
        let client = Uuid::new_v4();
        state.add_client(client);
        state.subscribe(client, room.id).await.unwrap();
        state.subscribe(client, room.id).await.unwrap();
        assert_eq!(state.get_subscribers(room.id).await, vec![client]);

        state.remove_client(client).await;
        assert!(state.get_subscribers(room.id).await.is_empty());
    }
}
