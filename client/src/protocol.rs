use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Messages sent between client and server (must match server protocol)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    // Client -> Server
    GetRoom {
        request_id: u64,
        code: String,
    },
    CreateRoom {
        request_id: u64,
        code: Option<String>,
        host_id: String,
        initial: RoomInit,
    },
    UpdateRoom {
        request_id: u64,
        room_id: Uuid,
        sender_id: String,
        patch: RoomPatch,
    },
    AppendEvent {
        room_id: Uuid,
        event: Value,
    },
    Broadcast {
        room_id: Uuid,
        event: Value,
    },
    Subscribe {
        room_id: Uuid,
        since_seq: Option<u64>,
    },
    Unsubscribe {
        room_id: Uuid,
    },

    // Server -> Client
    RoomFetched {
        request_id: u64,
        room: Option<Room>,
    },
    RoomCreated {
        request_id: u64,
        room: Room,
        created: bool,
    },
    RoomUpdated {
        request_id: u64,
        room: Room,
    },
    RoomNotFound {
        request_id: u64,
    },
    RoomChanged {
        room: Room,
    },
    EventAppended {
        room_id: Uuid,
        seq: u64,
        event: Value,
    },
    EventBroadcast {
        room_id: Uuid,
        event: Value,
    },
    Subscribed {
        room_id: Uuid,
        head_seq: u64,
    },
    Unsubscribed {
        room_id: Uuid,
    },
    Error {
        request_id: Option<u64>,
        message: String,
    },
}

impl Message {
    /// Request id of a server reply, if it answers one
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            Message::RoomFetched { request_id, .. }
            | Message::RoomCreated { request_id, .. }
            | Message::RoomUpdated { request_id, .. }
            | Message::RoomNotFound { request_id } => Some(*request_id),
            Message::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }
}

/// Capability category of a video backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceKind {
    /// Native media element or a player library with a complete imperative API
    FullControl,
    /// Embedded player with a ready callback and state-change events
    EmbedApi,
    /// Third-party embed without any programmatic control
    NoControl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoReference {
    pub url: String,
    pub source_kind: SourceKind,
}

impl VideoReference {
    pub fn new(url: impl Into<String>, source_kind: SourceKind) -> Self {
        Self {
            url: url.into(),
            source_kind,
        }
    }
}

/// Initial state supplied by the host when a room is first created
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomInit {
    pub video: Option<VideoReference>,
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default)]
    pub position: f64,
}

/// Partial room state written by the host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_playing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
}

impl RoomPatch {
    pub fn full(snapshot: &RoomSnapshot) -> Self {
        Self {
            video: snapshot.video.clone(),
            is_playing: Some(snapshot.is_playing),
            position: Some(snapshot.position),
        }
    }
}

/// Canonical playback state of one room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: Uuid,
    pub code: String,
    pub host_id: String,
    pub video: Option<VideoReference>,
    pub is_playing: bool,
    pub position: f64,
    pub last_updated: u64,
    pub updated_by: Option<String>,
    #[serde(default)]
    pub last_event_seq: u64,
}

impl Room {
    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            video: self.video.clone(),
            is_playing: self.is_playing,
            position: self.position,
            last_updated: self.last_updated,
        }
    }

    /// The derived "room row changed" notification for this record
    pub fn change_event(&self) -> SyncEvent {
        SyncEvent {
            sender_id: self
                .updated_by
                .clone()
                .unwrap_or_else(|| SYSTEM_SENDER.to_string()),
            body: EventBody::StateSnapshot(self.snapshot()),
        }
    }

    pub fn apply(&mut self, patch: &RoomPatch, sender_id: &str, now: u64) {
        if let Some(video) = &patch.video {
            self.video = Some(video.clone());
        }
        if let Some(is_playing) = patch.is_playing {
            self.is_playing = is_playing;
        }
        if let Some(position) = patch.position {
            self.position = position.max(0.0);
        }
        self.last_updated = now;
        self.updated_by = Some(sender_id.to_string());
    }
}

/// Sender id used for notifications that have no participant behind them
pub const SYSTEM_SENDER: &str = "system";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub video: Option<VideoReference>,
    pub is_playing: bool,
    pub position: f64,
    pub last_updated: u64,
}

/// A participant of a room. Only used to stamp outgoing events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub is_host: bool,
    pub color_tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub timestamp: u64,
    #[serde(default)]
    pub is_system: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Play,
    Pause,
    Seek,
    SourceChange,
    Chat,
    StateSnapshot,
}

/// A state transition or chat message travelling over the event channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub sender_id: String,
    pub body: EventBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventBody {
    Play {
        #[serde(default)]
        position: Option<f64>,
    },
    Pause {
        #[serde(default)]
        position: Option<f64>,
    },
    Seek {
        position: f64,
    },
    SourceChange {
        video: VideoReference,
    },
    Chat(ChatMessage),
    StateSnapshot(RoomSnapshot),
}

impl SyncEvent {
    pub fn new(sender_id: impl Into<String>, body: EventBody) -> Self {
        Self {
            sender_id: sender_id.into(),
            body,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self.body {
            EventBody::Play { .. } => EventKind::Play,
            EventBody::Pause { .. } => EventKind::Pause,
            EventBody::Seek { .. } => EventKind::Seek,
            EventBody::SourceChange { .. } => EventKind::SourceChange,
            EventBody::Chat(_) => EventKind::Chat,
            EventBody::StateSnapshot(_) => EventKind::StateSnapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_use_kind_and_payload_tags() {
        let event = SyncEvent::new("host-1", EventBody::Seek { position: 42.5 });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({ "sender_id": "host-1", "body": { "kind": "SEEK", "payload": { "position": 42.5 } } })
        );
    }

    #[test]
    fn play_without_position_parses() {
        let raw = json!({ "sender_id": "h", "body": { "kind": "PLAY", "payload": {} } });
        let event: SyncEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.body, EventBody::Play { position: None });
        assert_eq!(event.kind(), EventKind::Play);
    }

    #[test]
    fn room_change_event_is_stamped_with_writer() {
        let mut room = Room {
            id: Uuid::new_v4(),
            code: "123-456".into(),
            host_id: "host".into(),
            video: None,
            is_playing: false,
            position: 0.0,
            last_updated: 0,
            updated_by: None,
            last_event_seq: 0,
        };
        assert_eq!(room.change_event().sender_id, SYSTEM_SENDER);

        room.apply(
            &RoomPatch {
                is_playing: Some(true),
                position: Some(-3.0),
                ..RoomPatch::default()
            },
            "host",
            99,
        );
        let event = room.change_event();
        assert_eq!(event.sender_id, "host");
        match event.body {
            EventBody::StateSnapshot(snapshot) => {
                assert!(snapshot.is_playing);
                assert_eq!(snapshot.position, 0.0);
                assert_eq!(snapshot.last_updated, 99);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn replies_expose_request_ids() {
        let reply = Message::RoomNotFound { request_id: 5 };
        assert_eq!(reply.reply_to(), Some(5));
        let push = Message::Unsubscribed {
            room_id: Uuid::new_v4(),
        };
        assert_eq!(push.reply_to(), None);
    }
}
