use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Messages sent between client and server
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
        room: Option<RoomRecord>,
    },
    RoomCreated {
        request_id: u64,
        room: RoomRecord,
        created: bool,
    },
    RoomUpdated {
        request_id: u64,
        room: RoomRecord,
    },
    RoomNotFound {
        request_id: u64,
    },
    RoomChanged {
        room: RoomRecord,
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceKind {
    FullControl,
    EmbedApi,
    NoControl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoReference {
    pub url: String,
    pub source_kind: SourceKind,
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

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_playing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
}

/// Canonical playback state of one room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomRecord {
    pub id: Uuid,
    pub code: String,
    pub host_id: String,
    pub video: Option<VideoReference>,
    pub is_playing: bool,
    pub position: f64,
    pub last_updated: u64,
    pub updated_by: Option<String>,
    pub last_event_seq: u64,
}

/// Event retained in a room's durable log
#[derive(Debug, Clone)]
pub struct LoggedEvent {
    pub seq: u64,
    pub event: Value,
}

/// Client connection metadata
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub subscriptions: Vec<Uuid>,
}
