use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::protocol::{Participant, Room, RoomInit, RoomPatch};

/// Durable record of each room's canonical playback state
#[async_trait]
pub trait RoomStore: Send + Sync {
    async fn get_room(&self, code: &str) -> SyncResult<Option<Room>>;

    /// Create the room if the code is free, otherwise return the existing
    /// record unchanged (first writer wins)
    async fn create_room(&self, code: &str, host_id: &str, initial: RoomInit) -> SyncResult<Room>;

    async fn update_room(&self, room_id: Uuid, sender_id: &str, patch: RoomPatch) -> SyncResult<()>;
}

/// Fetch the room for a participant entering it. Hosts create it on first
/// entry; a guest asking for an unknown code gets `RoomNotFound`.
pub async fn open_room(
    store: &dyn RoomStore,
    code: &str,
    participant: &Participant,
    initial: RoomInit,
) -> SyncResult<Room> {
    if let Some(room) = store.get_room(code).await? {
        return Ok(room);
    }
    if !participant.is_host {
        tracing::warn!("Room {} does not exist; guests cannot create rooms", code);
        return Err(SyncError::RoomNotFound(code.to_string()));
    }
    let room = store.create_room(code, &participant.id, initial).await?;
    if room.host_id != participant.id {
        tracing::warn!(
            "Room {} was created concurrently by {}; joining as its guest",
            code,
            room.host_id
        );
    }
    Ok(room)
}
