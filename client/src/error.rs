use thiserror::Error;

use crate::source::UnsupportedSource;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A guest tried to join a code nobody has created
    #[error("Room {0} not found")]
    RoomNotFound(String),

    #[error("Only the host can change playback for the room")]
    NotHost,

    #[error("Not connected to a room")]
    NotJoined,

    /// The event channel or store transport is unavailable
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server refused the request
    #[error("Rejected by server: {0}")]
    Rejected(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Could not read timestamp {0:?}; use M:SS")]
    InvalidTimestamp(String),

    #[error(transparent)]
    Unsupported(#[from] UnsupportedSource),
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Transport(format!("{err:#}"))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
