//! Watch-party room synchronization: canonical room state, event channels,
//! the per-client sync engine and source-specific playback adapters.

pub mod adapter;
pub mod channel;
pub mod chat;
pub mod constants;
pub mod engine;
pub mod error;
pub mod hub;
pub mod invite;
pub mod protocol;
pub mod room;
pub mod session;
pub mod source;
pub mod store;
pub mod sync;
pub mod utils;

pub use channel::{ConnectionStatus, Delivery, EventChannel, Subscription};
pub use engine::{PlaybackCommand, PlayerEvent, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use hub::LocalHub;
pub use room::{Collaborators, JoinIntent, JoinRequest, RoomSession, SyncSettings};
pub use store::RoomStore;
pub use sync::SyncClient;
