//! Per-client reconciliation of remote playback state.
//!
//! The engine is synchronous and owns no I/O. It turns inbound events into
//! normalized `PlaybackCommand`s for the adapter and, at the host, turns user
//! actions and organic player events into `Outbound` events plus room
//! patches for the driver to publish.

use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    ChatMessage, EventBody, Room, RoomPatch, RoomSnapshot, SyncEvent, VideoReference,
};
use crate::utils::current_unix_millis;

/// Seeked reports this close to the last commanded target are our own seek
const SEEK_CONFORMANCE_SECS: f64 = 1.0;

/// Target state for the local player
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackCommand {
    pub source: Option<VideoReference>,
    pub is_playing: bool,
    pub seek_to: Option<f64>,
    /// Tear down the current adapter and load `source` from scratch
    pub reload: bool,
}

impl PlaybackCommand {
    /// Fold a newer command into one still waiting for the player. Play
    /// state and source follow the newer command; an earlier seek survives
    /// unless the newer one seeks too.
    pub fn merge(self, newer: PlaybackCommand) -> PlaybackCommand {
        if newer.reload {
            return newer;
        }
        PlaybackCommand {
            source: newer.source.or(self.source),
            is_playing: newer.is_playing,
            seek_to: newer.seek_to.or(self.seek_to),
            reload: self.reload,
        }
    }
}

/// Normalized events coming up from an adapter
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlayerEvent {
    Ready,
    Played(f64),
    Paused(f64),
    Seeked(f64),
    Progress(f64),
    Ended(f64),
}

/// Event to publish plus the matching room-store write
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub event: SyncEvent,
    pub patch: RoomPatch,
}

/// Result of a host action: apply `command` locally, send `outbound`
#[derive(Debug, Clone, PartialEq)]
pub struct HostUpdate {
    pub command: PlaybackCommand,
    pub outbound: Outbound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ignored,
    Command(PlaybackCommand),
    Chat(ChatMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalState {
    pub source: Option<VideoReference>,
    pub is_playing: bool,
    pub position: f64,
}

pub struct SyncEngine {
    local_id: String,
    is_host: bool,
    tolerance: f64,
    source: Option<VideoReference>,
    is_playing: bool,
    position: f64,
    pending_seek: Option<f64>,
}

impl SyncEngine {
    pub fn new(local_id: impl Into<String>, is_host: bool, tolerance: f64) -> Self {
        Self {
            local_id: local_id.into(),
            is_host,
            tolerance,
            source: None,
            is_playing: false,
            position: 0.0,
            pending_seek: None,
        }
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn set_host(&mut self, is_host: bool) {
        self.is_host = is_host;
    }

    pub fn local_state(&self) -> LocalState {
        LocalState {
            source: self.source.clone(),
            is_playing: self.is_playing,
            position: self.position,
        }
    }

    /// The single self-suppression point: transports echo our own events back
    pub fn is_own(&self, event: &SyncEvent) -> bool {
        event.sender_id == self.local_id
    }

    /// Initialize from the stored room before any live event is consumed
    pub fn bootstrap(&mut self, room: &Room) -> Option<PlaybackCommand> {
        self.source = room.video.clone();
        self.is_playing = room.is_playing;
        self.position = room.position.max(0.0);
        self.pending_seek = Some(self.position);
        self.source.as_ref()?;
        Some(PlaybackCommand {
            source: self.source.clone(),
            is_playing: self.is_playing,
            seek_to: Some(self.position),
            reload: true,
        })
    }

    pub fn handle_remote(&mut self, event: &SyncEvent) -> Inbound {
        if self.is_own(event) {
            tracing::trace!("Dropping own {:?} echo", event.kind());
            return Inbound::Ignored;
        }

        match &event.body {
            EventBody::Chat(message) => Inbound::Chat(message.clone()),
            EventBody::Play { position } => {
                self.is_playing = true;
                let seek_to = position.filter(|target| self.drifted(*target));
                self.command(seek_to, false)
            }
            EventBody::Pause { position } => {
                self.is_playing = false;
                self.command(*position, false)
            }
            EventBody::Seek { position } => self.command(Some(*position), false),
            EventBody::SourceChange { video } => {
                self.source = Some(video.clone());
                self.is_playing = false;
                self.command(Some(0.0), true)
            }
            EventBody::StateSnapshot(snapshot) => self.reconcile(snapshot),
        }
    }

    fn reconcile(&mut self, snapshot: &RoomSnapshot) -> Inbound {
        let mut reload = false;
        if snapshot.video.is_some() && snapshot.video != self.source {
            self.source = snapshot.video.clone();
            self.position = 0.0;
            reload = true;
        }
        let play_changed = snapshot.is_playing != self.is_playing;
        self.is_playing = snapshot.is_playing;

        let seek_to = self
            .drifted(snapshot.position)
            .then_some(snapshot.position);
        if !reload && !play_changed && seek_to.is_none() {
            return Inbound::Ignored;
        }
        if let Some(target) = seek_to {
            tracing::debug!(
                "Drift {:.2}s over tolerance; seeking to {:.2}",
                (self.position - target).abs(),
                target
            );
        }
        self.command(seek_to, reload)
    }

    fn drifted(&self, target: f64) -> bool {
        (self.position - target).abs() > self.tolerance
    }

    /// Build a command for the current target, assuming the seek lands
    fn command(&mut self, seek_to: Option<f64>, reload: bool) -> Inbound {
        let seek_to = seek_to.map(|target| target.max(0.0));
        if let Some(target) = seek_to {
            self.position = target;
            self.pending_seek = Some(target);
        }
        Inbound::Command(PlaybackCommand {
            source: self.source.clone(),
            is_playing: self.is_playing,
            seek_to,
            reload,
        })
    }

    /// Organic events from the local player. Events matching the current
    /// target are passive conformance; anything else was the local user.
    pub fn handle_player(&mut self, event: PlayerEvent) -> Option<Outbound> {
        match event {
            PlayerEvent::Ready => None,
            PlayerEvent::Progress(position) => {
                self.position = position;
                self.settle_pending_seek(position);
                None
            }
            PlayerEvent::Played(position) => {
                self.position = position;
                self.settle_pending_seek(position);
                if self.is_playing {
                    return None;
                }
                self.is_playing = true;
                self.user_initiated(EventBody::Play {
                    position: Some(position),
                })
            }
            PlayerEvent::Paused(position) => {
                self.position = position;
                if !self.is_playing {
                    return None;
                }
                self.is_playing = false;
                self.user_initiated(EventBody::Pause {
                    position: Some(position),
                })
            }
            PlayerEvent::Seeked(position) => {
                self.position = position;
                if let Some(target) = self.pending_seek {
                    if (target - position).abs() <= SEEK_CONFORMANCE_SECS {
                        self.pending_seek = None;
                        return None;
                    }
                }
                self.user_initiated(EventBody::Seek { position })
            }
            PlayerEvent::Ended(position) => {
                self.position = position;
                self.is_playing = false;
                self.user_initiated(EventBody::Pause {
                    position: Some(position),
                })
            }
        }
    }

    /// Adapters skip seeks within their tolerance and never report them, so
    /// a player already near the target means the seek is done.
    fn settle_pending_seek(&mut self, position: f64) {
        let window = self.tolerance.max(SEEK_CONFORMANCE_SECS);
        if let Some(target) = self.pending_seek {
            if (target - position).abs() <= window {
                self.pending_seek = None;
            }
        }
    }

    fn user_initiated(&self, body: EventBody) -> Option<Outbound> {
        if !self.is_host {
            return None;
        }
        Some(self.outbound(body))
    }

    fn outbound(&self, body: EventBody) -> Outbound {
        let patch = match &body {
            EventBody::Play { position } => RoomPatch {
                is_playing: Some(true),
                position: *position,
                ..RoomPatch::default()
            },
            EventBody::Pause { position } => RoomPatch {
                is_playing: Some(false),
                position: *position,
                ..RoomPatch::default()
            },
            // canonical position follows a seek immediately, paused or not
            EventBody::Seek { position } => RoomPatch {
                position: Some(*position),
                ..RoomPatch::default()
            },
            EventBody::SourceChange { video } => RoomPatch {
                video: Some(video.clone()),
                is_playing: Some(false),
                position: Some(0.0),
            },
            EventBody::StateSnapshot(snapshot) => RoomPatch::full(snapshot),
            EventBody::Chat(_) => RoomPatch::default(),
        };
        Outbound {
            event: SyncEvent::new(self.local_id.clone(), body),
            patch,
        }
    }

    fn require_host(&self) -> SyncResult<()> {
        if self.is_host {
            Ok(())
        } else {
            Err(SyncError::NotHost)
        }
    }

    pub fn host_play(&mut self) -> SyncResult<HostUpdate> {
        self.require_host()?;
        self.is_playing = true;
        Ok(self.host_update(
            None,
            false,
            EventBody::Play {
                position: Some(self.position),
            },
        ))
    }

    pub fn host_pause(&mut self) -> SyncResult<HostUpdate> {
        self.require_host()?;
        self.is_playing = false;
        Ok(self.host_update(
            None,
            false,
            EventBody::Pause {
                position: Some(self.position),
            },
        ))
    }

    pub fn host_seek(&mut self, position: f64) -> SyncResult<HostUpdate> {
        self.require_host()?;
        let position = position.max(0.0);
        self.position = position;
        self.pending_seek = Some(position);
        Ok(self.host_update(Some(position), false, EventBody::Seek { position }))
    }

    pub fn host_change_source(&mut self, video: VideoReference) -> SyncResult<HostUpdate> {
        self.require_host()?;
        self.source = Some(video.clone());
        self.is_playing = false;
        self.position = 0.0;
        self.pending_seek = Some(0.0);
        Ok(self.host_update(Some(0.0), true, EventBody::SourceChange { video }))
    }

    fn host_update(&self, seek_to: Option<f64>, reload: bool, body: EventBody) -> HostUpdate {
        HostUpdate {
            command: PlaybackCommand {
                source: self.source.clone(),
                is_playing: self.is_playing,
                seek_to,
                reload,
            },
            outbound: self.outbound(body),
        }
    }

    /// Full snapshot of the host's view; `None` at guests
    pub fn heartbeat(&self) -> Option<Outbound> {
        if !self.is_host {
            return None;
        }
        Some(self.outbound(EventBody::StateSnapshot(RoomSnapshot {
            video: self.source.clone(),
            is_playing: self.is_playing,
            position: self.position,
            last_updated: current_unix_millis(),
        })))
    }
}
