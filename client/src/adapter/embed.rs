use super::{AdapterState, Capabilities, ManualSyncNotice, MediaEvent, PlaybackAdapter};
use crate::engine::{PlaybackCommand, PlayerEvent};
use crate::protocol::SourceKind;

pub const EMBED_ENDED: i32 = 0;
pub const EMBED_PLAYING: i32 = 1;
pub const EMBED_PAUSED: i32 = 2;

/// Embeds report positions coarsely, so seeks need a wider margin
const SEEK_TOLERANCE_SECS: f64 = 1.5;

/// YouTube-style iframe player API
pub trait EmbedPlayer: Send {
    fn cue_video(&mut self, video_id: &str) -> Result<(), String>;
    fn play_video(&mut self) -> Result<(), String>;
    fn pause_video(&mut self) -> Result<(), String>;
    fn seek_to(&mut self, position: f64) -> Result<(), String>;
    fn current_time(&self) -> Result<f64, String>;
    fn player_state(&self) -> Result<i32, String>;
}

pub struct EmbedAdapter {
    player: Box<dyn EmbedPlayer>,
    state: AdapterState,
    pending: Option<PlaybackCommand>,
}

impl EmbedAdapter {
    pub fn new(mut player: Box<dyn EmbedPlayer>, video_id: &str) -> Self {
        if let Err(e) = player.cue_video(video_id) {
            tracing::warn!("Embed failed to cue {}: {}", video_id, e);
        }
        Self {
            player,
            state: AdapterState::Uninitialized,
            pending: None,
        }
    }

    fn is_ready(&self) -> bool {
        self.state != AdapterState::Uninitialized
    }

    fn position(&self) -> f64 {
        self.player.current_time().unwrap_or(0.0)
    }

    fn drive(&mut self, command: &PlaybackCommand) {
        if let Some(target) = command.seek_to {
            match self.player.current_time() {
                Ok(current) if (current - target).abs() <= SEEK_TOLERANCE_SECS => {}
                Ok(_) => {
                    if let Err(e) = self.player.seek_to(target) {
                        tracing::warn!("Embed seek failed, player not ready: {}", e);
                    }
                }
                Err(e) => tracing::warn!("Embed seek failed, player not ready: {}", e),
            }
        }

        let playing = match self.player.player_state() {
            Ok(code) => code == EMBED_PLAYING,
            Err(e) => {
                tracing::warn!("Embed state unavailable: {}", e);
                return;
            }
        };
        let result = if command.is_playing && !playing {
            self.player.play_video()
        } else if !command.is_playing && playing {
            self.player.pause_video()
        } else {
            Ok(())
        };
        if let Err(e) = result {
            tracing::warn!("Embed play/pause failed: {}", e);
        }
    }
}

impl PlaybackAdapter for EmbedAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::EmbedApi
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            seek: true,
            play_pause: true,
            progress: true,
        }
    }

    fn state(&self) -> AdapterState {
        self.state
    }

    fn apply(&mut self, command: &PlaybackCommand) -> Option<ManualSyncNotice> {
        if self.state == AdapterState::Ended {
            return None;
        }
        if self.is_ready() {
            self.drive(command);
        } else {
            self.pending = Some(match self.pending.take() {
                Some(earlier) => earlier.merge(command.clone()),
                None => command.clone(),
            });
        }
        None
    }

    fn handle_media_event(&mut self, event: MediaEvent) -> Option<PlayerEvent> {
        if self.state == AdapterState::Ended {
            return None;
        }
        match event {
            MediaEvent::Ready => {
                if self.is_ready() {
                    return None;
                }
                self.state = AdapterState::Ready;
                if let Some(pending) = self.pending.take() {
                    self.drive(&pending);
                }
                Some(PlayerEvent::Ready)
            }
            MediaEvent::EmbedStateChange(code) => match code {
                EMBED_PLAYING => {
                    self.state = AdapterState::Playing;
                    Some(PlayerEvent::Played(self.position()))
                }
                EMBED_PAUSED => {
                    self.state = AdapterState::Paused;
                    Some(PlayerEvent::Paused(self.position()))
                }
                EMBED_ENDED => {
                    self.state = AdapterState::Ended;
                    Some(PlayerEvent::Ended(self.position()))
                }
                // buffering, cued, unstarted
                _ => None,
            },
            MediaEvent::Error(message) => {
                tracing::warn!("Embed player error: {}", message);
                None
            }
            _ => None,
        }
    }

    fn poll_progress(&mut self) -> Option<PlayerEvent> {
        if self.state != AdapterState::Playing {
            return None;
        }
        match self.player.current_time() {
            Ok(position) => Some(PlayerEvent::Progress(position)),
            Err(e) => {
                tracing::warn!("Embed progress poll failed: {}", e);
                None
            }
        }
    }
}
