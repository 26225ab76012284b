use super::{AdapterState, Capabilities, ManualSyncNotice, MediaEvent, PlaybackAdapter};
use crate::engine::{PlaybackCommand, PlayerEvent};
use crate::protocol::SourceKind;
use crate::utils::format_time;

/// Preview iframes (Google Drive) expose no control API at all. Every command
/// becomes an instruction for the viewer instead.
pub struct NoControlAdapter {
    state: AdapterState,
    last_playing: Option<bool>,
}

impl NoControlAdapter {
    pub fn new(url: &str) -> Self {
        tracing::debug!("{} has no control API; syncing by notice", url);
        Self {
            state: AdapterState::Ready,
            last_playing: None,
        }
    }
}

impl PlaybackAdapter for NoControlAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::NoControl
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            seek: false,
            play_pause: false,
            progress: false,
        }
    }

    fn state(&self) -> AdapterState {
        self.state
    }

    fn apply(&mut self, command: &PlaybackCommand) -> Option<ManualSyncNotice> {
        let transition = self.last_playing != Some(command.is_playing);
        self.last_playing = Some(command.is_playing);

        let mut parts = Vec::new();
        if transition {
            parts.push(if command.is_playing {
                "Host pressed play. Click play on the video to watch along.".to_string()
            } else {
                "Host paused the video.".to_string()
            });
        }
        if let Some(target) = command.seek_to {
            parts.push(format!(
                "Host is at {}. Please scrub to this time.",
                format_time(target)
            ));
        }
        if parts.is_empty() {
            return None;
        }
        Some(ManualSyncNotice {
            message: parts.join(" "),
            target: command.seek_to,
        })
    }

    fn handle_media_event(&mut self, event: MediaEvent) -> Option<PlayerEvent> {
        match event {
            MediaEvent::Ready => Some(PlayerEvent::Ready),
            _ => None,
        }
    }
}
