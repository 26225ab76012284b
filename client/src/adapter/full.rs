use super::{AdapterState, Capabilities, ManualSyncNotice, MediaEvent, PlaybackAdapter};
use crate::engine::{PlaybackCommand, PlayerEvent};
use crate::protocol::SourceKind;

/// Seeks closer than this to the current time are skipped
const SEEK_TOLERANCE_SECS: f64 = 0.5;

/// A native media element or a player library with a complete control API
pub trait MediaElement: Send {
    fn load(&mut self, url: &str) -> Result<(), String>;
    fn play(&mut self) -> Result<(), String>;
    fn pause(&mut self) -> Result<(), String>;
    fn seek(&mut self, position: f64) -> Result<(), String>;
    fn current_time(&self) -> Result<f64, String>;
}

pub struct FullControlAdapter {
    element: Box<dyn MediaElement>,
    state: AdapterState,
    pending: Option<PlaybackCommand>,
}

impl FullControlAdapter {
    pub fn new(mut element: Box<dyn MediaElement>, url: &str) -> Self {
        if let Err(e) = element.load(url) {
            tracing::warn!("Media element failed to load {}: {}", url, e);
        }
        Self {
            element,
            state: AdapterState::Uninitialized,
            pending: None,
        }
    }

    fn queue(&mut self, command: &PlaybackCommand) {
        self.pending = Some(match self.pending.take() {
            Some(earlier) => earlier.merge(command.clone()),
            None => command.clone(),
        });
    }

    fn position(&self) -> f64 {
        self.element.current_time().unwrap_or(0.0)
    }

    fn drive(&mut self, command: &PlaybackCommand) {
        if let Some(target) = command.seek_to {
            match self.element.current_time() {
                Ok(current) if (current - target).abs() <= SEEK_TOLERANCE_SECS => {}
                _ => {
                    if let Err(e) = self.element.seek(target) {
                        tracing::warn!("Seek to {:.2} failed: {}", target, e);
                    }
                }
            }
        }

        if command.is_playing && self.state != AdapterState::Playing {
            match self.element.play() {
                Ok(()) => self.state = AdapterState::Playing,
                Err(e) => tracing::warn!("Play failed: {}", e),
            }
        } else if !command.is_playing && self.state != AdapterState::Paused {
            match self.element.pause() {
                Ok(()) => self.state = AdapterState::Paused,
                Err(e) => tracing::warn!("Pause failed: {}", e),
            }
        }
    }
}

impl PlaybackAdapter for FullControlAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::FullControl
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
        match self.state {
            AdapterState::Ended => {}
            AdapterState::Uninitialized => self.queue(command),
            _ => self.drive(command),
        }
        None
    }

    fn handle_media_event(&mut self, event: MediaEvent) -> Option<PlayerEvent> {
        if self.state == AdapterState::Ended {
            return None;
        }
        match event {
            MediaEvent::Ready => {
                if self.state != AdapterState::Uninitialized {
                    return None;
                }
                self.state = AdapterState::Ready;
                if let Some(pending) = self.pending.take() {
                    self.drive(&pending);
                }
                Some(PlayerEvent::Ready)
            }
            MediaEvent::Playing => {
                self.state = AdapterState::Playing;
                Some(PlayerEvent::Played(self.position()))
            }
            MediaEvent::Paused => {
                self.state = AdapterState::Paused;
                Some(PlayerEvent::Paused(self.position()))
            }
            MediaEvent::Seeked(position) => Some(PlayerEvent::Seeked(position)),
            MediaEvent::TimeUpdate(position) => Some(PlayerEvent::Progress(position)),
            MediaEvent::Ended => {
                self.state = AdapterState::Ended;
                Some(PlayerEvent::Ended(self.position()))
            }
            MediaEvent::Error(message) => {
                tracing::warn!("Media element error: {}", message);
                None
            }
            MediaEvent::EmbedStateChange(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{Calls, FakeMedia};
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn adapter() -> (FullControlAdapter, Calls, Arc<Mutex<f64>>) {
        let calls = Calls::default();
        let time = Arc::new(Mutex::new(0.0));
        let media = FakeMedia {
            calls: Arc::clone(&calls),
            time: Arc::clone(&time),
        };
        let adapter = FullControlAdapter::new(Box::new(media), "https://cdn.example.com/a.mp4");
        calls.lock().clear();
        (adapter, calls, time)
    }

    fn command(is_playing: bool, seek_to: Option<f64>) -> PlaybackCommand {
        PlaybackCommand {
            source: None,
            is_playing,
            seek_to,
            reload: false,
        }
    }

    #[test]
    fn commands_wait_for_ready() {
        let (mut adapter, calls, _) = adapter();
        adapter.apply(&command(true, Some(42.0)));
        assert!(calls.lock().is_empty());

        assert_eq!(
            adapter.handle_media_event(MediaEvent::Ready),
            Some(PlayerEvent::Ready)
        );
        assert_eq!(calls.lock().as_slice(), ["seek 42", "play"]);
        assert_eq!(adapter.state(), AdapterState::Playing);
    }

    #[test]
    fn queued_seek_survives_a_later_play_without_target() {
        let (mut adapter, calls, _) = adapter();
        adapter.apply(&command(false, Some(42.0)));
        adapter.apply(&command(true, None));

        adapter.handle_media_event(MediaEvent::Ready);
        assert_eq!(calls.lock().as_slice(), ["seek 42", "play"]);
    }

    #[test]
    fn small_seeks_are_suppressed() {
        let (mut adapter, calls, time) = adapter();
        adapter.handle_media_event(MediaEvent::Ready);
        *time.lock() = 10.0;

        adapter.apply(&command(false, Some(10.4)));
        assert_eq!(calls.lock().as_slice(), ["pause"]);

        adapter.apply(&command(false, Some(12.0)));
        assert_eq!(calls.lock().as_slice(), ["pause", "seek 12"]);
    }

    #[test]
    fn ended_is_terminal() {
        let (mut adapter, calls, time) = adapter();
        adapter.handle_media_event(MediaEvent::Ready);
        *time.lock() = 300.0;
        assert_eq!(
            adapter.handle_media_event(MediaEvent::Ended),
            Some(PlayerEvent::Ended(300.0))
        );
        calls.lock().clear();

        adapter.apply(&command(true, Some(0.0)));
        assert!(calls.lock().is_empty());
        assert_eq!(adapter.handle_media_event(MediaEvent::Playing), None);
        assert_eq!(adapter.state(), AdapterState::Ended);
    }
}
