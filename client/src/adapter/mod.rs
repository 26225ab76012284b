//! Playback adapters: one concrete type per source kind, selected once per
//! video load.

mod embed;
mod full;
mod no_control;

pub use embed::{EmbedAdapter, EmbedPlayer, EMBED_ENDED, EMBED_PAUSED, EMBED_PLAYING};
pub use full::{FullControlAdapter, MediaElement};
pub use no_control::NoControlAdapter;

use crate::engine::{PlaybackCommand, PlayerEvent};
use crate::protocol::{SourceKind, VideoReference};
use crate::source::{extract_video_id, reject_restricted, UnsupportedSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub seek: bool,
    pub play_pause: bool,
    pub progress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Uninitialized,
    Ready,
    Playing,
    Paused,
    /// Terminal for this load; a new source builds a new adapter
    Ended,
}

/// Raw notifications from a player backend
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    Ready,
    Playing,
    Paused,
    Seeked(f64),
    TimeUpdate(f64),
    Ended,
    /// Embed API state code (1 playing, 2 paused, 0 ended)
    EmbedStateChange(i32),
    Error(String),
}

/// Instruction shown to a participant whose player we cannot drive
#[derive(Debug, Clone, PartialEq)]
pub struct ManualSyncNotice {
    pub message: String,
    pub target: Option<f64>,
}

pub trait PlaybackAdapter: Send {
    fn kind(&self) -> SourceKind;

    fn capabilities(&self) -> Capabilities;

    fn state(&self) -> AdapterState;

    /// Drive the player toward `command`. Backend failures are logged and
    /// skipped, never returned.
    fn apply(&mut self, command: &PlaybackCommand) -> Option<ManualSyncNotice>;

    fn handle_media_event(&mut self, event: MediaEvent) -> Option<PlayerEvent>;

    /// Synthesized progress for backends without a progress callback
    fn poll_progress(&mut self) -> Option<PlayerEvent> {
        None
    }
}

/// Creates player backends for new loads
pub trait PlayerBackends: Send + Sync {
    fn media_element(&self) -> Box<dyn MediaElement>;
    fn embed_player(&self) -> Box<dyn EmbedPlayer>;
}

pub enum LoadedSource {
    Active(Box<dyn PlaybackAdapter>),
    Unsupported(UnsupportedSource),
}

impl LoadedSource {
    pub fn adapter_mut(&mut self) -> Option<&mut (dyn PlaybackAdapter + 'static)> {
        match self {
            LoadedSource::Active(adapter) => Some(adapter.as_mut()),
            LoadedSource::Unsupported(_) => None,
        }
    }

    pub fn unsupported(&self) -> Option<&UnsupportedSource> {
        match self {
            LoadedSource::Unsupported(rejected) => Some(rejected),
            LoadedSource::Active(_) => None,
        }
    }
}

impl std::fmt::Debug for LoadedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadedSource::Active(adapter) => f
                .debug_tuple("Active")
                .field(&adapter.kind())
                .field(&adapter.state())
                .finish(),
            LoadedSource::Unsupported(rejected) => {
                f.debug_tuple("Unsupported").field(rejected).finish()
            }
        }
    }
}

/// Build the adapter for a video. Restricted domains are rejected before the
/// source kind is looked at.
pub fn load(video: &VideoReference, backends: &dyn PlayerBackends) -> LoadedSource {
    if let Err(rejected) = reject_restricted(&video.url) {
        tracing::warn!("Refusing to load {}: {}", video.url, rejected);
        return LoadedSource::Unsupported(rejected);
    }

    let adapter: Box<dyn PlaybackAdapter> = match video.source_kind {
        SourceKind::FullControl => Box::new(FullControlAdapter::new(
            backends.media_element(),
            &video.url,
        )),
        SourceKind::EmbedApi => {
            let video_id = extract_video_id(&video.url).unwrap_or_else(|| video.url.clone());
            Box::new(EmbedAdapter::new(backends.embed_player(), &video_id))
        }
        SourceKind::NoControl => Box::new(NoControlAdapter::new(&video.url)),
    };
    tracing::debug!("Loaded {:?} adapter for {}", video.source_kind, video.url);
    LoadedSource::Active(adapter)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Backend call log shared by the fakes
    pub type Calls = Arc<Mutex<Vec<String>>>;

    pub struct FakeMedia {
        pub calls: Calls,
        pub time: Arc<Mutex<f64>>,
    }

    impl MediaElement for FakeMedia {
        fn load(&mut self, url: &str) -> Result<(), String> {
            self.calls.lock().push(format!("load {url}"));
            Ok(())
        }
        fn play(&mut self) -> Result<(), String> {
            self.calls.lock().push("play".into());
            Ok(())
        }
        fn pause(&mut self) -> Result<(), String> {
            self.calls.lock().push("pause".into());
            Ok(())
        }
        fn seek(&mut self, position: f64) -> Result<(), String> {
            self.calls.lock().push(format!("seek {position}"));
            *self.time.lock() = position;
            Ok(())
        }
        fn current_time(&self) -> Result<f64, String> {
            Ok(*self.time.lock())
        }
    }

    pub struct FakeEmbed {
        pub calls: Calls,
        pub time: Arc<Mutex<f64>>,
        pub state: Arc<Mutex<i32>>,
    }

    impl EmbedPlayer for FakeEmbed {
        fn cue_video(&mut self, video_id: &str) -> Result<(), String> {
            self.calls.lock().push(format!("cue {video_id}"));
            Ok(())
        }
        fn play_video(&mut self) -> Result<(), String> {
            self.calls.lock().push("play".into());
            *self.state.lock() = EMBED_PLAYING;
            Ok(())
        }
        fn pause_video(&mut self) -> Result<(), String> {
            self.calls.lock().push("pause".into());
            *self.state.lock() = EMBED_PAUSED;
            Ok(())
        }
        fn seek_to(&mut self, position: f64) -> Result<(), String> {
            self.calls.lock().push(format!("seek {position}"));
            *self.time.lock() = position;
            Ok(())
        }
        fn current_time(&self) -> Result<f64, String> {
            Ok(*self.time.lock())
        }
        fn player_state(&self) -> Result<i32, String> {
            Ok(*self.state.lock())
        }
    }

    #[derive(Default)]
    pub struct FakeBackends {
        pub calls: Calls,
        pub created: Arc<Mutex<usize>>,
    }

    impl PlayerBackends for FakeBackends {
        fn media_element(&self) -> Box<dyn MediaElement> {
            *self.created.lock() += 1;
            Box::new(FakeMedia {
                calls: Arc::clone(&self.calls),
                time: Arc::default(),
            })
        }
        fn embed_player(&self) -> Box<dyn EmbedPlayer> {
            *self.created.lock() += 1;
            Box::new(FakeEmbed {
                calls: Arc::clone(&self.calls),
                time: Arc::default(),
                state: Arc::new(Mutex::new(-1)),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeBackends;
    use super::*;

    #[test]
    fn restricted_urls_never_reach_a_backend() {
        let backends = FakeBackends::default();
        for kind in [
            SourceKind::FullControl,
            SourceKind::EmbedApi,
            SourceKind::NoControl,
        ] {
            let video = VideoReference::new("https://www.hotstar.com/in/movies/x/123", kind);
            let loaded = load(&video, &backends);
            assert_eq!(loaded.unsupported().map(|r| r.domain), Some("hotstar.com"));
        }
        assert_eq!(*backends.created.lock(), 0);
        assert!(backends.calls.lock().is_empty());
    }

    #[test]
    fn one_adapter_per_kind() {
        let backends = FakeBackends::default();
        let cases = [
            ("https://cdn.example.com/a.mp4", SourceKind::FullControl),
            ("https://youtu.be/dQw4w9WgXcQ", SourceKind::EmbedApi),
            (
                "https://drive.google.com/file/d/abc/view",
                SourceKind::NoControl,
            ),
        ];
        for (url, kind) in cases {
            let mut loaded = load(&VideoReference::new(url, kind), &backends);
            let adapter = loaded.adapter_mut().unwrap();
            assert_eq!(adapter.kind(), kind);
        }
        assert_eq!(
            backends.calls.lock().as_slice(),
            ["load https://cdn.example.com/a.mp4", "cue dQw4w9WgXcQ"]
        );
    }
}
