//! Room session driver. One task per session consumes every input (remote
//! events, player events, host actions, timer ticks) in order, so the engine
//! and adapter are only ever touched from that task.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{interval_at, Instant},
};
use uuid::Uuid;

use crate::adapter::{
    self, AdapterState, LoadedSource, ManualSyncNotice, MediaEvent, PlayerBackends,
};
use crate::channel::{ConnectionStatus, Delivery, EventChannel, Subscription};
use crate::chat::{self, ChatLog};
use crate::constants::{
    DRIFT_TOLERANCE_SECS, HEARTBEAT_INTERVAL, NOTICE_TTL, PROGRESS_POLL_INTERVAL,
};
use crate::engine::{
    HostUpdate, Inbound, LocalState, Outbound, PlaybackCommand, PlayerEvent, SyncEngine,
};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ChatMessage, EventBody, Participant, RoomInit, SyncEvent, VideoReference};
use crate::session::{resolve_participant, SessionRepository};
use crate::source::{reject_restricted, UnsupportedSource};
use crate::store::{open_room, RoomStore};
use crate::utils::{format_time, parse_timestamp};

const LOG_TAG: &str = "[Room]";

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub heartbeat_interval: Duration,
    pub drift_tolerance: f64,
    pub progress_poll_interval: Duration,
    pub notice_ttl: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            drift_tolerance: DRIFT_TOLERANCE_SECS,
            progress_poll_interval: PROGRESS_POLL_INTERVAL,
            notice_ttl: NOTICE_TTL,
        }
    }
}

impl SyncSettings {
    /// Defaults, with `WATCHPARTY_HEARTBEAT_SECS` overriding the heartbeat
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(secs) = std::env::var("WATCHPARTY_HEARTBEAT_SECS")
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
        {
            settings.heartbeat_interval = Duration::from_secs(secs);
        }
        settings
    }
}

#[derive(Debug, Clone)]
pub enum JoinIntent {
    /// Create the room if the code is free, starting on `video`
    Host { video: Option<VideoReference> },
    Guest,
}

#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub code: String,
    pub display_name: Option<String>,
    pub intent: JoinIntent,
}

/// External collaborators of a session
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn RoomStore>,
    pub channel: Arc<dyn EventChannel>,
    pub sessions: Arc<dyn SessionRepository>,
    pub backends: Arc<dyn PlayerBackends>,
}

enum HostAction {
    Play,
    Pause,
    Seek(f64),
    ChangeSource(VideoReference),
}

enum Input {
    Remote(SyncEvent),
    Media(MediaEvent),
    Host(HostAction, oneshot::Sender<SyncResult<()>>),
    SetHost(bool),
    Heartbeat,
    PollProgress,
    Flush(oneshot::Sender<()>),
}

/// What the UI reads
#[derive(Default)]
struct SessionView {
    chat: ChatLog,
    notice: Option<(ManualSyncNotice, Instant)>,
    unsupported: Option<UnsupportedSource>,
    adapter_state: Option<AdapterState>,
    local: Option<LocalState>,
    is_host: bool,
}

pub struct RoomSession {
    room_id: Uuid,
    code: String,
    participant: Participant,
    settings: SyncSettings,
    channel: Arc<dyn EventChannel>,
    inputs: mpsc::UnboundedSender<Input>,
    view: Arc<Mutex<SessionView>>,
    subscription: Mutex<Option<Subscription>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    sender: Mutex<Option<JoinHandle<()>>>,
    progress: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl RoomSession {
    /// Resolve identity, read the room (creating it as host), initialize the
    /// player from the stored state, then subscribe for live events.
    pub async fn join(
        request: JoinRequest,
        deps: Collaborators,
        settings: SyncSettings,
    ) -> SyncResult<Self> {
        let wants_host = matches!(request.intent, JoinIntent::Host { .. });
        let participant = resolve_participant(
            deps.sessions.as_ref(),
            &request.code,
            request.display_name.clone(),
            wants_host,
        )?;

        let initial = match &request.intent {
            JoinIntent::Host { video } => RoomInit {
                video: video.clone(),
                is_playing: false,
                position: 0.0,
            },
            JoinIntent::Guest => RoomInit::default(),
        };
        let room = open_room(deps.store.as_ref(), &request.code, &participant, initial).await?;
        let is_host = room.host_id == participant.id;
        tracing::info!(
            "{} {} joined {} as {}",
            LOG_TAG,
            participant.display_name,
            room.code,
            if is_host { "host" } else { "guest" }
        );

        let view = Arc::new(Mutex::new(SessionView::default()));
        let mut engine = SyncEngine::new(participant.id.clone(), is_host, settings.drift_tolerance);
        let bootstrap = engine.bootstrap(&room);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let sender_task = spawn_sender(
            outgoing_rx,
            room.id,
            participant.id.clone(),
            Arc::clone(&deps.store),
            Arc::clone(&deps.channel),
        );
        let mut driver = Driver {
            engine,
            loaded: None,
            outgoing,
            backends: Arc::clone(&deps.backends),
            view: Arc::clone(&view),
            notice_ttl: settings.notice_ttl,
        };
        if let Some(command) = bootstrap {
            driver.apply(command);
        }
        view.lock()
            .chat
            .system(format!("{} joined the party.", participant.display_name));
        driver.refresh_view();

        let (inputs, rx) = mpsc::unbounded_channel();
        let driver_task = tokio::spawn(driver.run(rx));

        let session = Self {
            room_id: room.id,
            code: room.code.clone(),
            participant,
            settings,
            channel: deps.channel,
            inputs,
            view,
            subscription: Mutex::new(None),
            driver: Mutex::new(Some(driver_task)),
            sender: Mutex::new(Some(sender_task)),
            progress: Mutex::new(None),
            heartbeat: Mutex::new(None),
        };

        let since_seq = match session.channel.delivery() {
            Delivery::Durable => Some(room.last_event_seq),
            Delivery::Ephemeral => None,
        };
        session.subscribe(since_seq).await?;
        session.start_progress();
        if is_host {
            session.start_heartbeat();
        }
        Ok(session)
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn is_host(&self) -> bool {
        self.view.lock().is_host
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.channel.status()
    }

    pub fn local_state(&self) -> Option<LocalState> {
        self.view.lock().local.clone()
    }

    pub fn adapter_state(&self) -> Option<AdapterState> {
        self.view.lock().adapter_state
    }

    /// Set when the current video is on a restricted platform
    pub fn unsupported(&self) -> Option<UnsupportedSource> {
        self.view.lock().unsupported.clone()
    }

    /// Manual-sync instruction, until it expires
    pub fn notice(&self) -> Option<ManualSyncNotice> {
        let mut view = self.view.lock();
        match &view.notice {
            Some((notice, expires)) if Instant::now() < *expires => Some(notice.clone()),
            Some(_) => {
                view.notice = None;
                None
            }
            None => None,
        }
    }

    pub fn chat(&self) -> Vec<ChatMessage> {
        self.view.lock().chat.messages().to_vec()
    }

    pub async fn play(&self) -> SyncResult<()> {
        self.host_action(HostAction::Play).await
    }

    pub async fn pause(&self) -> SyncResult<()> {
        self.host_action(HostAction::Pause).await
    }

    pub async fn seek(&self, position: f64) -> SyncResult<()> {
        self.host_action(HostAction::Seek(position)).await
    }

    /// Switch everyone to a new video. Restricted platforms are refused here,
    /// before anything is broadcast.
    pub async fn change_source(&self, video: VideoReference) -> SyncResult<()> {
        reject_restricted(&video.url)?;
        self.host_action(HostAction::ChangeSource(video)).await
    }

    /// For players we cannot read: the host types where they are ("5:30")
    /// and guests are told to scrub there.
    pub async fn broadcast_current_time(&self, input: &str) -> SyncResult<()> {
        let position =
            parse_timestamp(input).ok_or_else(|| SyncError::InvalidTimestamp(input.to_string()))?;
        tracing::info!("{} Broadcasting host time {}", LOG_TAG, format_time(position));
        self.seek(position).await
    }

    pub async fn send_chat(&self, text: &str) -> SyncResult<()> {
        let Some(message) = chat::compose(&self.participant, text) else {
            return Ok(());
        };
        self.view.lock().chat.push(message.clone());
        self.channel
            .publish(
                self.room_id,
                SyncEvent::new(self.participant.id.clone(), EventBody::Chat(message)),
            )
            .await
    }

    /// Feed a raw notification from the player backend
    pub fn media_event(&self, event: MediaEvent) -> SyncResult<()> {
        self.inputs
            .send(Input::Media(event))
            .map_err(|_| SyncError::NotJoined)
    }

    pub fn set_host(&self, is_host: bool) -> SyncResult<()> {
        self.inputs
            .send(Input::SetHost(is_host))
            .map_err(|_| SyncError::NotJoined)?;
        if is_host {
            self.start_heartbeat();
        } else if let Some(task) = self.heartbeat.lock().take() {
            task.abort();
        }
        Ok(())
    }

    /// Replace the live subscription, e.g. after the transport reconnected.
    /// The old handler is removed first so events are never handled twice.
    pub async fn resubscribe(&self) -> SyncResult<()> {
        if let Some(previous) = self.subscription.lock().take() {
            previous.unsubscribe();
        }
        self.subscribe(None).await
    }

    /// Wait until every input queued so far has been processed
    pub async fn settled(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inputs.send(Input::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stop receiving events and cancel every timer. Synchronous.
    pub fn leave(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.unsubscribe();
        }
        for slot in [&self.heartbeat, &self.progress, &self.driver, &self.sender] {
            if let Some(task) = slot.lock().take() {
                task.abort();
            }
        }
    }

    async fn subscribe(&self, since_seq: Option<u64>) -> SyncResult<()> {
        let inputs = self.inputs.clone();
        let subscription = self
            .channel
            .subscribe(
                self.room_id,
                since_seq,
                Arc::new(move |event| {
                    let _ = inputs.send(Input::Remote(event));
                }),
            )
            .await?;
        // a concurrent resubscribe may have raced us; keep only one handler
        if let Some(stale) = self.subscription.lock().replace(subscription) {
            stale.unsubscribe();
        }
        Ok(())
    }

    async fn host_action(&self, action: HostAction) -> SyncResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inputs
            .send(Input::Host(action, reply_tx))
            .map_err(|_| SyncError::NotJoined)?;
        reply_rx.await.map_err(|_| SyncError::NotJoined)?
    }

    fn start_heartbeat(&self) {
        let mut slot = self.heartbeat.lock();
        if slot.is_some() {
            return;
        }
        *slot = Some(spawn_ticker(
            self.inputs.clone(),
            self.settings.heartbeat_interval,
            || Input::Heartbeat,
        ));
    }

    fn start_progress(&self) {
        *self.progress.lock() = Some(spawn_ticker(
            self.inputs.clone(),
            self.settings.progress_poll_interval,
            || Input::PollProgress,
        ));
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        self.leave();
    }
}

fn spawn_ticker(
    inputs: mpsc::UnboundedSender<Input>,
    period: Duration,
    make: fn() -> Input,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if inputs.send(make()).is_err() {
                break;
            }
        }
    })
}

enum Outgoing {
    Update(Outbound),
    Heartbeat(Outbound),
}

/// Drains outbound work one item at a time so the room sees the host's
/// actions in the order they were taken.
fn spawn_sender(
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    room_id: Uuid,
    sender_id: String,
    store: Arc<dyn RoomStore>,
    channel: Arc<dyn EventChannel>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = outgoing.recv().await {
            match item {
                Outgoing::Update(Outbound { event, patch }) => {
                    if let Err(e) = channel.publish(room_id, event).await {
                        tracing::warn!("{} Publish failed: {}", LOG_TAG, e);
                    }
                    if let Err(e) = store.update_room(room_id, &sender_id, patch).await {
                        tracing::warn!("{} Room update failed: {}", LOG_TAG, e);
                    }
                }
                // Durable channels derive the snapshot notification from the
                // room write; ephemeral ones need it published explicitly.
                Outgoing::Heartbeat(Outbound { event, patch }) => {
                    if channel.delivery() == Delivery::Ephemeral {
                        if let Err(e) = channel.publish(room_id, event).await {
                            tracing::warn!("{} Heartbeat publish failed: {}", LOG_TAG, e);
                        }
                    }
                    if let Err(e) = store.update_room(room_id, &sender_id, patch).await {
                        tracing::warn!("{} Heartbeat write failed: {}", LOG_TAG, e);
                    }
                }
            }
        }
    })
}

struct Driver {
    engine: SyncEngine,
    loaded: Option<LoadedSource>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    backends: Arc<dyn PlayerBackends>,
    view: Arc<Mutex<SessionView>>,
    notice_ttl: Duration,
}

impl Driver {
    async fn run(mut self, mut inputs: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = inputs.recv().await {
            self.handle(input);
        }
    }

    fn handle(&mut self, input: Input) {
        match input {
            Input::Remote(event) => self.handle_remote(event),
            Input::Media(event) => {
                let player_event = self
                    .loaded
                    .as_mut()
                    .and_then(LoadedSource::adapter_mut)
                    .and_then(|adapter| adapter.handle_media_event(event));
                if let Some(player_event) = player_event {
                    self.handle_player(player_event);
                }
            }
            Input::PollProgress => {
                let progress = self
                    .loaded
                    .as_mut()
                    .and_then(LoadedSource::adapter_mut)
                    .and_then(|adapter| adapter.poll_progress());
                if let Some(progress) = progress {
                    self.handle_player(progress);
                }
            }
            Input::Host(action, reply) => {
                let result = self.host_action(action).map(|update| {
                    self.apply(update.command);
                    self.send(update.outbound);
                });
                let _ = reply.send(result);
            }
            Input::SetHost(is_host) => {
                let role = if is_host { "granted" } else { "revoked" };
                tracing::info!("{} Host role {}", LOG_TAG, role);
                self.engine.set_host(is_host);
            }
            Input::Heartbeat => {
                if let Some(beat) = self.engine.heartbeat() {
                    self.send_heartbeat(beat);
                }
            }
            Input::Flush(done) => {
                let _ = done.send(());
            }
        }
        self.refresh_view();
    }

    fn handle_remote(&mut self, event: SyncEvent) {
        let source_changed =
            matches!(event.body, EventBody::SourceChange { .. }) && !self.engine.is_own(&event);
        match self.engine.handle_remote(&event) {
            Inbound::Ignored => {}
            Inbound::Chat(message) => self.view.lock().chat.push(message),
            Inbound::Command(command) => {
                if source_changed {
                    self.view.lock().chat.system("The host changed the video.");
                }
                self.apply(command);
            }
        }
    }

    fn handle_player(&mut self, event: PlayerEvent) {
        if let Some(outbound) = self.engine.handle_player(event) {
            self.send(outbound);
        }
    }

    fn host_action(&mut self, action: HostAction) -> SyncResult<HostUpdate> {
        match action {
            HostAction::Play => self.engine.host_play(),
            HostAction::Pause => self.engine.host_pause(),
            HostAction::Seek(position) => self.engine.host_seek(position),
            HostAction::ChangeSource(video) => self.engine.host_change_source(video),
        }
    }

    /// Local commands are applied before anything goes on the wire
    fn apply(&mut self, command: PlaybackCommand) {
        if command.reload || self.loaded.is_none() {
            self.loaded = command
                .source
                .as_ref()
                .map(|video| adapter::load(video, self.backends.as_ref()));
        }
        let notice = self
            .loaded
            .as_mut()
            .and_then(LoadedSource::adapter_mut)
            .and_then(|adapter| adapter.apply(&command));
        if let Some(notice) = notice {
            tracing::info!("{} {}", LOG_TAG, notice.message);
            self.view.lock().notice = Some((notice, Instant::now() + self.notice_ttl));
        }
    }

    /// Queue a publish and room write; the driver never waits on either
    fn send(&self, outbound: Outbound) {
        let _ = self.outgoing.send(Outgoing::Update(outbound));
    }

    fn send_heartbeat(&self, beat: Outbound) {
        let _ = self.outgoing.send(Outgoing::Heartbeat(beat));
    }

    fn refresh_view(&self) {
        let mut view = self.view.lock();
        view.is_host = self.engine.is_host();
        view.local = Some(self.engine.local_state());
        view.unsupported = self
            .loaded
            .as_ref()
            .and_then(|loaded| loaded.unsupported().cloned());
        view.adapter_state = match &self.loaded {
            Some(LoadedSource::Active(adapter)) => Some(adapter.state()),
            _ => None,
        };
    }
}
