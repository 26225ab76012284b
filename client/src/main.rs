//! Headless watch-party participant. Joins a room over the sync server, drives
//! a simulated player and reads host commands from stdin.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
    time::Duration,
};
use url::Url;

use watchparty_client::{
    adapter::{EmbedPlayer, MediaElement, MediaEvent, PlayerBackends, EMBED_PAUSED, EMBED_PLAYING},
    constants::{LOCAL_WS_URL, RECONNECT_DELAY, VERSION},
    invite::{build_invite_url, parse_invite_url},
    session::FileSessionRepository,
    source,
    utils::{format_time, generate_room_code, parse_timestamp},
    Collaborators, Delivery, JoinIntent, JoinRequest, RoomSession, SyncClient, SyncSettings,
};

const LOG_TAG: &str = "[Client]";

#[derive(Debug, Default)]
struct Args {
    room: Option<String>,
    host: bool,
    name: Option<String>,
    video: Option<String>,
    invite: Option<String>,
    drive_direct: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watchparty_client=debug,info".into()),
        )
        .init();

    let args = parse_args();
    let server_url =
        std::env::var("WATCHPARTY_SERVER_URL").unwrap_or_else(|_| LOCAL_WS_URL.to_string());
    tracing::info!("{} watchparty-client {} using {}", LOG_TAG, VERSION, server_url);

    let code = match (&args.invite, &args.room) {
        (Some(invite), _) => {
            parse_invite_url(invite)
                .context("Invite link does not contain a room code")?
                .room_code
        }
        (None, Some(room)) => room.clone(),
        (None, None) if args.host => generate_room_code(),
        (None, None) => bail!("Pass --room CODE, --invite-url LINK or --host"),
    };

    let http = reqwest::Client::new();
    let video = match &args.video {
        Some(url) if args.host => Some(
            source::prepare(url, &http, args.drive_direct)
                .await
                .with_context(|| format!("Cannot play {url}"))?,
        ),
        Some(_) => {
            tracing::warn!("{} --video is ignored for guests", LOG_TAG);
            None
        }
        None => None,
    };

    warm_up_backend(&http, &server_url).await;
    let sync = SyncClient::new(Delivery::Durable);
    let mut disconnected = connect_until_ready(&sync, &server_url).await;

    let (media_tx, mut media_rx) = mpsc::unbounded_channel();
    let sessions = Arc::new(FileSessionRepository::new());
    tracing::debug!("{} Participants stored in {}", LOG_TAG, sessions.path().display());
    let deps = Collaborators {
        store: Arc::new(sync.clone()),
        channel: Arc::new(sync.clone()),
        sessions,
        backends: Arc::new(SimulatedBackends { events: media_tx }),
    };
    let intent = if args.host {
        JoinIntent::Host { video }
    } else {
        JoinIntent::Guest
    };
    let session = Arc::new(
        RoomSession::join(
            JoinRequest {
                code: code.clone(),
                display_name: args.name.clone(),
                intent,
            },
            deps,
            SyncSettings::from_env(),
        )
        .await
        .with_context(|| format!("Failed to join room {code}"))?,
    );
    tracing::info!("{} Invite others with {}", LOG_TAG, build_invite_url(&code));

    let media_session = Arc::clone(&session);
    tokio::spawn(async move {
        while let Some(event) = media_rx.recv().await {
            if media_session.media_event(event).is_err() {
                break;
            }
        }
    });

    let mut status = session.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            tracing::info!("{} Connection status: {:?}", LOG_TAG, current);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = &mut disconnected => {
                sync.mark_disconnected();
                tracing::warn!("{} Lost connection to sync server", LOG_TAG);
                disconnected = connect_until_ready(&sync, &server_url).await;
                if let Err(e) = session.resubscribe().await {
                    tracing::warn!("{} Resubscribe failed: {}", LOG_TAG, e);
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => run_command(&session, &http, args.drive_direct, line.trim()).await,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("{} stdin closed: {}", LOG_TAG, e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let stats = sync.stats_snapshot();
    tracing::info!(
        "{} Leaving {}: {} messages out, {} in, rtt {:?} ms",
        LOG_TAG,
        code,
        stats.messages_out,
        stats.messages_in,
        stats.last_rtt_ms
    );
    session.leave();
    Ok(())
}

fn parse_args() -> Args {
    let mut parsed = Args::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--room" => parsed.room = args.next(),
            "--host" => parsed.host = true,
            "--name" => parsed.name = args.next(),
            "--video" => parsed.video = args.next(),
            "--invite-url" => parsed.invite = args.next(),
            "--drive-direct" => parsed.drive_direct = true,
            other if other.starts_with("watchparty://") => parsed.invite = Some(other.to_string()),
            other => tracing::warn!("{} Ignoring unknown argument {}", LOG_TAG, other),
        }
    }
    parsed
}

/// stdin commands: play, pause, seek M:SS, time M:SS, source URL, say TEXT,
/// chat, status
async fn run_command(
    session: &RoomSession,
    http: &reqwest::Client,
    drive_direct: bool,
    line: &str,
) {
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let result = match verb {
        "" => return,
        "play" => session.play().await,
        "pause" => session.pause().await,
        "seek" => match parse_timestamp(rest) {
            Some(position) => session.seek(position).await,
            None => {
                tracing::warn!("{} Usage: seek M:SS", LOG_TAG);
                return;
            }
        },
        "time" => session.broadcast_current_time(rest).await,
        "source" => match source::prepare(rest, http, drive_direct).await {
            Ok(video) => session.change_source(video).await,
            Err(e) => Err(e),
        },
        "say" => session.send_chat(rest).await,
        "chat" => {
            for message in session.chat() {
                tracing::info!("{} <{}> {}", LOG_TAG, message.sender_name, message.text);
            }
            Ok(())
        }
        "status" => {
            let participant = session.participant();
            tracing::info!(
                "{} {} in room {} as {}; player {:?}",
                LOG_TAG,
                participant.display_name,
                session.code(),
                if session.is_host() { "host" } else { "guest" },
                session.adapter_state()
            );
            if let Some(state) = session.local_state() {
                tracing::info!(
                    "{} {} at {} ({})",
                    LOG_TAG,
                    if state.is_playing { "Playing" } else { "Paused" },
                    format_time(state.position),
                    state.source.map(|v| v.url).unwrap_or_else(|| "no video".into())
                );
            }
            if let Some(notice) = session.notice() {
                tracing::info!("{} {}", LOG_TAG, notice.message);
            }
            if let Some(rejected) = session.unsupported() {
                tracing::info!("{} {}", LOG_TAG, rejected);
            }
            Ok(())
        }
        other => {
            tracing::warn!("{} Unknown command {}", LOG_TAG, other);
            return;
        }
    };
    if let Err(e) = result {
        tracing::warn!("{} {} failed: {}", LOG_TAG, verb, e);
    }
}

/// Keep trying on a fixed delay until the socket is up
async fn connect_until_ready(
    sync: &SyncClient,
    server_url: &str,
) -> tokio::sync::oneshot::Receiver<()> {
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match sync.connect(server_url).await {
            Ok(disconnected) => {
                tracing::info!("{} Connected to sync server at {}", LOG_TAG, server_url);
                sync.mark_connected(server_url);
                return disconnected;
            }
            Err(e) => {
                tracing::warn!(
                    "{} Failed to connect to {} (attempt {}): {:#}",
                    LOG_TAG,
                    server_url,
                    attempt,
                    e
                );
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn warm_up_backend(http: &reqwest::Client, ws_url: &str) {
    let Some(health_url) = health_url_from_ws(ws_url) else {
        return;
    };
    match http
        .get(&health_url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(response) => tracing::info!(
            "{} Warmup request to {} returned {}",
            LOG_TAG,
            health_url,
            response.status()
        ),
        Err(e) => tracing::warn!("{} Warmup request to {} failed: {}", LOG_TAG, health_url, e),
    }
}

fn health_url_from_ws(ws_url: &str) -> Option<String> {
    let parsed = Url::parse(ws_url).ok()?;
    let scheme = match parsed.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return None,
    };

    let mut http = parsed;
    http.set_scheme(scheme).ok()?;
    http.set_path("/healthz");
    http.set_query(None);
    http.set_fragment(None);
    Some(http.to_string())
}

/// Stand-in players that log what they are told and report it back the way
/// a real element would.
struct SimulatedBackends {
    events: mpsc::UnboundedSender<MediaEvent>,
}

impl PlayerBackends for SimulatedBackends {
    fn media_element(&self) -> Box<dyn MediaElement> {
        Box::new(SimulatedMedia {
            events: self.events.clone(),
            position: 0.0,
        })
    }

    fn embed_player(&self) -> Box<dyn EmbedPlayer> {
        Box::new(SimulatedEmbed {
            events: self.events.clone(),
            position: 0.0,
            state: -1,
        })
    }
}

struct SimulatedMedia {
    events: mpsc::UnboundedSender<MediaEvent>,
    position: f64,
}

impl SimulatedMedia {
    fn emit(&self, event: MediaEvent) -> Result<(), String> {
        self.events.send(event).map_err(|e| e.to_string())
    }
}

impl MediaElement for SimulatedMedia {
    fn load(&mut self, url: &str) -> Result<(), String> {
        tracing::info!("{} [player] load {}", LOG_TAG, url);
        self.emit(MediaEvent::Ready)
    }

    fn play(&mut self) -> Result<(), String> {
        tracing::info!("{} [player] play at {}", LOG_TAG, format_time(self.position));
        self.emit(MediaEvent::Playing)
    }

    fn pause(&mut self) -> Result<(), String> {
        tracing::info!("{} [player] pause at {}", LOG_TAG, format_time(self.position));
        self.emit(MediaEvent::Paused)
    }

    fn seek(&mut self, position: f64) -> Result<(), String> {
        tracing::info!("{} [player] seek to {}", LOG_TAG, format_time(position));
        self.position = position;
        self.emit(MediaEvent::Seeked(position))
    }

    fn current_time(&self) -> Result<f64, String> {
        Ok(self.position)
    }
}

struct SimulatedEmbed {
    events: mpsc::UnboundedSender<MediaEvent>,
    position: f64,
    state: i32,
}

impl SimulatedEmbed {
    fn set_state(&mut self, state: i32) -> Result<(), String> {
        self.state = state;
        self.events
            .send(MediaEvent::EmbedStateChange(state))
            .map_err(|e| e.to_string())
    }
}

impl EmbedPlayer for SimulatedEmbed {
    fn cue_video(&mut self, video_id: &str) -> Result<(), String> {
        tracing::info!("{} [embed] cue {}", LOG_TAG, video_id);
        self.events
            .send(MediaEvent::Ready)
            .map_err(|e| e.to_string())
    }

    fn play_video(&mut self) -> Result<(), String> {
        tracing::info!("{} [embed] play at {}", LOG_TAG, format_time(self.position));
        self.set_state(EMBED_PLAYING)
    }

    fn pause_video(&mut self) -> Result<(), String> {
        tracing::info!("{} [embed] pause at {}", LOG_TAG, format_time(self.position));
        self.set_state(EMBED_PAUSED)
    }

    fn seek_to(&mut self, position: f64) -> Result<(), String> {
        tracing::info!("{} [embed] seek to {}", LOG_TAG, format_time(position));
        self.position = position;
        Ok(())
    }

    fn current_time(&self) -> Result<f64, String> {
        Ok(self.position)
    }

    fn player_state(&self) -> Result<i32, String> {
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_url_follows_socket_scheme() {
        assert_eq!(
            health_url_from_ws("ws://localhost:3005/ws").as_deref(),
            Some("http://localhost:3005/healthz")
        );
        assert_eq!(
            health_url_from_ws("wss://party.example.com/ws?x=1").as_deref(),
            Some("https://party.example.com/healthz")
        );
        assert_eq!(health_url_from_ws("http://example.com"), None);
    }
}
