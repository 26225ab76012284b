//! WebSocket client for `watchparty-server`. Implements both `RoomStore` and
//! `EventChannel` over one connection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{sleep, timeout},
};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use uuid::Uuid;

use crate::channel::{
    ConnectionStatus, Delivery, EventChannel, EventHandler, HandlerRegistry, Subscription,
};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{Message, Room, RoomInit, RoomPatch, SyncEvent};
use crate::store::RoomStore;
use crate::utils::current_unix_millis;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(12);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<SyncClientState>,
}

struct SyncClientState {
    tx: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    delivery: Delivery,
    request_timeout: Duration,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    handlers: HandlerRegistry,
    status: watch::Sender<ConnectionStatus>,
    stats: Mutex<SyncStats>,
}

#[derive(Default, Clone)]
struct SyncStats {
    bytes_out: u64,
    bytes_in: u64,
    messages_out: u64,
    messages_in: u64,
    last_message_at: Option<Instant>,
    last_ping_sent: Option<Instant>,
    last_ping_nonce: Option<u64>,
    last_rtt_ms: Option<f32>,
    reconnect_attempts: u32,
    connected_since: Option<Instant>,
    endpoint_label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncStatsSnapshot {
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub messages_out: u64,
    pub messages_in: u64,
    pub last_rtt_ms: Option<f32>,
    pub last_message_age: Option<f32>,
    pub connected_duration: Option<f32>,
    pub reconnect_attempts: u32,
    pub endpoint_label: Option<String>,
}

impl SyncClient {
    pub fn new(delivery: Delivery) -> Self {
        Self::with_timeout(delivery, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(delivery: Delivery, request_timeout: Duration) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(SyncClientState {
                tx: Mutex::new(None),
                delivery,
                request_timeout,
                next_request_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                handlers: HandlerRegistry::default(),
                status,
                stats: Mutex::new(SyncStats::default()),
            }),
        }
    }

    /// Connect to the sync server. Returns a receiver that resolves when the
    /// socket closes. Handlers registered earlier survive a reconnect, but the
    /// server-side subscriptions must be renewed by the caller.
    pub async fn connect(&self, server_url: &str) -> Result<oneshot::Receiver<()>> {
        self.inner.status.send_replace(ConnectionStatus::Connecting);
        let (ws_stream, _) = match connect_async(server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                self.inner.status.send_replace(ConnectionStatus::Error);
                return Err(e).context("Failed to connect to server");
            }
        };

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.inner.tx.lock() = Some(tx);
        self.inner.status.send_replace(ConnectionStatus::Connected);

        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let disconnect_signal = Arc::new(Mutex::new(Some(disconnect_tx)));

        // Sender task
        let send_inner = Arc::clone(&self.inner);
        let send_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            send_inner.clear_transport();
            if let Some(tx) = send_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        let recv_inner = Arc::clone(&self.inner);
        let recv_signal = Arc::clone(&disconnect_signal);
        tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        recv_inner.record_incoming(text.len() as u64);
                        match serde_json::from_str::<Message>(&text) {
                            Ok(parsed) => recv_inner.route(parsed),
                            Err(e) => tracing::warn!("Unparseable server message: {}", e),
                        }
                    }
                    Ok(WsMessage::Pong(payload)) => {
                        recv_inner.handle_ws_pong(&payload);
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(_) => break,
                    _ => {}
                }
            }
            recv_inner.clear_transport();
            if let Some(tx) = recv_signal.lock().take() {
                let _ = tx.send(());
            }
        });

        // Keep-alive pings
        let ping_inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                sleep(KEEPALIVE_INTERVAL).await;
                if ping_inner.send_keepalive().is_err() {
                    break;
                }
            }
        });

        Ok(disconnect_rx)
    }

    pub fn mark_connected(&self, label: &str) {
        self.inner.mark_connected(label);
    }

    pub fn mark_disconnected(&self) {
        self.inner.mark_disconnected();
    }

    pub fn stats_snapshot(&self) -> SyncStatsSnapshot {
        self.inner.snapshot()
    }

    async fn request(
        &self,
        what: &'static str,
        build: impl FnOnce(u64) -> Message,
    ) -> SyncResult<Message> {
        let request_id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.lock().insert(request_id, reply_tx);

        if let Err(e) = self.inner.send_message(&build(request_id)) {
            self.inner.pending.lock().remove(&request_id);
            return Err(e.into());
        }

        match timeout(self.inner.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SyncError::Transport(format!(
                "Connection closed while waiting for {what}"
            ))),
            Err(_) => {
                self.inner.pending.lock().remove(&request_id);
                Err(SyncError::Timeout(what))
            }
        }
    }
}

fn unexpected(reply: Message) -> SyncError {
    match reply {
        Message::Error { message, .. } => SyncError::Rejected(message),
        other => SyncError::Transport(format!("Unexpected reply: {other:?}")),
    }
}

#[async_trait]
impl RoomStore for SyncClient {
    async fn get_room(&self, code: &str) -> SyncResult<Option<Room>> {
        let reply = self
            .request("room lookup", |request_id| Message::GetRoom {
                request_id,
                code: code.to_string(),
            })
            .await?;
        match reply {
            Message::RoomFetched { room, .. } => Ok(room),
            Message::RoomNotFound { .. } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    async fn create_room(&self, code: &str, host_id: &str, initial: RoomInit) -> SyncResult<Room> {
        let reply = self
            .request("room creation", |request_id| Message::CreateRoom {
                request_id,
                code: Some(code.to_string()),
                host_id: host_id.to_string(),
                initial,
            })
            .await?;
        match reply {
            Message::RoomCreated { room, created, .. } => {
                if !created {
                    tracing::debug!("Room {} already existed", room.code);
                }
                Ok(room)
            }
            other => Err(unexpected(other)),
        }
    }

    async fn update_room(&self, room_id: Uuid, sender_id: &str, patch: RoomPatch) -> SyncResult<()> {
        let reply = self
            .request("room update", |request_id| Message::UpdateRoom {
                request_id,
                room_id,
                sender_id: sender_id.to_string(),
                patch,
            })
            .await?;
        match reply {
            Message::RoomUpdated { .. } => Ok(()),
            Message::RoomNotFound { .. } => Err(SyncError::RoomNotFound(room_id.to_string())),
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl EventChannel for SyncClient {
    fn delivery(&self) -> Delivery {
        self.inner.delivery
    }

    fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    async fn publish(&self, room_id: Uuid, event: SyncEvent) -> SyncResult<()> {
        let event = serde_json::to_value(&event)
            .map_err(|e| SyncError::Transport(format!("Failed to encode event: {e}")))?;
        let msg = match self.inner.delivery {
            Delivery::Durable => Message::AppendEvent { room_id, event },
            Delivery::Ephemeral => Message::Broadcast { room_id, event },
        };
        self.inner.send_message(&msg)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        room_id: Uuid,
        since_seq: Option<u64>,
        handler: EventHandler,
    ) -> SyncResult<Subscription> {
        let handler_id = self.inner.handlers.add(room_id, handler);
        tracing::debug!(
            "Subscribing to room {} ({} local handlers)",
            room_id,
            self.inner.handlers.count(room_id)
        );
        let since_seq = match self.inner.delivery {
            Delivery::Durable => since_seq,
            Delivery::Ephemeral => None,
        };
        if let Err(e) = self
            .inner
            .send_message(&Message::Subscribe { room_id, since_seq })
        {
            self.inner.handlers.remove(room_id, handler_id);
            return Err(e.into());
        }

        let inner = Arc::clone(&self.inner);
        Ok(Subscription::new(room_id, move || {
            if inner.handlers.remove(room_id, handler_id) == 0 {
                // best effort; a closed socket already dropped the subscription
                let _ = inner.send_message(&Message::Unsubscribe { room_id });
            }
        }))
    }
}

impl SyncClientState {
    fn route(&self, msg: Message) {
        if let Some(request_id) = msg.reply_to() {
            match self.pending.lock().remove(&request_id) {
                Some(reply) => {
                    let _ = reply.send(msg);
                }
                None => tracing::debug!("Dropping late reply {}", request_id),
            }
            return;
        }

        match msg {
            Message::EventAppended { room_id, event, .. }
            | Message::EventBroadcast { room_id, event } => {
                match serde_json::from_value::<SyncEvent>(event) {
                    Ok(event) => self.handlers.dispatch(room_id, &event),
                    Err(e) => tracing::warn!("Dropping malformed event for {}: {}", room_id, e),
                }
            }
            Message::RoomChanged { room } => {
                if self.delivery == Delivery::Durable {
                    self.handlers.dispatch(room.id, &room.change_event());
                }
            }
            Message::Subscribed { room_id, head_seq } => {
                tracing::debug!("Subscribed to {} at seq {}", room_id, head_seq);
            }
            Message::Unsubscribed { room_id } => {
                tracing::debug!("Unsubscribed from {}", room_id);
            }
            Message::Error { message, .. } => {
                tracing::warn!("Server error: {}", message);
            }
            other => tracing::debug!("Ignoring unexpected message {:?}", other),
        }
    }

    fn send_message(&self, msg: &Message) -> Result<()> {
        let json = serde_json::to_string(msg).context("Failed to serialize message")?;
        self.record_outgoing(json.len() as u64);
        let tx = self
            .tx
            .lock()
            .clone()
            .context("Not connected to sync server")?;
        tx.send(WsMessage::Text(json.into()))
            .context("Failed to queue message to socket")?;
        Ok(())
    }

    fn record_outgoing(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_out += bytes;
        stats.messages_out += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn record_incoming(&self, bytes: u64) {
        let mut stats = self.stats.lock();
        stats.bytes_in += bytes;
        stats.messages_in += 1;
        stats.last_message_at = Some(Instant::now());
    }

    fn handle_ws_pong(&self, payload: &[u8]) {
        self.record_incoming(payload.len() as u64);
        if payload.len() < 8 {
            return;
        }
        let mut nonce_bytes = [0u8; 8];
        nonce_bytes.copy_from_slice(&payload[..8]);
        let nonce = u64::from_le_bytes(nonce_bytes);

        let mut stats = self.stats.lock();
        if stats.last_ping_nonce == Some(nonce) {
            if let Some(sent) = stats.last_ping_sent {
                stats.last_rtt_ms = Some(sent.elapsed().as_secs_f32() * 1000.0);
            }
            stats.last_ping_nonce = None;
            stats.last_ping_sent = None;
        }
    }

    fn send_keepalive(&self) -> Result<(), ()> {
        let nonce = Uuid::new_v4().as_u128() as u64;
        {
            let mut stats = self.stats.lock();
            stats.last_ping_nonce = Some(nonce);
            stats.last_ping_sent = Some(Instant::now());
        }

        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&nonce.to_le_bytes());
        payload.extend_from_slice(&current_unix_millis().to_le_bytes());
        self.record_outgoing(payload.len() as u64);
        match self.tx.lock().clone() {
            Some(tx) => tx.send(WsMessage::Ping(payload.into())).map_err(|_| ()),
            None => Err(()),
        }
    }

    /// Socket gone: fail in-flight requests and report the status change
    fn clear_transport(&self) {
        *self.tx.lock() = None;
        self.pending.lock().clear();
        {
            let mut stats = self.stats.lock();
            stats.last_ping_nonce = None;
            stats.last_ping_sent = None;
        }
        self.status.send_if_modified(|status| {
            if *status == ConnectionStatus::Connected {
                *status = ConnectionStatus::Disconnected;
                true
            } else {
                false
            }
        });
    }

    fn mark_connected(&self, label: &str) {
        let mut stats = self.stats.lock();
        stats.connected_since = Some(Instant::now());
        stats.endpoint_label = Some(label.to_string());
    }

    fn mark_disconnected(&self) {
        let mut stats = self.stats.lock();
        stats.connected_since = None;
        stats.reconnect_attempts += 1;
    }

    fn snapshot(&self) -> SyncStatsSnapshot {
        let stats = self.stats.lock();
        SyncStatsSnapshot {
            bytes_out: stats.bytes_out,
            bytes_in: stats.bytes_in,
            messages_out: stats.messages_out,
            messages_in: stats.messages_in,
            last_rtt_ms: stats.last_rtt_ms,
            last_message_age: stats
                .last_message_at
                .map(|inst| inst.elapsed().as_secs_f32()),
            connected_duration: stats
                .connected_since
                .map(|inst| inst.elapsed().as_secs_f32()),
            reconnect_attempts: stats.reconnect_attempts,
            endpoint_label: stats.endpoint_label.clone(),
        }
    }
}
