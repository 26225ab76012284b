use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

mod protocol;
mod state;

use protocol::{Message, RoomRecord};
use state::{RoomLog, ServerState, StateError, DEFAULT_EVENT_LOG_LIMIT};

type ClientSender = mpsc::UnboundedSender<Message>;
type ClientSenders = Arc<RwLock<HashMap<Uuid, ClientSender>>>;

#[derive(Clone)]
struct AppState {
    server_state: ServerState,
    client_senders: ClientSenders,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watchparty_server=debug,info".into()),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(3005);
    let event_log_limit = env::var("WATCHPARTY_EVENT_LOG_LIMIT")
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(DEFAULT_EVENT_LOG_LIMIT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let app_state = AppState {
        server_state: ServerState::new(event_log_limit),
        client_senders: Arc::new(RwLock::new(HashMap::new())),
    };

    let app = Router::new()
        .route("/healthz", get(health_check))
        .route("/rooms/:code", get(room_lookup))
        .route("/ws", get(ws_endpoint))
        .with_state(app_state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(
        "WatchParty Server listening on {} (event log limit {})",
        addr,
        event_log_limit
    );
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_endpoint(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health_check() -> &'static str {
    "ok"
}

async fn room_lookup(
    Path(code): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<RoomRecord>, StatusCode> {
    state
        .server_state
        .get_room(&code)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let server_state = state.server_state.clone();
    let client_senders = state.client_senders.clone();
    let client_id = Uuid::new_v4();
    server_state.add_client(client_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    // Register client sender
    client_senders.write().await.insert(client_id, tx.clone());

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {}", e);
                    continue;
                }
            };

            if let Err(e) = ws_sender.send(AxumWsMessage::Text(json)).await {
                tracing::error!("Failed to send message: {}", e);
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(AxumWsMessage::Text(text)) => {
                if let Err(e) =
                    handle_message(&text, client_id, &tx, &server_state, &client_senders).await
                {
                    tracing::error!("Error handling message: {}", e);
                    let _ = tx.send(Message::Error {
                        request_id: None,
                        message: e.to_string(),
                    });
                }
            }
            Ok(AxumWsMessage::Close(_)) => {
                tracing::info!("Client {} closing connection", client_id);
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    client_senders.write().await.remove(&client_id);
    server_state.remove_client(client_id).await;
    send_task.abort();
}

async fn handle_message(
    text: &str,
    client_id: Uuid,
    reply: &ClientSender,
    state: &ServerState,
    client_senders: &ClientSenders,
) -> anyhow::Result<()> {
    let msg: Message = serde_json::from_str(text)?;

    match msg {
        Message::GetRoom { request_id, code } => {
            let room = state.get_room(&code).await;
            let _ = reply.send(Message::RoomFetched { request_id, room });
        }

        Message::CreateRoom {
            request_id,
            code,
            host_id,
            initial,
        } => {
            let response = match state.create_room(code, host_id, initial).await {
                Ok((room, created)) => Message::RoomCreated {
                    request_id,
                    room,
                    created,
                },
                Err(e) => request_error(request_id, e),
            };
            let _ = reply.send(response);
        }

        Message::UpdateRoom {
            request_id,
            room_id,
            sender_id,
            patch,
        } => match state.update_room(room_id, &sender_id, patch).await {
            Ok(room) => {
                let _ = reply.send(Message::RoomUpdated {
                    request_id,
                    room: room.clone(),
                });
                fan_out(state, client_senders, room_id, Message::RoomChanged { room }).await;
            }
            Err(e) => {
                tracing::warn!("Rejected update of room {} from {}: {}", room_id, sender_id, e);
                let _ = reply.send(request_error(request_id, e));
            }
        },

        Message::AppendEvent { room_id, event } => {
            // fan out before releasing the log so live delivery keeps seq order
            let mut log = state.lock_log(room_id).await?;
            let seq = log.append(event.clone());
            fan_out(
                state,
                client_senders,
                room_id,
                Message::EventAppended {
                    room_id,
                    seq,
                    event,
                },
            )
            .await;
        }

        Message::Broadcast { room_id, event } => {
            fan_out(
                state,
                client_senders,
                room_id,
                Message::EventBroadcast { room_id, event },
            )
            .await;
        }

        Message::Subscribe { room_id, since_seq } => {
            let log = state.lock_log(room_id).await?;
            state.subscribe(client_id, room_id).await?;
            let _ = reply.send(Message::Subscribed {
                room_id,
                head_seq: log.head_seq(),
            });
            if let Some(since) = since_seq {
                replay_events(&log, reply, room_id, since);
            }
        }

        Message::Unsubscribe { room_id } => {
            state.unsubscribe(client_id, room_id).await;
            let _ = reply.send(Message::Unsubscribed { room_id });
        }

        _ => {
            tracing::warn!("Unexpected message from client: {:?}", msg);
        }
    }

    Ok(())
}

fn request_error(request_id: u64, error: StateError) -> Message {
    match error {
        StateError::RoomNotFound => Message::RoomNotFound { request_id },
        other => Message::Error {
            request_id: Some(request_id),
            message: other.to_string(),
        },
    }
}

fn replay_events(log: &RoomLog, reply: &ClientSender, room_id: Uuid, since: u64) {
    let backlog = log.since(since);
    tracing::debug!(
        "Replaying {} logged events after seq {} in room {}",
        backlog.len(),
        since,
        room_id
    );
    for logged in backlog {
        let _ = reply.send(Message::EventAppended {
            room_id,
            seq: logged.seq,
            event: logged.event,
        });
    }
}

/// Deliver to every subscriber of the room, the sender included. Clients drop
/// their own events by sender id.
async fn fan_out(state: &ServerState, client_senders: &ClientSenders, room_id: Uuid, msg: Message) {
    let members = state.get_subscribers(room_id).await;
    let senders = client_senders.read().await;

    tracing::debug!(
        "Fanning out {} to {} subscribers of room {}",
        message_label(&msg),
        members.len(),
        room_id
    );

    for member_id in members {
        if let Some(tx) = senders.get(&member_id) {
            let _ = tx.send(msg.clone());
        }
    }
}

fn message_label(msg: &Message) -> String {
    match msg {
        Message::EventAppended { seq, event, .. } => {
            format!("event #{seq} ({})", event_kind(event))
        }
        Message::EventBroadcast { event, .. } => format!("broadcast ({})", event_kind(event)),
        Message::RoomChanged { .. } => "room change".to_string(),
        _ => "message".to_string(),
    }
}

fn event_kind(event: &Value) -> &str {
    event
        .pointer("/body/kind")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RoomInit, RoomPatch};
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    struct TestClient {
        id: Uuid,
        tx: ClientSender,
        rx: mpsc::UnboundedReceiver<Message>,
    }

    async fn connect(state: &ServerState, senders: &ClientSenders) -> TestClient {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        state.add_client(id);
        senders.write().await.insert(id, tx.clone());
        TestClient { id, tx, rx }
    }

    async fn send(client: &TestClient, state: &ServerState, senders: &ClientSenders, msg: Message) {
        let text = serde_json::to_string(&msg).unwrap();
        handle_message(&text, client.id, &client.tx, state, senders)
            .await
            .unwrap();
    }

    async fn recv(client: &mut TestClient) -> Message {
        timeout(Duration::from_millis(200), client.rx.recv())
            .await
            .expect("receive timed out")
            .expect("channel closed")
    }

    fn play_event(sender: &str) -> Value {
        json!({ "sender_id": sender, "body": { "kind": "PLAY", "payload": { "position": 1.0 } } })
    }

    async fn create_room(client: &mut TestClient, state: &ServerState, senders: &ClientSenders) -> RoomRecord {
        send(
            client,
            state,
            senders,
            Message::CreateRoom {
                request_id: 1,
                code: Some("movie-night".into()),
                host_id: "host".into(),
                initial: RoomInit::default(),
            },
        )
        .await;
        match recv(client).await {
            Message::RoomCreated { room, created, .. } => {
                assert!(created);
                room
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_room_is_reported_not_created() {
        let state = ServerState::new(DEFAULT_EVENT_LOG_LIMIT);
        let senders: ClientSenders = Arc::new(RwLock::new(HashMap::new()));
        let mut guest = connect(&state, &senders).await;

        send(
            &guest,
            &state,
            &senders,
            Message::GetRoom {
                request_id: 7,
                code: "nowhere".into(),
            },
        )
        .await;
        match recv(&mut guest).await {
            Message::RoomFetched { request_id, room } => {
                assert_eq!(request_id, 7);
                assert!(room.is_none());
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(state.get_room("nowhere").await.is_none());
    }

    #[tokio::test]
    async fn appended_events_reach_all_subscribers_including_sender() {
        let state = ServerState::new(DEFAULT_EVENT_LOG_LIMIT);
        let senders: ClientSenders = Arc::new(RwLock::new(HashMap::new()));
        let mut host = connect(&state, &senders).await;
        let mut guest = connect(&state, &senders).await;
        let room = create_room(&mut host, &state, &senders).await;

        for client in [&mut host, &mut guest] {
            send(
                client,
                &state,
                &senders,
                Message::Subscribe {
                    room_id: room.id,
                    since_seq: None,
                },
            )
            .await;
            assert!(matches!(recv(client).await, Message::Subscribed { head_seq: 0, .. }));
        }

        send(
            &host,
            &state,
            &senders,
            Message::AppendEvent {
                room_id: room.id,
                event: play_event("host"),
            },
        )
        .await;

        for client in [&mut host, &mut guest] {
            match recv(client).await {
                Message::EventAppended { seq, event, .. } => {
                    assert_eq!(seq, 1);
                    assert_eq!(event["sender_id"], "host");
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn room_updates_fan_out_as_room_changed() {
        let state = ServerState::new(DEFAULT_EVENT_LOG_LIMIT);
        let senders: ClientSenders = Arc::new(RwLock::new(HashMap::new()));
        let mut host = connect(&state, &senders).await;
        let mut guest = connect(&state, &senders).await;
        let room = create_room(&mut host, &state, &senders).await;

        send(
            &guest,
            &state,
            &senders,
            Message::Subscribe {
                room_id: room.id,
                since_seq: None,
            },
        )
        .await;
        recv(&mut guest).await;

        send(
            &host,
            &state,
            &senders,
            Message::UpdateRoom {
                request_id: 2,
                room_id: room.id,
                sender_id: "host".into(),
                patch: RoomPatch {
                    is_playing: Some(true),
                    position: Some(12.5),
                    ..RoomPatch::default()
                },
            },
        )
        .await;

        assert!(matches!(recv(&mut host).await, Message::RoomUpdated { request_id: 2, .. }));
        match recv(&mut guest).await {
            Message::RoomChanged { room } => {
                assert!(room.is_playing);
                assert_eq!(room.position, 12.5);
                assert_eq!(room.updated_by.as_deref(), Some("host"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_subscriber_replays_from_sequence() {
        let state = ServerState::new(DEFAULT_EVENT_LOG_LIMIT);
        let senders: ClientSenders = Arc::new(RwLock::new(HashMap::new()));
        let mut host = connect(&state, &senders).await;
        let mut guest = connect(&state, &senders).await;
        let room = create_room(&mut host, &state, &senders).await;

        for _ in 0..3 {
            send(
                &host,
                &state,
                &senders,
                Message::AppendEvent {
                    room_id: room.id,
                    event: play_event("host"),
                },
            )
            .await;
        }

        send(
            &guest,
            &state,
            &senders,
            Message::Subscribe {
                room_id: room.id,
                since_seq: Some(1),
            },
        )
        .await;
        assert!(matches!(recv(&mut guest).await, Message::Subscribed { head_seq: 3, .. }));
        for expected in [2, 3] {
            match recv(&mut guest).await {
                Message::EventAppended { seq, .. } => assert_eq!(seq, expected),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscribe_during_appends_delivers_each_seq_once_in_order() {
        let state = ServerState::new(DEFAULT_EVENT_LOG_LIMIT);
        let senders: ClientSenders = Arc::new(RwLock::new(HashMap::new()));
        let mut host = connect(&state, &senders).await;
        let mut guest = connect(&state, &senders).await;
        let room_id = create_room(&mut host, &state, &senders).await.id;

        let appends = {
            let state = state.clone();
            let senders = Arc::clone(&senders);
            let (host_id, host_tx) = (host.id, host.tx.clone());
            tokio::spawn(async move {
                let text = serde_json::to_string(&Message::AppendEvent {
                    room_id,
                    event: play_event("host"),
                })
                .unwrap();
                for _ in 0..100 {
                    handle_message(&text, host_id, &host_tx, &state, &senders)
                        .await
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        tokio::task::yield_now().await;
        send(
            &guest,
            &state,
            &senders,
            Message::Subscribe {
                room_id,
                since_seq: Some(0),
            },
        )
        .await;
        appends.await.unwrap();

        let mut seqs = Vec::new();
        while let Ok(msg) = guest.rx.try_recv() {
            if let Message::EventAppended { seq, .. } = msg {
                seqs.push(seq);
            }
        }
        assert_eq!(seqs, (1..=100).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn non_host_update_is_an_error_reply() {
        let state = ServerState::new(DEFAULT_EVENT_LOG_LIMIT);
        let senders: ClientSenders = Arc::new(RwLock::new(HashMap::new()));
        let mut host = connect(&state, &senders).await;
        let room = create_room(&mut host, &state, &senders).await;

        send(
            &host,
            &state,
            &senders,
            Message::UpdateRoom {
                request_id: 9,
                room_id: room.id,
                sender_id: "guest".into(),
                patch: RoomPatch::default(),
            },
        )
        .await;
        match recv(&mut host).await {
            Message::Error {
                request_id,
                message,
            } => {
                assert_eq!(request_id, Some(9));
                assert!(message.contains("host"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
