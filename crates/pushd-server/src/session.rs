use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use pushd_core::protocol::{
    self, ClientMessage, ServerMessage, WakeupHostport, STATUS_CONFLICT, STATUS_OK,
};

use crate::delivery::Ack;
use crate::registry::{Rendezvous, SessionHandle};
use crate::AppState;

const OUTBOUND_QUEUE: usize = 256;
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

/// Per-connection driver. The protocol state machine is `New` until a
/// successful hello (`greeted` holds the attached UAID afterwards); only
/// hello is honored before that, everything else is logged and ignored.
async fn handle_socket(state: Arc<AppState>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    let write_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            match tokio::time::timeout(WRITE_TIMEOUT, sink.send(message)).await {
                Ok(Ok(())) if !closing => {}
                _ => return,
            }
        }
    });

    let session_id = state.next_session_id();
    info!(event = "session_connected", session_id);
    let mut greeted: Option<String> = None;

    while let Some(result) = stream.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "session_read_error", session_id, error = %err);
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(_) => {
                warn!(event = "unexpected_binary_frame", session_id);
                continue;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                info!(event = "session_closed_by_peer", session_id);
                break;
            }
        };

        let parsed = match protocol::parse_client_message(&text) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(event = "message_invalid", session_id, error = %err);
                continue;
            }
        };

        if let Some(uaid) = &greeted {
            state.registry().write().await.touch(uaid);
        }

        match parsed {
            ClientMessage::Hello {
                uaid,
                channel_ids,
                wakeup_hostport,
            } => {
                let uaid = handle_hello(
                    &state,
                    &tx,
                    session_id,
                    uaid,
                    channel_ids,
                    wakeup_hostport,
                    greeted.as_deref(),
                )
                .await;
                greeted = Some(uaid);
            }
            ClientMessage::Register { channel_id } => {
                let Some(uaid) = greeted.clone() else {
                    warn!(event = "message_before_hello", session_id, message_type = "register");
                    continue;
                };
                let Some(channel_id) = channel_id else {
                    warn!(event = "register_missing_channel", session_id);
                    continue;
                };
                handle_register(&state, &tx, &uaid, &channel_id).await;
            }
            ClientMessage::Unregister { channel_id } => {
                let Some(uaid) = greeted.clone() else {
                    warn!(event = "message_before_hello", session_id, message_type = "unregister");
                    continue;
                };
                let Some(channel_id) = channel_id else {
                    warn!(event = "unregister_missing_channel", session_id);
                    continue;
                };
                handle_unregister(&state, &tx, &uaid, &channel_id).await;
            }
            ClientMessage::Ack { updates } => {
                if greeted.is_none() {
                    warn!(event = "message_before_hello", session_id, message_type = "ack");
                    continue;
                }
                for update in updates {
                    state.delivery().ack(Ack {
                        channel_id: update.channel_id,
                        version: update.version,
                    });
                }
            }
        }
    }

    if let Some(uaid) = &greeted {
        let detached = state
            .registry()
            .write()
            .await
            .detach_session(uaid, session_id);
        if detached {
            info!(event = "session_detached", session_id, uaid = %uaid);
        }
    }
    drop(tx);
    let _ = write_task.await;
}

/// Resolve the agent for this session. A claimed UAID whose listed channels
/// are not all known triggers an ownership reset: the old agent and its
/// channels are dropped and a fresh UAID is issued.
async fn handle_hello(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<Message>,
    session_id: u64,
    claimed_uaid: Option<String>,
    channel_ids: Option<Vec<String>>,
    wakeup_hostport: Option<WakeupHostport>,
    previous: Option<&str>,
) -> String {
    let uaid = {
        let mut registry = state.registry().write().await;

        if let Some(previous) = previous {
            if Some(previous) != claimed_uaid.as_deref() {
                registry.detach_session(previous, session_id);
            }
        }

        let uaid = match claimed_uaid {
            None => fresh_uaid(),
            Some(claimed) => {
                let reset = channel_ids
                    .as_ref()
                    .map(|ids| ids.iter().any(|id| !registry.agent_owns(&claimed, id)))
                    .unwrap_or(false);
                if reset {
                    info!(event = "agent_reset", uaid = %claimed);
                    registry.reset_agent(&claimed);
                    fresh_uaid()
                } else {
                    claimed
                }
            }
        };

        registry.ensure_agent(&uaid);
        if let Some(hostport) = wakeup_hostport {
            registry.set_wakeup(
                &uaid,
                Rendezvous {
                    ip: hostport.ip,
                    port: hostport.port,
                },
            );
        }
        registry.attach_session(&uaid, SessionHandle::new(session_id, tx.clone()));
        registry.touch(&uaid);
        uaid
    };

    state.snapshot().await;
    info!(event = "session_greeted", session_id, uaid = %uaid);
    send_message(
        tx,
        &ServerMessage::Hello {
            status: STATUS_OK,
            uaid: uaid.clone(),
        },
    )
    .await;
    uaid
}

async fn handle_register(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<Message>,
    uaid: &str,
    channel_id: &str,
) {
    use crate::registry::RegisterOutcome;

    let outcome = state
        .registry()
        .write()
        .await
        .register_channel(uaid, channel_id);

    match outcome {
        RegisterOutcome::Registered => {
            state.snapshot().await;
            info!(event = "channel_registered", uaid = %uaid, channel_id = %channel_id);
            send_message(
                tx,
                &ServerMessage::Register {
                    status: STATUS_OK,
                    channel_id: channel_id.to_string(),
                    push_endpoint: state.config().endpoint_url(channel_id),
                },
            )
            .await;
        }
        RegisterOutcome::Conflict => {
            warn!(event = "channel_conflict", uaid = %uaid, channel_id = %channel_id);
            send_message(
                tx,
                &ServerMessage::Register {
                    status: STATUS_CONFLICT,
                    channel_id: channel_id.to_string(),
                    push_endpoint: String::new(),
                },
            )
            .await;
        }
    }
}

async fn handle_unregister(
    state: &Arc<AppState>,
    tx: &mpsc::Sender<Message>,
    uaid: &str,
    channel_id: &str,
) {
    let removed = state
        .registry()
        .write()
        .await
        .unregister_channel(uaid, channel_id);
    state.snapshot().await;
    info!(event = "channel_unregistered", uaid = %uaid, channel_id = %channel_id, removed);

    // idempotent: the reply is 200 whether or not the channel existed
    send_message(
        tx,
        &ServerMessage::Unregister {
            status: STATUS_OK,
            channel_id: channel_id.to_string(),
        },
    )
    .await;
}

async fn send_message(tx: &mpsc::Sender<Message>, message: &ServerMessage) {
    match protocol::encode_server_message(message) {
        Ok(frame) => {
            if tx.send(Message::Text(frame)).await.is_err() {
                warn!(event = "session_send_failed");
            }
        }
        Err(err) => {
            warn!(event = "message_encode_failed", error = %err);
        }
    }
}

fn fresh_uaid() -> String {
    Uuid::new_v4().to_string()
}
