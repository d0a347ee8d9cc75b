//! Session Layer
//!
//! One WebSocket per provider node, carrying the framed messages from
//! [`crate::protocol`]. A session starts in a registration handshake: the
//! first frame MUST be `register`, carrying the provider's credential and
//! advertised model list. After a successful handshake the reader loop
//! demuxes correlated completion responses to the dispatcher's pending map
//! and feeds every inbound frame into the heartbeat bookkeeping. A writer
//! task owns the sink half; the registry holds only the channel sender, so
//! dropping the entry closes the socket cleanly.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::users;
use crate::config::AuthConfig;
use crate::db::Database;
use crate::protocol::{BrokerFrame, ProviderFrame};
use crate::AppState;

/// How long a freshly connected socket may take to send `register`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound frame buffer per session. A full buffer fails the send, which
/// surfaces as a transport error on the affected request.
const WRITE_BUFFER: usize = 64;

/// GET /v1/providers/connect -- WebSocket upgrade for provider nodes.
pub async fn provider_ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(state, socket))
}

async fn handle_session(state: AppState, socket: WebSocket) {
    let session_id = Uuid::new_v4();
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::channel::<BrokerFrame>(WRITE_BUFFER);
    let writer = tokio::spawn(write_loop(sink, rx));

    tracing::debug!(session = %session_id, "Provider connected, awaiting registration");

    // -- Handshake ------------------------------------------------------------
    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream)).await;
    let (account_id, models) = match handshake {
        Ok(Some(ProviderFrame::Register { api_key, models })) => {
            match resolve_account(&state.db, &state.config.auth, api_key.as_deref()) {
                Ok(account) => (account, models),
                Err(reason) => {
                    tracing::info!(session = %session_id, %reason, "Registration rejected");
                    let _ = tx.send(BrokerFrame::Error { error: reason }).await;
                    drop(tx);
                    let _ = writer.await;
                    return;
                }
            }
        }
        Ok(Some(_)) => {
            let _ = tx
                .send(BrokerFrame::Error {
                    error: "first message must be register".to_string(),
                })
                .await;
            drop(tx);
            let _ = writer.await;
            return;
        }
        Ok(None) => {
            tracing::debug!(session = %session_id, "Closed before registration");
            drop(tx);
            let _ = writer.await;
            return;
        }
        Err(_) => {
            tracing::debug!(session = %session_id, "Registration handshake timed out");
            let _ = tx
                .send(BrokerFrame::Error {
                    error: "registration timed out".to_string(),
                })
                .await;
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    let model_names: Vec<String> = models.iter().map(|m| m.name().to_string()).collect();
    state
        .registry
        .register(session_id, account_id, model_names, tx.clone());
    let _ = tx.send(BrokerFrame::Registered).await;

    // -- Reader loop ----------------------------------------------------------
    let reason = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ProviderFrame>(&text) {
                Ok(ProviderFrame::Register { .. }) => {
                    // Idempotent ack; state is not duplicated.
                    state.registry.heartbeat(session_id);
                    let _ = tx.send(BrokerFrame::Registered).await;
                }
                Ok(ProviderFrame::Pong) => {
                    state.registry.heartbeat(session_id);
                }
                Ok(ProviderFrame::CompletionResponse { id, response }) => {
                    state.registry.heartbeat(session_id);
                    if !state.pending.complete(id, response) {
                        tracing::warn!(
                            session = %session_id,
                            correlation = %id,
                            "Unknown correlation id, dropping response"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(session = %session_id, error = %e, "Malformed provider frame");
                }
            },
            Some(Ok(Message::Pong(_))) => {
                state.registry.heartbeat(session_id);
            }
            Some(Ok(Message::Ping(_))) => {
                // The websocket layer answers transport pings itself.
            }
            Some(Ok(Message::Close(_))) => break "closed by provider",
            Some(Ok(Message::Binary(_))) => {
                tracing::debug!(session = %session_id, "Ignoring binary frame");
            }
            Some(Err(e)) => {
                tracing::debug!(session = %session_id, error = %e, "Read error");
                break "transport error";
            }
            None => break "connection dropped",
        }
    };

    // -- Teardown: purge the entry, then fail its outstanding requests.
    if let Some(removed) = state.registry.remove(session_id, reason) {
        state
            .pending
            .fail_many(&removed.pending, "provider disconnected");
    }
    drop(tx);
    let _ = writer.await;
}

/// Writer task: serialize outbound frames onto the sink until the channel
/// closes, then perform the close handshake.
async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<BrokerFrame>) {
    while let Some(frame) = rx.recv().await {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize broker frame");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Read the next structured frame, skipping transport-level frames.
/// `None` means the connection ended or produced garbage.
async fn read_frame(stream: &mut SplitStream<WebSocket>) -> Option<ProviderFrame> {
    loop {
        match stream.next().await? {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Resolve a registration credential to an account, or to an anonymous
/// session when the configuration allows it.
fn resolve_account(
    db: &Database,
    auth: &AuthConfig,
    api_key: Option<&str>,
) -> Result<Option<String>, String> {
    match api_key {
        Some(key) if !key.is_empty() => match users::validate_api_key(db, key) {
            Ok(user) => Ok(Some(user.user_id)),
            Err(_) if auth.allow_anonymous_providers => Ok(None),
            Err(_) => Err("invalid API key".to_string()),
        },
        _ if auth.allow_anonymous_providers => Ok(None),
        _ => Err("registration requires an API key".to_string()),
    }
}
