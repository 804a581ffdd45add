//! WebSocket handler for Axum
//!
//! Resolves the connection's identity, then runs one reader loop and one
//! writer task per connection.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use parley_shared::{ClientEvent, Identity, ServerEvent};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

use super::{
    connection::{Connection, Outbound},
    messaging::PrivateSend,
};

/// How long a closing connection's writer may keep flushing
const WRITER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    #[serde(default)]
    token: Option<String>,
}

/// WebSocket handler - upgrades HTTP connection to WebSocket.
///
/// The credential comes from the `token` query parameter and is resolved
/// before the upgrade, so a rejected attempt never reaches the gateway.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> ApiResult<Response> {
    let credential = params.token.unwrap_or_default();
    let identity = state.resolver.resolve(&credential).await.map_err(|e| {
        tracing::warn!(error = %e, "WebSocket auth failed");
        ApiError::from(e)
    })?;

    tracing::info!(
        identity_id = identity.id,
        kind = identity.kind.as_str(),
        "WebSocket connection upgrade requested"
    );

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, identity, state)))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, identity: Identity, state: AppState) {
    let (sender, mut receiver) = socket.split();

    let (conn, outbound) = attach(&state, identity).await;
    let session_id = conn.session_id;
    let mut send_task = tokio::spawn(write_events(sender, outbound));

    // Events from one connection are handled one at a time, in order
    loop {
        let msg = tokio::select! {
            msg = receiver.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = conn.closed() => {
                tracing::info!(session_id = %session_id, "Connection closed by server");
                break;
            }
        };
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => dispatch(&state, &conn, event).await,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        session_id = %session_id,
                        "Failed to parse client event"
                    );
                    let _ = conn.send(ServerEvent::Error {
                        message: "Invalid event format".to_string(),
                        idempotency_token: None,
                    });
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!(session_id = %session_id, "WebSocket close frame received");
                break;
            }
            Ok(_) => {} // Axum answers pings itself; binary frames are ignored
            Err(e) => {
                tracing::debug!(error = %e, session_id = %session_id, "WebSocket read failed");
                break;
            }
        }
    }

    detach(&state, &conn).await;
    drop(conn);

    // Let the writer flush what is already queued, such as a final error
    if tokio::time::timeout(WRITER_DRAIN, &mut send_task).await.is_err() {
        send_task.abort();
    }
}

/// Bind a new connection for `identity` to the gateway and the presence
/// tracker. The connection acknowledgment is queued here; the tracker
/// follows it with the current online set.
pub async fn attach(state: &AppState, identity: Identity) -> (Arc<Connection>, Outbound) {
    let (conn, outbound) = Connection::new(identity.clone(), state.config.lossy_queue_capacity);
    let conn = Arc::new(conn);

    state.gateway.register(Arc::clone(&conn)).await;
    let _ = conn.send(ServerEvent::Connected {
        session_id: conn.session_id,
        identity,
    });
    state.presence.connected(Arc::clone(&conn));

    (conn, outbound)
}

/// Release a connection bound by [`attach`]
pub async fn detach(state: &AppState, conn: &Connection) {
    let identity_id = conn.identity_id();
    tracing::info!(session_id = %conn.session_id, identity_id, "WebSocket connection closing");
    // The gateway may already have pruned the connection after a failed
    // delivery; presence still pairs with the earlier `attach`
    state.gateway.unregister(identity_id, conn.session_id).await;
    state.presence.disconnected(identity_id);
}

/// Drain a connection's queues into the socket, reliable events first
async fn write_events(mut sender: SplitSink<WebSocket, Message>, mut outbound: Outbound) {
    while let Some(event) = outbound.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => {
                if sender.send(Message::Text(json)).await.is_err() {
                    break; // Connection closed
                }
            }
            Err(e) => {
                tracing::error!(error = %e, event_type = event.kind(), "Failed to serialize WebSocket event");
            }
        }
    }
    let _ = sender.close().await;
}

/// Handle one client event on behalf of `conn`
pub async fn dispatch(state: &AppState, conn: &Connection, event: ClientEvent) {
    match event {
        ClientEvent::SendPrivateMessage {
            receiver_id,
            body,
            attachment,
            idempotency_token,
        } => {
            let send = PrivateSend {
                receiver_id,
                body,
                attachment,
                idempotency_token: idempotency_token.clone(),
            };
            if let Err(e) = state.router.send_private(&conn.identity, send).await {
                tracing::debug!(
                    identity_id = conn.identity_id(),
                    idempotency_token = %idempotency_token,
                    error = %e,
                    "Rejected private message"
                );
                let _ = conn.send(ServerEvent::Error {
                    message: e.to_string(),
                    idempotency_token: Some(idempotency_token),
                });
            }
        }

        ClientEvent::SendGlobalMessage { body } => {
            if let Err(e) = state.router.send_global(&conn.identity, &body).await {
                let _ = conn.send(ServerEvent::Error {
                    message: e.to_string(),
                    idempotency_token: None,
                });
            }
        }

        ClientEvent::TypingStart { receiver_id } => {
            state
                .typing
                .start_typing(conn.identity_id(), receiver_id)
                .await;
        }

        ClientEvent::TypingStop { receiver_id } => {
            state
                .typing
                .stop_typing(conn.identity_id(), receiver_id)
                .await;
        }

        ClientEvent::Ping => {
            let _ = conn.send(ServerEvent::Pong);
        }
    }
}
