//! WebSocket handling
//!
//! An upgrade is authenticated before the handshake completes: a missing or
//! invalid credential gets a plain `401` and no connection object is ever
//! created. Authenticated sockets are registered under their identity, get a
//! keep-alive probe, and have their text frames routed to the inbound
//! handler until either side closes or a newer connection supersedes them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use capture_relay_protocol::{CLOSE_SUPERSEDED, CLOSE_SUPERSEDED_REASON};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth::{handshake_bearer, AUTH_QUERY_PARAM};
use crate::inbound::InboundContext;
use crate::keepalive::KeepAliveMonitor;
use crate::registry::{ConnectionHandle, Outbound};
use crate::state::AppState;

const OUTBOUND_QUEUE: usize = 64;

/// How long the writer gets to flush its close frame during teardown.
const WRITER_DRAIN: Duration = Duration::from_secs(2);

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::CONNECTION, "close")],
        "Unauthorized",
    )
        .into_response()
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = handshake_bearer(&headers, params.get(AUTH_QUERY_PARAM).map(String::as_str))
    else {
        warn!(
            component = "websocket",
            event = "ws.auth.missing",
            "Missing or malformed Auth parameter"
        );
        return unauthorized();
    };

    let identity = match state.verifier.verify(token).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(
                component = "websocket",
                event = "ws.auth.rejected",
                error = %e,
                "Token verification failed"
            );
            return unauthorized();
        }
    };

    info!(
        component = "websocket",
        event = "ws.auth.verified",
        user_id = %identity,
        "WebSocket token verified"
    );
    ws.on_upgrade(move |socket| handle_socket(socket, state, identity))
}

/// Handle an authenticated WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, identity: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);

    let connection = ConnectionHandle::new(identity.clone(), outbound_tx);
    let conn_id = connection.id();
    state.registry.register(connection.clone());
    let keepalive = KeepAliveMonitor::spawn(connection.clone(), state.keepalive_period);

    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        user_id = %identity,
        "WebSocket connection established"
    );

    // Writer: drains the outbound queue until the connection is closed.
    let writer_conn = connection.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                _ = writer_conn.closed() => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_SUPERSEDED,
                            reason: CLOSE_SUPERSEDED_REASON.into(),
                        })))
                        .await;
                    break;
                }
                frame = outbound_rx.recv() => frame,
            };
            let Some(frame) = frame else { break };

            let result = match frame {
                Outbound::Text(text) => ws_tx.send(Message::Text(text.into())).await,
                Outbound::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };
            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    loop {
        let next = tokio::select! {
            _ = connection.closed() => {
                info!(
                    component = "websocket",
                    event = "ws.connection.superseded",
                    connection_id = conn_id,
                    user_id = %identity,
                    "Connection closed by a newer connection"
                );
                break;
            }
            next = ws_rx.next() => next,
        };
        let Some(result) = next else { break };

        match result {
            Ok(Message::Text(text)) => {
                let text = text.as_str().to_owned();
                handle_inbound(&state, &connection, text).await;
            }
            Ok(Message::Ping(data)) => {
                let _ = connection.try_send(Outbound::Pong(data));
            }
            Ok(Message::Close(frame)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    code = frame.as_ref().map(|f| f.code),
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        }
    }

    keepalive.stop();
    let unregistered = state.registry.unregister(&connection);
    if connection.is_closed() {
        // Superseded: the writer is flushing its close frame.
        if tokio::time::timeout(WRITER_DRAIN, send_task).await.is_err() {
            debug!(
                component = "websocket",
                event = "ws.send.drain_timeout",
                connection_id = conn_id,
                "Writer did not finish in time"
            );
        }
    } else {
        send_task.abort();
        connection.close();
    }

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        user_id = %identity,
        unregistered,
        duration_ms = connection.created_at().elapsed().as_millis() as u64,
        "WebSocket connection closed"
    );
}

async fn handle_inbound(state: &Arc<AppState>, connection: &ConnectionHandle, text: String) {
    debug!(
        component = "websocket",
        event = "ws.message.received",
        connection_id = connection.id(),
        user_id = %connection.identity(),
        payload_bytes = text.len(),
        "Received message"
    );

    let ctx = InboundContext {
        identity: connection.identity().to_string(),
        connection_id: connection.id(),
        dispatcher: state.dispatcher.clone(),
    };

    match state.handler.handle(&ctx, text).await {
        Ok(Some(reply)) => {
            if !connection.send(Outbound::Text(reply)).await {
                debug!(
                    component = "websocket",
                    event = "ws.reply.dropped",
                    connection_id = connection.id(),
                    "Connection closed before reply could be sent"
                );
            }
        }
        Ok(None) => {}
        Err(e) => {
            error!(
                component = "websocket",
                event = "ws.message.handler_failed",
                connection_id = connection.id(),
                user_id = %connection.identity(),
                error = %e,
                "Error processing message"
            );
        }
    }
}
