//! WebSocket transport
//!
//! One socket per authenticated user. Outbound events come from the user's
//! hub outbox; inbound text frames are parsed and dispatched to the
//! orchestrator. A newer socket for the same user closes this one's outbox,
//! and only the current socket's close reaches `disconnect`.

use crate::state::{AppState, AuthUser};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use callwire_core::events::{ClientEvent, ServerEvent};
use callwire_core::transport::SignalSink;
use callwire_core::types::UserId;
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

pub async fn ws_handler(
    AuthUser(user): AuthUser,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: UserId) {
    let registration = state.hub.register(&user);
    let connection = registration.id;
    let mut outbox = registration.outbox;
    info!(user_id = %user, connection = %connection, "Signaling connection opened");

    if let Err(e) = state.orchestrator.connect(&user).await {
        error!(user_id = %user, error = %e, "Failed to restore session state");
    }

    let (mut sender, mut receiver) = socket.split();
    let mut shutdown = state.shutdown.subscribe();

    loop {
        tokio::select! {
            outgoing = outbox.recv() => {
                let Some(event) = outgoing else {
                    debug!(user_id = %user, connection = %connection, "Connection replaced");
                    break;
                };
                match event.to_json() {
                    Ok(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!(user_id = %user, error = %e, "Failed to encode event"),
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_frame(&state, &user, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(user_id = %user, error = %e, "Socket error");
                    break;
                }
            },
            _ = shutdown.recv() => break,
        }
    }

    if let Err(e) = sender.close().await {
        debug!(user_id = %user, error = %e, "Socket already closed");
    }

    if state.hub.unregister(&user, connection) {
        info!(user_id = %user, connection = %connection, "Signaling connection closed");
        if let Err(e) = state.orchestrator.disconnect(&user).await {
            error!(user_id = %user, error = %e, "Failed to process disconnect");
        }
    }
}

async fn handle_frame(state: &AppState, user: &UserId, text: &str) {
    let event = match ClientEvent::from_json(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(user_id = %user, error = %e, "Unparseable signaling frame");
            state.hub.emit(user, ServerEvent::error("Invalid message format."));
            return;
        }
    };

    // Failures were already reported to the sender as call:error
    let _ = state.orchestrator.dispatch(user, event).await;
}
