//! WebSocket event transport.
//!
//! Each connected client holds one socket and joins/leaves session groups
//! through control messages. The server pushes session events as JSON.
//! Missed events are not replayed; reconnecting clients rejoin and read
//! history through the query endpoints.

use std::collections::HashMap;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::events::SessionEvent;

use super::AppState;

/// Outbound queue depth per client. A client that cannot drain this many
/// events loses its connection rather than stalling publishers.
const CLIENT_BUFFER: usize = 256;

/// Control messages a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    JoinSession { session_id: Uuid },
    LeaveSession { session_id: Uuid },
}

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| client_loop(state, socket))
}

async fn client_loop(state: AppState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<SessionEvent>(CLIENT_BUFFER);
    let mut joined: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let Ok(text) = serde_json::to_string(&event) else { continue };
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<ControlMessage>(&text) {
                        Ok(ControlMessage::JoinSession { session_id }) => {
                            join_session(&state, &mut joined, session_id, tx.clone());
                        }
                        Ok(ControlMessage::LeaveSession { session_id }) => {
                            if let Some(handle) = joined.remove(&session_id) {
                                handle.abort();
                                debug!(%session_id, "Client left session group");
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "Ignoring malformed control message");
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "WebSocket read failed");
                    break;
                }
            },
        }
    }

    for handle in joined.into_values() {
        handle.abort();
    }
}

/// Subscribe the client to one session's event stream. Events published
/// after this point are forwarded in order; a lagging subscription skips
/// the lost span and continues.
fn join_session(
    state: &AppState,
    joined: &mut HashMap<Uuid, JoinHandle<()>>,
    session_id: Uuid,
    tx: mpsc::Sender<SessionEvent>,
) {
    if joined.contains_key(&session_id) {
        return;
    }
    let mut events = state.hub.subscribe(session_id);
    debug!(%session_id, "Client joined session group");

    let handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(%session_id, missed, "Subscriber lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    joined.insert(session_id, handle);
}
