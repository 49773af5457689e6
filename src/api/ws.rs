use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};

use crate::broker::BrokerEvent;
use crate::error::BrokerError;
use crate::protocol::{decode_input, ClientMessage, ServerEvent};
use crate::transport::{ConnectionId, Outgoing};

use super::error::ApiError;
use super::AppState;

/// RAII guard that decrements the WebSocket connection count on drop.
pub struct ClientGuard {
    counter: Arc<AtomicUsize>,
}

impl ClientGuard {
    /// Returns `None` once `max` clients are connected. Uses a
    /// compare-exchange loop for race-free admission.
    pub fn acquire(counter: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        loop {
            let current = counter.load(Ordering::Acquire);
            if current >= max {
                return None;
            }
            if counter
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(ClientGuard {
                    counter: Arc::clone(counter),
                });
            }
        }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Release);
    }
}

pub(super) async fn ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let guard = ClientGuard::acquire(&state.ws_count, state.max_connections).ok_or_else(|| {
        tracing::warn!(max = state.max_connections, "rejecting WebSocket: connection limit reached");
        ApiError::TooManyConnections
    })?;
    Ok(ws.on_upgrade(move |socket| handle_ws(socket, state, guard)))
}

/// Map a parsed client message onto the broker event it stands for.
fn into_broker_event(id: ConnectionId, message: ClientMessage) -> Result<BrokerEvent, BrokerError> {
    Ok(match message {
        ClientMessage::TerminalWrite { data, encoding } => BrokerEvent::ClientInput {
            id,
            data: decode_input(data, encoding)?,
        },
        ClientMessage::TerminalResize { rows, cols } => BrokerEvent::ClientResize { id, rows, cols },
        ClientMessage::FileChange {
            id: request_id,
            path,
            content,
        } => BrokerEvent::ClientFileWrite {
            id,
            request_id,
            path,
            content,
        },
        ClientMessage::FileRead {
            id: request_id,
            path,
        } => BrokerEvent::ClientFileRead {
            id,
            request_id,
            path,
        },
        ClientMessage::TreeGet { id: request_id } => BrokerEvent::ClientTreeRequest { id, request_id },
    })
}

async fn handle_ws(socket: WebSocket, state: AppState, _guard: ClientGuard) {
    // Register this connection for graceful shutdown tracking
    let (_shutdown_guard, mut shutdown_rx) = state.shutdown.register();

    let connection = match state.broker.connect().await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(error = %e, "WebSocket opened but broker is unavailable");
            return;
        }
    };
    let id = connection.id;
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            // Broker -> client
            outgoing = connection.outbox.recv() => {
                let Some(outgoing) = outgoing else {
                    break;
                };
                let dropped = connection.outbox.take_dropped();
                if dropped > 0 {
                    tracing::debug!(conn = %id, dropped, "slow client lost messages");
                    let notice = ServerEvent::TransportLagged { dropped }.to_json();
                    if ws_tx.send(Message::Text(notice.into())).await.is_err() {
                        break;
                    }
                }
                let message = match outgoing {
                    Outgoing::Terminal(data) => Message::Binary(data),
                    Outgoing::Event(event) => Message::Text(event.to_json().into()),
                };
                if ws_tx.send(message).await.is_err() {
                    break;
                }
            }

            // Client -> broker
            msg = ws_rx.next() => {
                let event = match msg {
                    Some(Ok(Message::Binary(data))) => BrokerEvent::ClientInput { id, data },
                    Some(Ok(Message::Text(text))) => {
                        match ClientMessage::parse(text.as_str()).and_then(|m| into_broker_event(id, m)) {
                            Ok(event) => event,
                            Err(e) => {
                                tracing::debug!(conn = %id, error = %e, "bad client message");
                                connection.send_event(ServerEvent::error(None, &e));
                                continue;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(_)) => break,
                };
                if state.broker.send(event).await.is_err() {
                    break;
                }
            }

            // Shutdown signal
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::debug!(conn = %id, "WebSocket received shutdown signal, closing");
                    let close_frame = CloseFrame {
                        code: axum::extract::ws::close_code::NORMAL,
                        reason: "server shutting down".into(),
                    };
                    let _ = ws_tx.send(Message::Close(Some(close_frame))).await;
                    let _ = ws_tx.flush().await;
                    break;
                }
            }
        }
    }

    state.broker.disconnect(id).await;
}
