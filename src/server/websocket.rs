//! WebSocket transport
//!
//! The native full-duplex carrier. Unlike the HTTP fallbacks a websocket
//! session lives exactly as long as its one connection: the session is
//! created on upgrade and closed when the socket ends.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::security::SecurityContext;
use crate::server::inbound::process_payload;
use crate::server::session::{
    encode_close, Sender, StreamFraming, CLOSE_ANOTHER_CONNECTION, HEARTBEAT_FRAME, OPEN_FRAME,
};
use crate::server::transports::AppState;

pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((_server, session_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let ctx = (state.authenticator)(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id, ctx))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String, ctx: SecurityContext) {
    let (mut sink, mut stream) = socket.split();

    // a websocket wants a fresh session; a duplicate id means another
    // carrier is still on it
    let session = match state.registry.create(&session_id, ctx) {
        Ok(session) => session,
        Err(e) => {
            debug!(session = %session_id, error = %e, "websocket refused");
            let close = encode_close(CLOSE_ANOTHER_CONNECTION.0, CLOSE_ANOTHER_CONNECTION.1);
            let _ = sink.send(Message::Text(close.into())).await;
            let _ = sink.close().await;
            return;
        }
    };

    if sink.send(Message::Text(OPEN_FRAME.into())).await.is_err() {
        session.close();
        return;
    }

    // no byte budget: a websocket response is not buffered by the client
    let (sender, mut rx) = Sender::stream(StreamFraming::Ws, usize::MAX);
    let sender_id = sender.id();
    if session.attach(sender).is_err() {
        let close = encode_close(CLOSE_ANOTHER_CONNECTION.0, CLOSE_ANOTHER_CONNECTION.1);
        let _ = sink.send(Message::Text(close.into())).await;
        let _ = sink.close().await;
        session.close();
        return;
    }

    info!(session = %session.id(), "websocket connected");

    let heartbeat = state.config.heartbeat_interval;
    let writer_session = session.clone();
    let send_task = tokio::spawn(async move {
        loop {
            match tokio::time::timeout(heartbeat, rx.recv()).await {
                Ok(Some(chunk)) => {
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    writer_session.touch();
                    if sink.send(Message::Text(HEARTBEAT_FRAME.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                session.touch();
                // the protocol ignores empty frames
                if text.is_empty() {
                    continue;
                }
                if process_payload(&state.security, &state.relay, &session, &text)
                    .await
                    .is_err()
                {
                    // a broken payload is fatal on this transport
                    break;
                }
                if !session.is_open() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                debug!(session = %session.id(), "websocket closed by client");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(session = %session.id(), error = %e, "websocket error");
                break;
            }
        }
    }

    session.detach(sender_id);
    if session.is_open() {
        session.close();
    }
    send_task.abort();
}
