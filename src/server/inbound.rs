//! Inbound pipeline
//!
//! Decodes a transport send payload (a JSON array of strings, or one bare
//! JSON string) into STOMP frames and runs each through security and the
//! relay. Shared by `xhr_send`, `jsonp_send` and the websocket read loop.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::security::SecurityRegistry;
use crate::server::relay::Relay;
use crate::server::session::Session;
use crate::stomp::{headers, Command, Frame, Headers};

/// Payload-level failures, reported to the caller as an HTTP error with the
/// exact message text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InboundError {
    #[error("Payload expected.")]
    PayloadExpected,

    #[error("Broken JSON encoding.")]
    BrokenJson,
}

/// Split a send payload into its message strings.
pub fn decode_payload(payload: &str) -> Result<Vec<String>, InboundError> {
    if payload.is_empty() {
        return Err(InboundError::PayloadExpected);
    }
    if let Ok(messages) = serde_json::from_str::<Vec<String>>(payload) {
        return Ok(messages);
    }
    match serde_json::from_str::<String>(payload) {
        Ok(message) => Ok(vec![message]),
        Err(_) => Err(InboundError::BrokenJson),
    }
}

/// Decode and process one send payload for a session.
///
/// A malformed STOMP frame earns the session an ERROR frame and closes it; a
/// security denial earns an ERROR frame but leaves the session open; a relay
/// failure closes the session after its broker connection is already torn
/// down.
pub async fn process_payload(
    security: &SecurityRegistry,
    relay: &Arc<Relay>,
    session: &Arc<Session>,
    payload: &str,
) -> Result<(), InboundError> {
    let messages = decode_payload(payload)?;
    for message in messages {
        process_frame(security, relay, session, &message).await;
        if !session.is_open() {
            break;
        }
    }
    Ok(())
}

async fn process_frame(
    security: &SecurityRegistry,
    relay: &Arc<Relay>,
    session: &Arc<Session>,
    message: &str,
) {
    let frame = match Frame::parse(message) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(session = %session.id(), error = %e, "malformed frame");
            session.enqueue(error_frame(&e.to_string()).to_wire());
            session.close();
            return;
        }
    };

    if frame.is_heartbeat() {
        session.touch();
        return;
    }

    if !security.is_permitted(&frame, session.security_context()) {
        debug!(session = %session.id(), command = %frame.command(), "frame denied");
        session.enqueue(
            error_frame(&format!("{} denied", frame.command())).to_wire(),
        );
        return;
    }

    let command = frame.command();
    if let Err(e) = relay.on_frame(session, frame).await {
        warn!(session = %session.id(), command = %command, error = %e, "relay rejected frame");
        session.enqueue(error_frame(&e.to_string()).to_wire());
        session.close();
    }
}

fn error_frame(message: &str) -> Frame {
    let mut hs = Headers::new();
    hs.set(headers::MESSAGE, message);
    Frame::from_parts(Command::Error, hs, None)
}
