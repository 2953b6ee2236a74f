//! stompbus server
//!
//! The transport/session engine: sessions and their carriers, the session
//! registry with its liveness sweep, the SockJS HTTP transports, the native
//! WebSocket transport, and the relay bridging frames to the backend broker.

mod broker;
mod events;
mod inbound;
mod registry;
mod relay;
mod session;
mod transports;
mod websocket;

pub use broker::LocalBroker;
pub use events::{EventKind, EventRegistry};
pub use inbound::{decode_payload, process_payload, InboundError};
pub use registry::SessionRegistry;
pub use relay::{BrokerConnection, BrokerConnector, Relay, RelayError, SYSTEM_SESSION};
pub use session::{
    encode_array, encode_close, PollFraming, Sender, Session, SessionError, StreamFraming,
    CLOSE_ANOTHER_CONNECTION, CLOSE_GO_AWAY, HEARTBEAT_FRAME, OPEN_FRAME,
};
pub use transports::{build_router, AppState, Authenticator};

use std::time::Duration;

/// Tunables for the transport engine.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Cumulative bytes a streaming response may carry before its carrier
    /// force-closes and the client reconnects.
    pub response_limit: usize,
    /// Idle time before a heartbeat frame is written to an open stream.
    pub heartbeat_interval: Duration,
    /// Upper bound on any single transport request, streaming included.
    pub request_timeout: Duration,
    /// Inactivity threshold after which a session is considered dead.
    pub session_timeout: Duration,
    /// How long a closed session entry lingers for reconnects racing the
    /// close.
    pub grace_period: Duration,
    /// Period of the background liveness sweep.
    pub sweep_interval: Duration,
    /// Whether `/info` advertises the websocket transport.
    pub websocket_enabled: bool,
    /// Script URL baked into the iframe document.
    pub sockjs_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            response_limit: 128 * 1024,
            heartbeat_interval: Duration::from_secs(25),
            request_timeout: Duration::from_secs(60),
            session_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5),
            websocket_enabled: true,
            sockjs_url: "https://cdn.jsdelivr.net/sockjs/1/sockjs.min.js".to_string(),
        }
    }
}
