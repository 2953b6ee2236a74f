//! Stompbus - STOMP gateway with SockJS HTTP fallback transports
//!
//! Browser clients exchange STOMP frames with a backend message broker over
//! a native WebSocket where available, or over a family of HTTP transports
//! (polling, streaming, event-stream, script injection) that together
//! emulate a full-duplex channel. A pattern-based security registry gates
//! which frames a caller may send per destination.

pub mod glob;
pub mod security;
pub mod server;
pub mod stomp;

pub use glob::{Glob, GlobCache, GlobError};
pub use security::{Limitation, SecurityContext, SecurityCustomizer, SecurityRegistry};
pub use server::{AppState, LocalBroker, Relay, ServerConfig, Session, SessionRegistry};
pub use stomp::{Command, Frame, FrameError};
