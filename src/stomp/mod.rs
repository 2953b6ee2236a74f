//! STOMP frame codec
//!
//! A frame is a command line, a block of `key:value` headers, an optional
//! body and a trailing NUL. A bare line-feed is the protocol's heartbeat.
//! Frames are built through [`Builder`], which derives inferable headers and
//! verifies the mandatory ones for the command before handing out an
//! immutable [`Frame`].

mod command;
mod frame;

pub use command::Command;
pub use frame::{Builder, Frame, Headers};

use thiserror::Error;

/// Well-known header names.
pub mod headers {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const ID: &str = "id";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const SERVER: &str = "server";
    pub const SESSION: &str = "session";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const TRANSACTION: &str = "transaction";
    pub const VERSION: &str = "version";
}

/// Codec errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("{command} frame missing mandatory '{header}' header")]
    MissingHeader {
        command: Command,
        header: &'static str,
    },

    #[error("malformed header line '{0}'")]
    MalformedHeader(String),

    #[error("{command} does not accept a '{header}' header")]
    HeaderNotAccepted {
        command: Command,
        header: &'static str,
    },

    #[error("{0} does not accept a body")]
    BodyNotAccepted(Command),
}
