//! STOMP command set and per-command capabilities.

use std::fmt;
use std::str::FromStr;

use crate::stomp::FrameError;

/// A STOMP protocol command.
///
/// `Heartbeat` stands in for the bare line-feed keep-alive, which has no
/// command token on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
    Heartbeat,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        use Command::*;

        match *self {
            Connect => "CONNECT",
            Stomp => "STOMP",
            Connected => "CONNECTED",
            Send => "SEND",
            Subscribe => "SUBSCRIBE",
            Unsubscribe => "UNSUBSCRIBE",
            Ack => "ACK",
            Nack => "NACK",
            Begin => "BEGIN",
            Commit => "COMMIT",
            Abort => "ABORT",
            Disconnect => "DISCONNECT",
            Message => "MESSAGE",
            Receipt => "RECEIPT",
            Error => "ERROR",
            Heartbeat => "HEARTBEAT",
        }
    }

    /// Whether frames of this command may carry a `destination` header.
    pub fn accepts_destination(&self) -> bool {
        matches!(self, Command::Send | Command::Message | Command::Subscribe)
    }

    /// Whether frames of this command may carry a body.
    pub fn accepts_body(&self) -> bool {
        matches!(self, Command::Send | Command::Message | Command::Error)
    }

    /// Whether frames of this command may reference a subscription.
    pub fn accepts_subscription_id(&self) -> bool {
        matches!(
            self,
            Command::Subscribe
                | Command::Unsubscribe
                | Command::Message
                | Command::Ack
                | Command::Nack
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use Command::*;

        match s {
            "CONNECT" => Ok(Connect),
            "STOMP" => Ok(Stomp),
            "CONNECTED" => Ok(Connected),
            "SEND" => Ok(Send),
            "SUBSCRIBE" => Ok(Subscribe),
            "UNSUBSCRIBE" => Ok(Unsubscribe),
            "ACK" => Ok(Ack),
            "NACK" => Ok(Nack),
            "BEGIN" => Ok(Begin),
            "COMMIT" => Ok(Commit),
            "ABORT" => Ok(Abort),
            "DISCONNECT" => Ok(Disconnect),
            "MESSAGE" => Ok(Message),
            "RECEIPT" => Ok(Receipt),
            "ERROR" => Ok(Error),
            "HEARTBEAT" => Ok(Heartbeat),
            other => Err(FrameError::UnknownCommand(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_names() {
        for cmd in [
            Command::Connect,
            Command::Send,
            Command::Subscribe,
            Command::Message,
            Command::Receipt,
            Command::Error,
        ] {
            assert_eq!(cmd.as_str().parse::<Command>().unwrap(), cmd);
        }
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            "GIBBERISH".parse::<Command>(),
            Err(FrameError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_capabilities() {
        assert!(Command::Send.accepts_destination());
        assert!(Command::Send.accepts_body());
        assert!(!Command::Send.accepts_subscription_id());

        assert!(Command::Message.accepts_destination());
        assert!(Command::Message.accepts_body());
        assert!(Command::Message.accepts_subscription_id());

        assert!(!Command::Connect.accepts_destination());
        assert!(!Command::Connect.accepts_body());

        assert!(Command::Ack.accepts_subscription_id());
        assert!(!Command::Ack.accepts_body());

        assert!(Command::Error.accepts_body());
        assert!(!Command::Error.accepts_destination());
    }
}
