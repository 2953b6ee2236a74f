//! Broker relay
//!
//! Bridges inbound frames to the backend broker and broker-originated
//! frames back onto the owning session's queue. One broker connection per
//! client session, plus one shared system connection for frames that carry
//! no session. Frames for the same session are forwarded in arrival order;
//! different sessions proceed independently.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::security::SecurityContext;
use crate::server::session::Session;
use crate::stomp::{Command, Frame};

/// Session id used for the shared system connection.
pub const SYSTEM_SESSION: &str = "system";

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("no broker connection for session '{0}'")]
    NotConnected(String),

    #[error("broker connection already open for session '{0}'")]
    AlreadyConnected(String),

    #[error("broker error: {0}")]
    Broker(String),
}

/// One open conversation with the backend broker.
#[async_trait]
pub trait BrokerConnection: Send {
    /// Forward a frame to the broker.
    async fn send(&mut self, frame: Frame) -> Result<(), RelayError>;

    /// Tear the conversation down. Must be safe to call more than once.
    async fn close(&mut self);
}

/// Opens broker conversations. The returned receiver carries frames the
/// broker pushes back for the session.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn open(
        &self,
        session_id: &str,
        ctx: &SecurityContext,
    ) -> Result<(Box<dyn BrokerConnection>, mpsc::UnboundedReceiver<Frame>), RelayError>;
}

type SharedConnection = Arc<Mutex<Box<dyn BrokerConnection>>>;

pub struct Relay {
    connector: Arc<dyn BrokerConnector>,
    connections: DashMap<String, SharedConnection>,
}

impl Relay {
    pub fn new(connector: Arc<dyn BrokerConnector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            connections: DashMap::new(),
        })
    }

    /// Open the shared system connection. Frames it pushes back have no
    /// owning session and are dropped after logging.
    pub async fn connect_system(&self) -> Result<(), RelayError> {
        let (connection, mut rx) = self
            .connector
            .open(SYSTEM_SESSION, &SecurityContext::anonymous())
            .await?;
        self.connections
            .insert(SYSTEM_SESSION.to_string(), Arc::new(Mutex::new(connection)));

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                debug!(command = %frame.command(), "system connection frame dropped");
            }
        });
        info!("system broker connection open");
        Ok(())
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        self.connections.contains_key(session_id)
    }

    /// Route one authorized client frame.
    ///
    /// CONNECT/STOMP opens the session's broker connection, DISCONNECT
    /// forwards then tears down, anything else forwards on the existing
    /// connection. Errors tear the connection down before returning; no
    /// half-open state survives.
    pub async fn on_frame(self: &Arc<Self>, session: &Arc<Session>, frame: Frame) -> Result<(), RelayError> {
        let session_id = session.id().to_string();
        let result = match frame.command() {
            Command::Connect | Command::Stomp => self.connect_session(session, frame).await,
            Command::Disconnect => {
                info!(session = %session_id, "DISCONNECT received, closing broker connection");
                let result = self.forward(&session_id, frame).await;
                self.teardown(&session_id).await;
                result
            }
            _ => self.forward(&session_id, frame).await,
        };

        if let Err(e) = &result {
            warn!(session = %session_id, error = %e, "relay failure, tearing down");
            self.teardown(&session_id).await;
        }
        result
    }

    async fn connect_session(
        self: &Arc<Self>,
        session: &Arc<Session>,
        frame: Frame,
    ) -> Result<(), RelayError> {
        let session_id = session.id().to_string();
        if self.connections.contains_key(&session_id) {
            return Err(RelayError::AlreadyConnected(session_id));
        }

        info!(session = %session_id, "opening broker connection");
        let (connection, rx) = self
            .connector
            .open(&session_id, session.security_context())
            .await?;
        let connection: SharedConnection = Arc::new(Mutex::new(connection));
        self.connections.insert(session_id.clone(), connection.clone());

        self.spawn_pump(session.clone(), rx);
        let result = connection.lock().await.send(frame).await;
        result
    }

    /// Feed broker-originated frames onto the session queue. When the broker
    /// side ends, the session is closed with it.
    fn spawn_pump(self: &Arc<Self>, session: Arc<Session>, mut rx: mpsc::UnboundedReceiver<Frame>) {
        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if frame.is_heartbeat() {
                    debug!(session = %session.id(), "heartbeat to client");
                } else {
                    debug!(session = %session.id(), command = %frame.command(), "frame to client");
                }
                session.enqueue(frame.to_wire());
            }
            debug!(session = %session.id(), "broker side ended");
            relay.teardown(session.id()).await;
            if session.is_open() {
                session.close();
            }
        });
    }

    async fn forward(&self, session_id: &str, frame: Frame) -> Result<(), RelayError> {
        let connection = self
            .connections
            .get(session_id)
            .map(|c| c.clone())
            .ok_or_else(|| RelayError::NotConnected(session_id.to_string()))?;
        // the per-connection lock serializes frames of one session without
        // stalling any other session
        let result = connection.lock().await.send(frame).await;
        result
    }

    /// Close and remove the session's broker connection, if any.
    pub async fn teardown(&self, session_id: &str) {
        if let Some((_, connection)) = self.connections.remove(session_id) {
            debug!(session = %session_id, "destroying broker connection");
            connection.lock().await.close().await;
        }
    }

    /// Wire broker teardown to session close, so a session closed by the
    /// sweep or a transport error never leaves a broker connection behind.
    pub fn register_teardown(self: &Arc<Self>, events: &crate::server::events::EventRegistry) {
        let relay = Arc::downgrade(self);
        events.on(crate::server::events::EventKind::Closed, move |session| {
            if let Some(relay) = relay.upgrade() {
                let session_id = session.id().to_string();
                tokio::spawn(async move {
                    relay.teardown(&session_id).await;
                });
            }
        });
    }

    /// Number of open broker connections (system included).
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use crate::server::events::EventRegistry;
    use crate::server::registry::SessionRegistry;

    /// Records forwarded frames and hands the test a push handle.
    struct RecordingConnector {
        sent: Arc<StdMutex<Vec<Frame>>>,
        pushers: Arc<StdMutex<Vec<(String, mpsc::UnboundedSender<Frame>)>>>,
        fail_sends: bool,
    }

    struct RecordingConnection {
        sent: Arc<StdMutex<Vec<Frame>>>,
        fail_sends: bool,
    }

    #[async_trait]
    impl BrokerConnection for RecordingConnection {
        async fn send(&mut self, frame: Frame) -> Result<(), RelayError> {
            if self.fail_sends && frame.command() == Command::Send {
                return Err(RelayError::Broker("send refused".to_string()));
            }
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&mut self) {}
    }

    #[async_trait]
    impl BrokerConnector for RecordingConnector {
        async fn open(
            &self,
            session_id: &str,
            _ctx: &SecurityContext,
        ) -> Result<(Box<dyn BrokerConnection>, mpsc::UnboundedReceiver<Frame>), RelayError>
        {
            let (tx, rx) = mpsc::unbounded_channel();
            self.pushers.lock().unwrap().push((session_id.to_string(), tx));
            Ok((
                Box::new(RecordingConnection {
                    sent: self.sent.clone(),
                    fail_sends: self.fail_sends,
                }),
                rx,
            ))
        }
    }

    type Pushers = Arc<StdMutex<Vec<(String, mpsc::UnboundedSender<Frame>)>>>;

    fn harness(
        fail_sends: bool,
    ) -> (Arc<Relay>, Arc<SessionRegistry>, Arc<StdMutex<Vec<Frame>>>, Pushers) {
        let registry = SessionRegistry::new(
            Arc::new(EventRegistry::new()),
            Duration::from_secs(5),
            Duration::from_secs(5),
        );
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let pushers: Pushers = Arc::new(StdMutex::new(Vec::new()));
        let connector = Arc::new(RecordingConnector {
            sent: sent.clone(),
            pushers: pushers.clone(),
            fail_sends,
        });
        let relay = Relay::new(connector);
        (relay, registry, sent, pushers)
    }

    fn connect_frame() -> Frame {
        Frame::connect("localhost", &["1.2"]).build().unwrap()
    }

    #[tokio::test]
    async fn test_frames_before_connect_are_rejected() {
        let (relay, registry, _sent, _pushers) = harness(false);
        let session = registry.create("s1", SecurityContext::anonymous()).unwrap();

        let send = Frame::send("/queue/a", "x").build().unwrap();
        assert!(matches!(
            relay.on_frame(&session, send).await,
            Err(RelayError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_then_send_in_order() {
        let (relay, registry, sent, _pushers) = harness(false);
        let session = registry.create("s1", SecurityContext::anonymous()).unwrap();

        relay.on_frame(&session, connect_frame()).await.unwrap();
        assert!(relay.is_connected("s1"));

        for body in ["a", "b", "c"] {
            let frame = Frame::send("/queue/x", body).build().unwrap();
            relay.on_frame(&session, frame).await.unwrap();
        }

        let sent = sent.lock().unwrap();
        let commands: Vec<Command> = sent.iter().map(|f| f.command()).collect();
        assert_eq!(
            commands,
            vec![Command::Connect, Command::Send, Command::Send, Command::Send]
        );
        let bodies: Vec<&[u8]> = sent[1..].iter().map(|f| f.body().unwrap().as_ref()).collect();
        assert_eq!(bodies, vec![b"a", b"b", b"c"]);
    }

    #[tokio::test]
    async fn test_duplicate_connect_is_an_error() {
        let (relay, registry, _sent, _pushers) = harness(false);
        let session = registry.create("s1", SecurityContext::anonymous()).unwrap();

        relay.on_frame(&session, connect_frame()).await.unwrap();
        assert!(matches!(
            relay.on_frame(&session, connect_frame()).await,
            Err(RelayError::AlreadyConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_tears_down() {
        let (relay, registry, _sent, _pushers) = harness(false);
        let session = registry.create("s1", SecurityContext::anonymous()).unwrap();

        relay.on_frame(&session, connect_frame()).await.unwrap();
        let disconnect = Frame::disconnect().build().unwrap();
        relay.on_frame(&session, disconnect).await.unwrap();
        assert!(!relay.is_connected("s1"));
    }

    #[tokio::test]
    async fn test_broker_error_tears_down() {
        let (relay, registry, _sent, _pushers) = harness(true);
        let session = registry.create("s1", SecurityContext::anonymous()).unwrap();

        relay.on_frame(&session, connect_frame()).await.unwrap();
        let send = Frame::send("/queue/a", "x").build().unwrap();
        assert!(relay.on_frame(&session, send).await.is_err());
        assert!(!relay.is_connected("s1"));
    }

    #[tokio::test]
    async fn test_pump_enqueues_broker_frames() {
        let (relay, registry, _sent, pushers) = harness(false);
        let session = registry.create("s1", SecurityContext::anonymous()).unwrap();
        relay.on_frame(&session, connect_frame()).await.unwrap();

        let push = pushers.lock().unwrap().last().unwrap().1.clone();
        let message = Frame::message("/queue/a", "sub-1", "hi").build().unwrap();
        push.send(message.clone()).unwrap();

        // give the pump task a turn
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(session.queued(), 1);
    }

    #[tokio::test]
    async fn test_broker_side_ending_closes_session() {
        let (relay, registry, _sent, pushers) = harness(false);
        let session = registry.create("s1", SecurityContext::anonymous()).unwrap();
        relay.on_frame(&session, connect_frame()).await.unwrap();

        pushers.lock().unwrap().clear(); // drop the push handle
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!session.is_open());
        assert!(!relay.is_connected("s1"));
    }
}
