//! In-process broker
//!
//! A minimal destination/subscription broker behind the
//! [`BrokerConnector`](crate::server::relay::BrokerConnector) seam, used by
//! the daemon and the tests. Destinations are matched exactly; MESSAGE
//! frames fan out to every subscriber of the destination.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::security::SecurityContext;
use crate::server::relay::{BrokerConnection, BrokerConnector, RelayError};
use crate::stomp::{headers, Command, Frame};

const STOMP_VERSION: &str = "1.2";
const SERVER_NAME: &str = concat!("stompbus/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
struct Subscription {
    session_id: String,
    subscription_id: String,
    tx: mpsc::UnboundedSender<Frame>,
}

/// Shared broker state: destination name to its subscribers. Cloning is
/// cheap and shares the subscription table.
#[derive(Clone, Default)]
pub struct LocalBroker {
    subscriptions: Arc<DashMap<String, Vec<Subscription>>>,
}

impl LocalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscribe(&self, destination: &str, subscription: Subscription) {
        self.subscriptions
            .entry(destination.to_string())
            .or_default()
            .push(subscription);
    }

    fn unsubscribe(&self, session_id: &str, subscription_id: &str) {
        self.subscriptions.retain(|_, subs| {
            subs.retain(|s| {
                !(s.session_id == session_id && s.subscription_id == subscription_id)
            });
            !subs.is_empty()
        });
    }

    fn drop_session(&self, session_id: &str) {
        self.subscriptions.retain(|_, subs| {
            subs.retain(|s| s.session_id != session_id);
            !subs.is_empty()
        });
    }

    /// Deliver a SEND frame to every subscriber of its destination as a
    /// MESSAGE frame. Returns the number of deliveries.
    fn publish(&self, frame: &Frame) -> usize {
        let Some(destination) = frame.destination() else {
            return 0;
        };
        let Some(subscribers) = self.subscriptions.get(destination) else {
            debug!(destination, "no subscribers for destination");
            return 0;
        };

        let mut delivered = 0;
        for subscriber in subscribers.iter() {
            let mut builder = Frame::message(
                destination,
                &subscriber.subscription_id,
                frame.body().cloned().unwrap_or_default(),
            )
            .session(subscriber.session_id.clone());
            if let Some(content_type) = frame.content_type() {
                builder = builder.content_type(content_type);
            }
            if let Some(content_length) = frame.headers().get(headers::CONTENT_LENGTH) {
                builder = builder.header(headers::CONTENT_LENGTH, content_length);
            }
            let Ok(message) = builder.build() else {
                continue;
            };
            if subscriber.tx.send(message).is_ok() {
                delivered += 1;
            }
        }
        debug!(destination, delivered, "message routed");
        delivered
    }
}

#[async_trait]
impl BrokerConnector for LocalBroker {
    async fn open(
        &self,
        session_id: &str,
        _ctx: &SecurityContext,
    ) -> Result<(Box<dyn BrokerConnection>, mpsc::UnboundedReceiver<Frame>), RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Box::new(LocalConnection {
                broker: self.clone(),
                session_id: session_id.to_string(),
                tx,
            }),
            rx,
        ))
    }
}

/// One session's conversation with the local broker.
struct LocalConnection {
    broker: LocalBroker,
    session_id: String,
    tx: mpsc::UnboundedSender<Frame>,
}

impl LocalConnection {
    fn reply(&self, frame: Frame) {
        let _ = self.tx.send(frame);
    }

    fn receipt_if_requested(&self, frame: &Frame) -> Result<(), RelayError> {
        if let Some(receipt) = frame.receipt() {
            let receipt = Frame::receipt_for(receipt)
                .build()
                .map_err(|e| RelayError::Broker(e.to_string()))?;
            self.reply(receipt);
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for LocalConnection {
    async fn send(&mut self, frame: Frame) -> Result<(), RelayError> {
        match frame.command() {
            Command::Connect | Command::Stomp => {
                let connected = Frame::connected(STOMP_VERSION, &self.session_id)
                    .header(headers::SERVER, SERVER_NAME)
                    .build()
                    .map_err(|e| RelayError::Broker(e.to_string()))?;
                self.reply(connected);
            }
            Command::Subscribe => {
                let (Some(destination), Some(id)) = (frame.destination(), frame.subscription())
                else {
                    return Err(RelayError::Broker(
                        "SUBSCRIBE missing destination or id".to_string(),
                    ));
                };
                self.broker.subscribe(
                    destination,
                    Subscription {
                        session_id: self.session_id.clone(),
                        subscription_id: id.to_string(),
                        tx: self.tx.clone(),
                    },
                );
                self.receipt_if_requested(&frame)?;
            }
            Command::Unsubscribe => {
                if let Some(id) = frame.subscription() {
                    self.broker.unsubscribe(&self.session_id, id);
                }
                self.receipt_if_requested(&frame)?;
            }
            Command::Send => {
                self.broker.publish(&frame);
                self.receipt_if_requested(&frame)?;
            }
            Command::Disconnect => {
                self.receipt_if_requested(&frame)?;
                self.broker.drop_session(&self.session_id);
            }
            // transactions and acknowledgements are accepted but have no
            // effect in the stand-in
            Command::Begin | Command::Commit | Command::Abort | Command::Ack | Command::Nack => {
                self.receipt_if_requested(&frame)?;
            }
            Command::Heartbeat => {}
            other => {
                return Err(RelayError::Broker(format!(
                    "unexpected client frame {other}"
                )));
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.broker.drop_session(&self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(
        broker: &LocalBroker,
        session_id: &str,
    ) -> (Box<dyn BrokerConnection>, mpsc::UnboundedReceiver<Frame>) {
        broker
            .open(session_id, &SecurityContext::anonymous())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_yields_connected() {
        let broker = LocalBroker::new();
        let (mut conn, mut rx) = open(&broker, "s1").await;

        conn.send(Frame::connect("localhost", &["1.2"]).build().unwrap())
            .await
            .unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.command(), Command::Connected);
        assert_eq!(reply.headers().get(headers::VERSION), Some("1.2"));
        assert_eq!(reply.session(), Some("s1"));
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_subscribers() {
        let broker = LocalBroker::new();
        let (mut sub_conn, mut sub_rx) = open(&broker, "subscriber").await;
        let (mut pub_conn, _pub_rx) = open(&broker, "publisher").await;

        sub_conn
            .send(Frame::subscribe("sub-0", "/queue/greetings").build().unwrap())
            .await
            .unwrap();
        pub_conn
            .send(Frame::send("/queue/greetings", "hello").build().unwrap())
            .await
            .unwrap();

        let message = sub_rx.recv().await.unwrap();
        assert_eq!(message.command(), Command::Message);
        assert_eq!(message.destination(), Some("/queue/greetings"));
        assert_eq!(message.subscription(), Some("sub-0"));
        assert_eq!(message.body().unwrap().as_ref(), b"hello");
        assert!(message.headers().contains(headers::MESSAGE_ID));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broker = LocalBroker::new();
        let (mut sub_conn, mut sub_rx) = open(&broker, "subscriber").await;
        let (mut pub_conn, _pub_rx) = open(&broker, "publisher").await;

        sub_conn
            .send(Frame::subscribe("sub-0", "/topic/x").build().unwrap())
            .await
            .unwrap();
        sub_conn
            .send(
                Frame::builder(Command::Unsubscribe)
                    .subscription("sub-0")
                    .build()
                    .unwrap(),
            )
            .await
            .unwrap();
        pub_conn
            .send(Frame::send("/topic/x", "nope").build().unwrap())
            .await
            .unwrap();

        assert!(sub_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_receipt_requested() {
        let broker = LocalBroker::new();
        let (mut conn, mut rx) = open(&broker, "s1").await;

        conn.send(
            Frame::subscribe("sub-0", "/topic/x")
                .receipt("r-7")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.command(), Command::Receipt);
        assert_eq!(reply.receipt_id(), Some("r-7"));
    }

    #[tokio::test]
    async fn test_close_drops_subscriptions() {
        let broker = LocalBroker::new();
        let (mut sub_conn, mut sub_rx) = open(&broker, "subscriber").await;
        let (mut pub_conn, _pub_rx) = open(&broker, "publisher").await;

        sub_conn
            .send(Frame::subscribe("sub-0", "/topic/x").build().unwrap())
            .await
            .unwrap();
        sub_conn.close().await;

        pub_conn
            .send(Frame::send("/topic/x", "gone").build().unwrap())
            .await
            .unwrap();
        assert!(sub_rx.try_recv().is_err());
    }
}
