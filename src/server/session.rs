//! Transport sessions and their attached carriers
//!
//! A [`Session`] is the logical identity of one client, independent of
//! whichever HTTP connection currently serves it. Outgoing frames are queued
//! on the session; a [`Sender`] is the carrier bound to one connection that
//! drains the queue using its transport's framing. At most one sender may be
//! attached at a time; a concurrent second attach is rejected so the losing
//! request can answer with close code 2010.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::security::SecurityContext;
use crate::server::events::{EventKind, EventRegistry};
use crate::server::registry::SessionRegistry;

/// SockJS open frame.
pub const OPEN_FRAME: &str = "o";
/// SockJS heartbeat frame.
pub const HEARTBEAT_FRAME: &str = "h";

/// Session closed or never existed.
pub const CLOSE_GO_AWAY: (u16, &str) = (3000, "Go away!");
/// A second carrier tried to attach while one was active.
pub const CLOSE_ANOTHER_CONNECTION: (u16, &str) = (2010, "Another connection still open");

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{0}' already exists")]
    SessionExists(String),

    #[error("another sender is already attached to session '{0}'")]
    SenderAlreadyAttached(String),

    #[error("session '{0}' is closed")]
    Closed(String),
}

/// Encode queued messages as a SockJS array frame: `a[...]`.
pub fn encode_array(messages: &[String]) -> String {
    let mut out = String::from("a");
    // serializing a &[String] to JSON cannot fail
    out.push_str(&serde_json::to_string(messages).unwrap_or_else(|_| "[]".to_string()));
    out
}

/// Encode a SockJS close frame: `c[code,"reason"]`.
pub fn encode_close(code: u16, reason: &str) -> String {
    format!("c[{code},{}]", serde_json::Value::String(reason.to_string()))
}

/// Textual envelope used by the one-shot polling transports.
#[derive(Debug, Clone)]
pub enum PollFraming {
    /// Bare frame plus newline (`xhr`).
    Xhr,
    /// Callback invocation wrapper (`jsonp`).
    Jsonp { callback: String },
}

impl PollFraming {
    pub fn wrap(&self, payload: &str) -> Bytes {
        match self {
            PollFraming::Xhr => Bytes::from(format!("{payload}\n")),
            PollFraming::Jsonp { callback } => Bytes::from(format!(
                "{callback}({});\r\n",
                serde_json::Value::String(payload.to_string())
            )),
        }
    }
}

/// Textual envelope used by the streaming transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFraming {
    /// Bare frame plus newline (`xhr_streaming`).
    Xhr,
    /// `data: ...` events (`eventsource`).
    EventSource,
    /// Script-tag chunks invoking the page callback (`htmlfile`).
    HtmlFile,
    /// One frame per message, no wrapper (`websocket`).
    Ws,
}

impl StreamFraming {
    pub fn wrap(&self, payload: &str) -> Bytes {
        match self {
            StreamFraming::Xhr => Bytes::from(format!("{payload}\n")),
            StreamFraming::EventSource => Bytes::from(format!("data: {payload}\r\n\r\n")),
            StreamFraming::HtmlFile => Bytes::from(format!(
                "<script>\np({});\n</script>\r\n",
                serde_json::Value::String(payload.to_string())
            )),
            StreamFraming::Ws => Bytes::from(payload.to_string()),
        }
    }
}

enum SendOutcome {
    Sent,
    /// The cumulative byte budget is spent; the carrier must be released so
    /// the client reconnects.
    LimitReached,
    /// The connection went away underneath us.
    Disconnected,
}

/// One-shot carrier: drains the whole queue into a single array frame and
/// releases itself.
pub struct PollSender {
    id: Uuid,
    framing: PollFraming,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl PollSender {
    fn send(&self, messages: &[String]) {
        let chunk = self.framing.wrap(&encode_array(messages));
        let _ = self.tx.send(chunk);
    }

    fn send_close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(self.framing.wrap(&encode_close(code, reason)));
    }
}

/// Long-lived carrier: writes one framed unit per flush until its byte
/// budget is exhausted.
pub struct StreamSender {
    id: Uuid,
    framing: StreamFraming,
    tx: mpsc::UnboundedSender<Bytes>,
    bytes_sent: usize,
    limit: usize,
}

impl StreamSender {
    fn send(&mut self, messages: &[String]) -> SendOutcome {
        let chunk = self.framing.wrap(&encode_array(messages));
        let len = chunk.len();
        if self.tx.send(chunk).is_err() {
            return SendOutcome::Disconnected;
        }
        self.bytes_sent += len;
        if self.bytes_sent >= self.limit {
            SendOutcome::LimitReached
        } else {
            SendOutcome::Sent
        }
    }

    fn send_close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(self.framing.wrap(&encode_close(code, reason)));
    }
}

/// The carrier attached to a session. A closed set: one variant per
/// connection-lifetime policy.
pub enum Sender {
    Poll(PollSender),
    Stream(StreamSender),
}

impl Sender {
    /// Build a polling carrier plus the channel its single chunk arrives on.
    pub fn poll(framing: PollFraming) -> (Sender, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Sender::Poll(PollSender {
                id: Uuid::new_v4(),
                framing,
                tx,
            }),
            rx,
        )
    }

    /// Build a streaming carrier plus the channel feeding the response body.
    pub fn stream(framing: StreamFraming, limit: usize) -> (Sender, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Sender::Stream(StreamSender {
                id: Uuid::new_v4(),
                framing,
                tx,
                bytes_sent: 0,
                limit,
            }),
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        match self {
            Sender::Poll(s) => s.id,
            Sender::Stream(s) => s.id,
        }
    }

    fn send_close(&self, code: u16, reason: &str) {
        match self {
            Sender::Poll(s) => s.send_close(code, reason),
            Sender::Stream(s) => s.send_close(code, reason),
        }
    }
}

struct SessionState {
    queue: VecDeque<String>,
    sender: Option<Sender>,
    closed_at: Option<Instant>,
    last_active: Instant,
    last_send: Option<Instant>,
}

/// The logical, transport-independent identity of a connected client.
pub struct Session {
    id: String,
    ctx: SecurityContext,
    created: Instant,
    timeout: Duration,
    state: Mutex<SessionState>,
    events: Arc<EventRegistry>,
    registry: Weak<SessionRegistry>,
}

impl Session {
    pub(crate) fn new(
        id: impl Into<String>,
        ctx: SecurityContext,
        timeout: Duration,
        events: Arc<EventRegistry>,
        registry: Weak<SessionRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            ctx,
            created: Instant::now(),
            timeout,
            state: Mutex::new(SessionState {
                queue: VecDeque::new(),
                sender: None,
                closed_at: None,
                last_active: Instant::now(),
                last_send: None,
            }),
            events,
            registry,
        })
    }

    /// A session not tracked by any registry.
    pub(crate) fn detached(
        id: impl Into<String>,
        ctx: SecurityContext,
        timeout: Duration,
        events: Arc<EventRegistry>,
    ) -> Arc<Self> {
        Self::new(id, ctx, timeout, events, Weak::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn security_context(&self) -> &SecurityContext {
        &self.ctx
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().closed_at.is_none()
    }

    /// Mark request activity on this session.
    pub fn touch(&self) {
        self.state.lock().last_active = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_active.elapsed()
    }

    /// Whether the session has been inactive beyond its threshold.
    pub fn is_stale(&self) -> bool {
        self.idle_for() > self.timeout
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Append an outgoing payload and flush to the attached carrier, if any.
    /// Never blocks, never fails.
    pub fn enqueue(self: &Arc<Self>, payload: impl Into<String>) {
        let closed = {
            let mut st = self.state.lock();
            if st.closed_at.is_some() {
                return;
            }
            st.queue.push_back(payload.into());
            st.last_active = Instant::now();
            self.flush_locked(&mut st)
        };
        if closed {
            self.finish_close();
        }
    }

    /// Attach a carrier. Succeeds only when the slot is free; the new carrier
    /// immediately drains whatever is queued.
    pub fn attach(self: &Arc<Self>, sender: Sender) -> Result<(), SessionError> {
        let closed = {
            let mut st = self.state.lock();
            if st.closed_at.is_some() {
                return Err(SessionError::Closed(self.id.clone()));
            }
            if st.sender.is_some() {
                return Err(SessionError::SenderAlreadyAttached(self.id.clone()));
            }
            st.sender = Some(sender);
            st.last_active = Instant::now();
            self.flush_locked(&mut st)
        };
        if closed {
            self.finish_close();
        }
        Ok(())
    }

    /// Release the carrier identified by `id`. A stale carrier finishing
    /// late must not evict its successor, hence the id check.
    pub fn detach(&self, id: Uuid) {
        let mut st = self.state.lock();
        if st.sender.as_ref().is_some_and(|s| s.id() == id) {
            st.sender = None;
        }
    }

    /// Close the session: terminal. The queue is discarded and an attached
    /// carrier is told to go away.
    pub fn close(self: &Arc<Self>) {
        let did_close = {
            let mut st = self.state.lock();
            self.close_locked(&mut st)
        };
        if did_close {
            self.finish_close();
        }
    }

    /// Drain the queue into the attached carrier. Returns `true` when the
    /// staleness check closed the session instead.
    fn flush_locked(&self, st: &mut SessionState) -> bool {
        if st.closed_at.is_some() {
            return false;
        }
        // a carrier that has not managed a successful send within the
        // threshold is presumed dead
        if let Some(last) = st.last_send {
            if last.elapsed() > self.timeout {
                debug!(session = %self.id, "stale on flush, closing");
                return self.close_locked(st);
            }
        }

        let Some(sender) = st.sender.as_mut() else {
            return false;
        };

        match sender {
            Sender::Poll(poll) => {
                let messages: Vec<String> = st.queue.drain(..).collect();
                // an empty queue still produces an empty array frame; a poll
                // never waits for a future message
                poll.send(&messages);
                st.last_send = Some(Instant::now());
                // single send done, the poll carrier releases itself
                st.sender = None;
            }
            Sender::Stream(stream) => {
                if st.queue.is_empty() {
                    return false;
                }
                let messages: Vec<String> = st.queue.drain(..).collect();
                let outcome = stream.send(&messages);
                st.last_send = Some(Instant::now());
                match outcome {
                    SendOutcome::Sent => {}
                    SendOutcome::LimitReached => {
                        debug!(session = %self.id, "streaming byte limit reached, releasing carrier");
                        st.sender = None;
                    }
                    SendOutcome::Disconnected => {
                        st.sender = None;
                    }
                }
            }
        }
        false
    }

    /// Returns `true` when this call performed the close.
    fn close_locked(&self, st: &mut SessionState) -> bool {
        if st.closed_at.is_some() {
            return false;
        }
        st.closed_at = Some(Instant::now());
        st.queue.clear();
        if let Some(sender) = st.sender.take() {
            sender.send_close(CLOSE_GO_AWAY.0, CLOSE_GO_AWAY.1);
        }
        true
    }

    /// Post-close bookkeeping, outside the state lock.
    fn finish_close(self: &Arc<Self>) {
        debug!(session = %self.id, "session closed");
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self);
        }
        self.events.dispatch(EventKind::Closed, self);
    }
}
