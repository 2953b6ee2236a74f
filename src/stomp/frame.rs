//! Frame model, builder, parser and serializer.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

use bytes::Bytes;

use crate::stomp::{headers, Command, FrameError};

/// Counter feeding derived `message-id` headers. Process-wide so ids are
/// monotonic across sessions.
static MESSAGE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

static HEART_BEAT: LazyLock<Frame> = LazyLock::new(|| Frame {
    command: Command::Heartbeat,
    headers: Headers::new(),
    body: None,
});

const NULL: char = '\u{0}';
const LINE_FEED: char = '\n';

/// An ordered, case-insensitive, multi-valued header map.
///
/// Keys keep the casing they were first inserted with; lookups ignore ASCII
/// case. Insertion order is preserved for serialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(key))
    }

    /// Replace any existing values for `key` with the single `value`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(i) => self.entries[i].1 = vec![value],
            None => self.entries.push((key, vec![value])),
        }
    }

    /// Add `value` to the values for `key`, keeping the first-seen casing.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.position(&key) {
            Some(i) => self.entries[i].1.push(value),
            None => self.entries.push((key, vec![value])),
        }
    }

    /// First value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.position(key)
            .and_then(|i| self.entries[i].1.first())
            .map(String::as_str)
    }

    /// All values for `key`; empty when absent.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.position(key).map(|i| self.entries[i].1.as_slice()).unwrap_or(&[])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One STOMP protocol unit: command, headers, optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: Command,
    headers: Headers,
    body: Option<Bytes>,
}

impl Frame {
    /// Internal constructor; the public path is [`Builder::build`] so that
    /// derivation and verification always run.
    pub(crate) fn from_parts(command: Command, headers: Headers, body: Option<Bytes>) -> Self {
        Self {
            command,
            headers,
            body,
        }
    }

    /// The shared bare line-feed keep-alive frame.
    pub fn heart_beat() -> &'static Frame {
        &HEART_BEAT
    }

    pub fn is_heartbeat(&self) -> bool {
        self.command == Command::Heartbeat
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.headers.get(headers::DESTINATION)
    }

    /// The subscription identifier. MESSAGE frames carry it in
    /// `subscription`, every other command in `id`.
    pub fn subscription(&self) -> Option<&str> {
        if self.command == Command::Message {
            self.headers.get(headers::SUBSCRIPTION)
        } else {
            self.headers.get(headers::ID)
        }
    }

    pub fn transaction(&self) -> Option<&str> {
        self.headers.get(headers::TRANSACTION)
    }

    pub fn session(&self) -> Option<&str> {
        self.headers.get(headers::SESSION)
    }

    pub fn receipt(&self) -> Option<&str> {
        self.headers.get(headers::RECEIPT)
    }

    pub fn receipt_id(&self) -> Option<&str> {
        self.headers.get(headers::RECEIPT_ID)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(headers::CONTENT_TYPE)
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers.get(headers::CONTENT_LENGTH).and_then(|v| v.parse().ok())
    }

    /// Parse a frame off the wire.
    ///
    /// The first line is the command (empty line means heartbeat). Header
    /// lines split on the first `:` and accumulate until a blank or bare-NUL
    /// line. Whatever follows, up to the terminating NUL, is the body; an
    /// empty body becomes `None`.
    pub fn parse(input: &str) -> Result<Frame, FrameError> {
        let mut rest = input;

        let first = next_line(&mut rest);
        if first.is_empty() {
            return Ok(Frame::heart_beat().clone());
        }

        let command: Command = first.parse()?;

        let mut headers = Headers::new();
        loop {
            let line = next_line(&mut rest);
            if line.is_empty() || line == "\u{0}" {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
            headers.append(key, value);
        }

        let body = match rest.rfind(NULL) {
            Some(i) => &rest[..i],
            None => rest,
        };
        let body = if body.is_empty() {
            None
        } else {
            Some(Bytes::copy_from_slice(body.as_bytes()))
        };

        Ok(Frame::from_parts(command, headers, body))
    }

    /// Serialize to the wire form.
    ///
    /// Multi-valued headers are joined with `,` onto one line, so a value
    /// containing a literal comma will not round-trip back into distinct
    /// values. Known lossy; kept.
    pub fn to_wire(&self) -> String {
        if self.is_heartbeat() {
            return LINE_FEED.to_string();
        }

        let mut out = String::new();
        out.push_str(self.command.as_str());
        out.push(LINE_FEED);
        for (key, values) in self.headers.iter() {
            out.push_str(key);
            out.push(':');
            out.push_str(&values.join(","));
            out.push(LINE_FEED);
        }
        out.push(LINE_FEED);
        if let Some(body) = &self.body {
            out.push_str(&String::from_utf8_lossy(body));
        }
        out.push(NULL);
        out
    }

    pub fn builder(command: Command) -> Builder {
        Builder::new(command)
    }

    pub fn connect(host: &str, accept_versions: &[&str]) -> Builder {
        Builder::new(Command::Connect)
            .header(headers::HOST, host)
            .header_values(headers::ACCEPT_VERSION, accept_versions)
    }

    pub fn connected(version: &str, session: &str) -> Builder {
        Builder::new(Command::Connected)
            .header(headers::VERSION, version)
            .header(headers::SESSION, session)
    }

    pub fn send(destination: &str, body: impl Into<Bytes>) -> Builder {
        Builder::new(Command::Send).destination(destination).body(body)
    }

    pub fn message(destination: &str, subscription: &str, body: impl Into<Bytes>) -> Builder {
        Builder::new(Command::Message)
            .destination(destination)
            .subscription(subscription)
            .body(body)
    }

    pub fn subscribe(id: &str, destination: &str) -> Builder {
        Builder::new(Command::Subscribe).subscription(id).destination(destination)
    }

    pub fn receipt_for(receipt_id: &str) -> Builder {
        Builder::new(Command::Receipt).header(headers::RECEIPT_ID, receipt_id)
    }

    pub fn error() -> Builder {
        Builder::new(Command::Error)
    }

    pub fn disconnect() -> Builder {
        Builder::new(Command::Disconnect)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

/// Consume one line (up to `\n`, tolerating `\r\n`) from `rest`.
fn next_line<'a>(rest: &mut &'a str) -> &'a str {
    let line = match rest.find(LINE_FEED) {
        Some(i) => {
            let line = &rest[..i];
            *rest = &rest[i + 1..];
            line
        }
        None => {
            let line = *rest;
            *rest = "";
            line
        }
    };
    line.strip_suffix('\r').unwrap_or(line)
}

/// Mutable accumulator for a [`Frame`].
///
/// `build()` first derives omitted-but-inferable headers, then verifies the
/// mandatory ones for the command.
#[derive(Debug, Clone)]
pub struct Builder {
    command: Command,
    headers: Headers,
    body: Option<Bytes>,
}

impl Builder {
    fn new(command: Command) -> Self {
        Self {
            command,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Copy an existing frame into a builder for modification.
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            command: frame.command,
            headers: frame.headers.clone(),
            body: frame.body.clone(),
        }
    }

    /// Set a single-valued header, replacing any existing values.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(key, value);
        self
    }

    /// Set a header from several values, joined with `,` onto one line.
    pub fn header_values(mut self, key: impl Into<String>, values: &[&str]) -> Self {
        self.headers.set(key, values.join(","));
        self
    }

    pub fn destination(self, destination: impl Into<String>) -> Self {
        self.header(headers::DESTINATION, destination)
    }

    /// Set the subscription identifier: `subscription` for MESSAGE frames,
    /// `id` for everything else.
    pub fn subscription(self, id: impl Into<String>) -> Self {
        if self.command == Command::Message {
            self.header(headers::SUBSCRIPTION, id)
        } else {
            self.header(headers::ID, id)
        }
    }

    pub fn message_id(self, id: impl Into<String>) -> Self {
        self.header(headers::MESSAGE_ID, id)
    }

    pub fn session(self, session: impl Into<String>) -> Self {
        self.header(headers::SESSION, session)
    }

    pub fn transaction(self, transaction: impl Into<String>) -> Self {
        self.header(headers::TRANSACTION, transaction)
    }

    pub fn receipt(self, receipt: impl Into<String>) -> Self {
        self.header(headers::RECEIPT, receipt)
    }

    pub fn content_type(self, content_type: impl Into<String>) -> Self {
        self.header(headers::CONTENT_TYPE, content_type)
    }

    pub fn heart_beat(self, outgoing: u32, incoming: u32) -> Self {
        self.header(headers::HEART_BEAT, format!("{outgoing},{incoming}"))
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Derive, verify and freeze into a [`Frame`].
    pub fn build(mut self) -> Result<Frame, FrameError> {
        self.check_capabilities()?;
        self.derive();
        self.verify()?;
        Ok(Frame {
            command: self.command,
            headers: self.headers,
            body: self.body,
        })
    }

    fn check_capabilities(&self) -> Result<(), FrameError> {
        if self.headers.contains(headers::DESTINATION) && !self.command.accepts_destination() {
            return Err(FrameError::HeaderNotAccepted {
                command: self.command,
                header: headers::DESTINATION,
            });
        }
        if self.body.is_some() && !self.command.accepts_body() {
            return Err(FrameError::BodyNotAccepted(self.command));
        }
        Ok(())
    }

    /// Fill headers derivable from others: a MESSAGE frame without a
    /// `message-id` gets one off the process counter, prefixed by the
    /// `session` header when present.
    fn derive(&mut self) {
        if self.command == Command::Message && !self.headers.contains(headers::MESSAGE_ID) {
            let n = MESSAGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
            let id = match self.headers.get(headers::SESSION) {
                Some(session) => format!("{session}-{n}"),
                None => n.to_string(),
            };
            self.headers.set(headers::MESSAGE_ID, id);
        }
    }

    /// Check the mandatory headers for the command.
    fn verify(&self) -> Result<(), FrameError> {
        use Command::*;

        match self.command {
            Connect | Stomp => {
                self.assert_exists(headers::ACCEPT_VERSION)?;
                self.assert_exists(headers::HOST)
            }
            Connected => self.assert_exists(headers::VERSION),
            Send => self.assert_exists(headers::DESTINATION),
            Message => {
                self.assert_exists(headers::DESTINATION)?;
                self.assert_exists(headers::MESSAGE_ID)?;
                self.assert_exists(headers::SUBSCRIPTION)
            }
            Subscribe => {
                self.assert_exists(headers::DESTINATION)?;
                self.assert_exists(headers::ID)
            }
            Unsubscribe | Ack | Nack => self.assert_exists(headers::ID),
            Begin | Commit | Abort => self.assert_exists(headers::TRANSACTION),
            Receipt => self.assert_exists(headers::RECEIPT_ID),
            Disconnect | Error | Heartbeat => Ok(()),
        }
    }

    fn assert_exists(&self, header: &'static str) -> Result<(), FrameError> {
        if self.headers.contains(header) {
            Ok(())
        } else {
            Err(FrameError::MissingHeader {
                command: self.command,
                header,
            })
        }
    }
}
