//! SockJS HTTP transports
//!
//! One handler per fallback transport, sharing the session/queue model:
//! `xhr` and `jsonp` poll, `xhr_send` and `jsonp_send` carry inbound frames,
//! `xhr_streaming`, `eventsource` and `htmlfile` stream. Every session
//! response carries CORS and no-cache headers; `OPTIONS` preflights and the
//! static `/info`, iframe and greeting endpoints round out the surface.

use std::collections::HashMap;
use std::convert::Infallible;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::security::{SecurityContext, SecurityRegistry};
use crate::server::inbound::process_payload;
use crate::server::registry::SessionRegistry;
use crate::server::relay::Relay;
use crate::server::session::{
    encode_close, PollFraming, Sender, Session, SessionError, StreamFraming,
    CLOSE_ANOTHER_CONNECTION, CLOSE_GO_AWAY, HEARTBEAT_FRAME, OPEN_FRAME,
};
use crate::server::websocket;
use crate::server::ServerConfig;

const CONTENT_TYPE_JAVASCRIPT: &str = "application/javascript; charset=UTF-8";
const CONTENT_TYPE_PLAIN: &str = "text/plain; charset=UTF-8";
const CONTENT_TYPE_HTML: &str = "text/html; charset=UTF-8";
const CONTENT_TYPE_EVENT_STREAM: &str = "text/event-stream; charset=UTF-8";

/// Derives the caller identity from a request. Authentication itself is an
/// external concern; the default treats every caller as anonymous.
pub type Authenticator = dyn Fn(&HeaderMap) -> SecurityContext + Send + Sync;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub relay: Arc<Relay>,
    pub security: Arc<SecurityRegistry>,
    pub config: Arc<ServerConfig>,
    pub authenticator: Arc<Authenticator>,
}

impl AppState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        relay: Arc<Relay>,
        security: Arc<SecurityRegistry>,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            registry,
            relay,
            security,
            config,
            authenticator: Arc::new(|_: &HeaderMap| SecurityContext::anonymous()),
        }
    }

    pub fn with_authenticator(
        mut self,
        authenticator: impl Fn(&HeaderMap) -> SecurityContext + Send + Sync + 'static,
    ) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }
}

/// Assemble the transport surface under `/{server}/{session}/{transport}`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(greeting))
        .route("/info", get(info).options(options_get))
        .route("/{file}", get(iframe))
        .route("/{server}/{session}/xhr", post(xhr_poll).options(options_post))
        .route("/{server}/{session}/xhr_send", post(xhr_send).options(options_post))
        .route(
            "/{server}/{session}/xhr_streaming",
            post(xhr_streaming).options(options_post),
        )
        .route(
            "/{server}/{session}/eventsource",
            get(eventsource).options(options_get),
        )
        .route("/{server}/{session}/htmlfile", get(htmlfile).options(options_get))
        .route("/{server}/{session}/jsonp", get(jsonp_poll).options(options_get))
        .route(
            "/{server}/{session}/jsonp_send",
            post(jsonp_send).options(options_post),
        )
        .route("/{server}/{session}/websocket", get(websocket::upgrade))
        .with_state(state)
}

// --- response header helpers ---

fn cors_headers(req: &HeaderMap) -> HeaderMap {
    let mut h = HeaderMap::new();
    let origin = req
        .get(header::ORIGIN)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    h.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    h.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    if let Some(requested) = req.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
        if !requested.is_empty() {
            h.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
    }
    h
}

fn no_cache(h: &mut HeaderMap) {
    h.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"),
    );
}

fn long_cache(h: &mut HeaderMap) {
    h.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000"),
    );
    let expires = (Utc::now() + chrono::Duration::days(365))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&expires) {
        h.insert(header::EXPIRES, value);
    }
}

fn content_type(h: &mut HeaderMap, value: &'static str) {
    h.insert(header::CONTENT_TYPE, HeaderValue::from_static(value));
}

fn session_headers(req: &HeaderMap, media_type: &'static str) -> HeaderMap {
    let mut h = cors_headers(req);
    no_cache(&mut h);
    content_type(&mut h, media_type);
    h
}

fn preflight(req: &HeaderMap, methods: &'static str) -> Response {
    let mut h = cors_headers(req);
    long_cache(&mut h);
    h.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static("1000001"),
    );
    if let Ok(value) = HeaderValue::from_str(methods) {
        h.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
    }
    (StatusCode::NO_CONTENT, h).into_response()
}

async fn options_post(headers: HeaderMap) -> Response {
    preflight(&headers, "OPTIONS, POST")
}

async fn options_get(headers: HeaderMap) -> Response {
    preflight(&headers, "OPTIONS, GET")
}

// --- static endpoints ---

async fn greeting() -> Response {
    let mut h = HeaderMap::new();
    content_type(&mut h, CONTENT_TYPE_PLAIN);
    (StatusCode::OK, h, "Welcome to SockJS!\n").into_response()
}

/// Capability discovery document served at `/info`.
#[derive(Debug, Serialize)]
struct Info {
    websocket: bool,
    cookie_needed: bool,
    origins: [&'static str; 1],
    entropy: u32,
}

async fn info(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let h = session_headers(&headers, "application/json; charset=UTF-8");
    let info = Info {
        websocket: state.config.websocket_enabled,
        cookie_needed: false,
        origins: ["*:*"],
        entropy: rand::thread_rng().gen(),
    };
    let body = serde_json::to_string(&info).unwrap_or_default();
    (StatusCode::OK, h, body).into_response()
}

fn iframe_document(sockjs_url: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <meta http-equiv="X-UA-Compatible" content="IE=edge" />
  <meta http-equiv="Content-Type" content="text/html; charset=UTF-8" />
  <script src="{sockjs_url}"></script>
  <script>
    document.domain = document.domain;
    SockJS.bootstrap_iframe();
  </script>
</head>
<body>
  <h2>Don't panic!</h2>
  <p>This is a SockJS hidden iframe. It's used for cross domain magic.</p>
</body>
</html>
"#
    )
}

async fn iframe(
    State(state): State<AppState>,
    Path(file): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !file.starts_with("iframe") || !file.ends_with(".html") {
        return StatusCode::NOT_FOUND.into_response();
    }

    let doc = iframe_document(&state.config.sockjs_url);
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    doc.hash(&mut hasher);
    let etag = format!("\"{:016x}\"", hasher.finish());

    let mut h = HeaderMap::new();
    long_cache(&mut h);
    if let Ok(value) = HeaderValue::from_str(&etag) {
        h.insert(header::ETAG, value);
    }

    let matched = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == etag);
    if matched {
        return (StatusCode::NOT_MODIFIED, h).into_response();
    }

    content_type(&mut h, CONTENT_TYPE_HTML);
    (StatusCode::OK, h, doc).into_response()
}

// --- polling transports ---

fn resolve_session(
    state: &AppState,
    session_id: &str,
    headers: &HeaderMap,
) -> (Arc<Session>, bool) {
    let ctx = (state.authenticator)(headers);
    state.registry.get_or_create(session_id, ctx)
}

async fn poll_common(
    state: AppState,
    session_id: String,
    headers: HeaderMap,
    framing: PollFraming,
) -> Response {
    let h = session_headers(&headers, CONTENT_TYPE_JAVASCRIPT);
    let (session, created) = resolve_session(&state, &session_id, &headers);
    session.touch();

    if created {
        debug!(session = %session_id, "polling carrier opened session");
        return (StatusCode::OK, h, Body::from(framing.wrap(OPEN_FRAME))).into_response();
    }
    if !session.is_open() {
        let chunk = framing.wrap(&encode_close(CLOSE_GO_AWAY.0, CLOSE_GO_AWAY.1));
        return (StatusCode::OK, h, Body::from(chunk)).into_response();
    }

    let (sender, mut rx) = Sender::poll(framing.clone());
    match session.attach(sender) {
        Ok(()) => {
            // the attach already drained synchronously; the single chunk is
            // waiting in the channel
            let chunk = rx.recv().await.unwrap_or_default();
            (StatusCode::OK, h, Body::from(chunk)).into_response()
        }
        Err(SessionError::SenderAlreadyAttached(_)) => {
            let chunk = framing.wrap(&encode_close(
                CLOSE_ANOTHER_CONNECTION.0,
                CLOSE_ANOTHER_CONNECTION.1,
            ));
            (StatusCode::OK, h, Body::from(chunk)).into_response()
        }
        Err(_) => {
            let chunk = framing.wrap(&encode_close(CLOSE_GO_AWAY.0, CLOSE_GO_AWAY.1));
            (StatusCode::OK, h, Body::from(chunk)).into_response()
        }
    }
}

async fn xhr_poll(
    State(state): State<AppState>,
    Path((_server, session_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    poll_common(state, session_id, headers, PollFraming::Xhr).await
}

fn callback_param(query: &HashMap<String, String>) -> Option<&String> {
    query.get("c").or_else(|| query.get("callback"))
}

fn valid_callback(callback: &str) -> bool {
    !callback.is_empty()
        && callback
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

async fn jsonp_poll(
    State(state): State<AppState>,
    Path((_server, session_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let Some(callback) = callback_param(&query) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "\"callback\" parameter required")
            .into_response();
    };
    if !valid_callback(callback) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "invalid \"callback\" parameter")
            .into_response();
    }
    let framing = PollFraming::Jsonp {
        callback: callback.clone(),
    };
    poll_common(state, session_id, headers, framing).await
}

// --- send transports ---

async fn xhr_send(
    State(state): State<AppState>,
    Path((_server, session_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let h = session_headers(&headers, CONTENT_TYPE_PLAIN);
    let Some(session) = state.registry.get(&session_id) else {
        return (StatusCode::NOT_FOUND, h).into_response();
    };
    if !session.is_open() {
        return (StatusCode::NOT_FOUND, h).into_response();
    }
    session.touch();

    match process_payload(&state.security, &state.relay, &session, &body).await {
        Ok(()) => (StatusCode::NO_CONTENT, h).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, h, e.to_string()).into_response(),
    }
}

async fn jsonp_send(
    State(state): State<AppState>,
    Path((_server, session_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let h = session_headers(&headers, CONTENT_TYPE_PLAIN);
    let Some(session) = state.registry.get(&session_id) else {
        return (StatusCode::NOT_FOUND, h).into_response();
    };
    if !session.is_open() {
        return (StatusCode::NOT_FOUND, h).into_response();
    }
    session.touch();

    // script-injection sends arrive either form-encoded under `d` or raw
    let payload = if headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"))
    {
        match serde_urlencoded::from_str::<HashMap<String, String>>(&body) {
            Ok(mut form) => form.remove("d").unwrap_or_default(),
            Err(_) => String::new(),
        }
    } else {
        body
    };

    match process_payload(&state.security, &state.relay, &session, &payload).await {
        Ok(()) => (StatusCode::OK, h, "ok").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, h, e.to_string()).into_response(),
    }
}

// --- streaming transports ---

/// Guard releasing the carrier when the response body is dropped, whether by
/// deadline, client disconnect or stream end.
struct DetachGuard {
    session: Arc<Session>,
    id: Uuid,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        self.session.detach(self.id);
    }
}

/// Body chunks from `intro`, then live chunks from the carrier channel, with
/// heartbeats on idle and an overall request deadline.
fn streaming_body(
    intro: Vec<Bytes>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    guard: DetachGuard,
    framing: StreamFraming,
    heartbeat: Duration,
    timeout: Duration,
) -> Body {
    let deadline = tokio::time::Instant::now() + timeout;
    let intro = futures::stream::iter(intro.into_iter().map(Ok::<_, Infallible>));
    let live = futures::stream::unfold((rx, guard), move |(mut rx, guard)| async move {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return None;
        }
        let wait = heartbeat.min(deadline - now);
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(chunk)) => Some((Ok(chunk), (rx, guard))),
            // carrier gone: session closed or released us
            Ok(None) => None,
            Err(_) => {
                if tokio::time::Instant::now() >= deadline {
                    return None;
                }
                guard.session.touch();
                Some((Ok(framing.wrap(HEARTBEAT_FRAME)), (rx, guard)))
            }
        }
    });
    Body::from_stream(intro.chain(live))
}

fn finite_body(chunks: Vec<Bytes>) -> Body {
    Body::from_stream(futures::stream::iter(
        chunks.into_iter().map(Ok::<_, Infallible>),
    ))
}

async fn stream_common(
    state: AppState,
    session_id: String,
    headers: HeaderMap,
    framing: StreamFraming,
    mut intro: Vec<Bytes>,
    media_type: &'static str,
) -> Response {
    let h = session_headers(&headers, media_type);
    let (session, created) = resolve_session(&state, &session_id, &headers);
    session.touch();

    if !session.is_open() {
        intro.push(framing.wrap(&encode_close(CLOSE_GO_AWAY.0, CLOSE_GO_AWAY.1)));
        return (StatusCode::OK, h, finite_body(intro)).into_response();
    }
    if created {
        debug!(session = %session_id, "streaming carrier opened session");
        intro.push(framing.wrap(OPEN_FRAME));
    }

    let (sender, rx) = Sender::stream(framing, state.config.response_limit);
    let sender_id = sender.id();
    match session.attach(sender) {
        Ok(()) => {
            let guard = DetachGuard {
                session,
                id: sender_id,
            };
            let body = streaming_body(
                intro,
                rx,
                guard,
                framing,
                state.config.heartbeat_interval,
                state.config.request_timeout,
            );
            (StatusCode::OK, h, body).into_response()
        }
        Err(SessionError::SenderAlreadyAttached(_)) => {
            intro.push(framing.wrap(&encode_close(
                CLOSE_ANOTHER_CONNECTION.0,
                CLOSE_ANOTHER_CONNECTION.1,
            )));
            (StatusCode::OK, h, finite_body(intro)).into_response()
        }
        Err(_) => {
            intro.push(framing.wrap(&encode_close(CLOSE_GO_AWAY.0, CLOSE_GO_AWAY.1)));
            (StatusCode::OK, h, finite_body(intro)).into_response()
        }
    }
}

async fn xhr_streaming(
    State(state): State<AppState>,
    Path((_server, session_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    // 2KiB prelude defeats buffering in intermediaries before the first
    // real frame arrives
    let prelude = Bytes::from(format!("{}\n", "h".repeat(2048)));
    stream_common(
        state,
        session_id,
        headers,
        StreamFraming::Xhr,
        vec![prelude],
        CONTENT_TYPE_JAVASCRIPT,
    )
    .await
}

async fn eventsource(
    State(state): State<AppState>,
    Path((_server, session_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    stream_common(
        state,
        session_id,
        headers,
        StreamFraming::EventSource,
        vec![Bytes::from_static(b"\r\n")],
        CONTENT_TYPE_EVENT_STREAM,
    )
    .await
}

fn htmlfile_prelude(callback: &str) -> Bytes {
    let mut doc = format!(
        r#"<!doctype html>
<html><head>
  <meta http-equiv="X-UA-Compatible" content="IE=edge" />
  <meta http-equiv="Content-Type" content="text/html; charset=UTF-8" />
</head><body><h2>Don't panic!</h2>
  <script>
    document.domain = document.domain;
    var c = parent.{callback};
    c.start();
    function p(d) {{c.message(d);}};
    window.onload = function() {{c.stop();}};
  </script>
"#
    );
    // pad so browsers start interpreting the document immediately
    while doc.len() < 1024 {
        doc.push(' ');
    }
    doc.push_str("\r\n");
    Bytes::from(doc)
}

async fn htmlfile(
    State(state): State<AppState>,
    Path((_server, session_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let Some(callback) = callback_param(&query) else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "\"callback\" parameter required")
            .into_response();
    };
    if !valid_callback(callback) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "invalid \"callback\" parameter")
            .into_response();
    }
    let prelude = htmlfile_prelude(callback);
    stream_common(
        state,
        session_id,
        headers,
        StreamFraming::HtmlFile,
        vec![prelude],
        CONTENT_TYPE_HTML,
    )
    .await
}
