//! Integration tests for the stompbus transport surface
//!
//! Drives the axum router directly with `tower::ServiceExt::oneshot`,
//! covering the SockJS envelope behavior, the inbound STOMP pipeline and
//! the security gate end to end against the in-process broker.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use stompbus::security::{SecurityContext, SecurityRegistry};
use stompbus::server::{
    build_router, AppState, EventRegistry, LocalBroker, Relay, ServerConfig, SessionRegistry,
};
use stompbus::stomp::{Command, Frame};
use tower::ServiceExt;

fn app() -> Router {
    app_with(SecurityRegistry::new())
}

fn app_with(security: SecurityRegistry) -> Router {
    let config = Arc::new(ServerConfig::default());
    let events = Arc::new(EventRegistry::new());
    let registry = SessionRegistry::new(events, config.session_timeout, config.grace_period);
    let relay = Relay::new(Arc::new(LocalBroker::new()));
    relay.register_teardown(registry.events());

    let state = AppState::new(registry, relay, Arc::new(security), config)
        .with_authenticator(|headers: &axum::http::HeaderMap| {
            // tests drive identity through plain headers
            match headers.get("x-test-user").and_then(|v| v.to_str().ok()) {
                Some(user) => {
                    let roles = headers
                        .get("x-test-roles")
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.split(',').map(str::to_string).collect::<Vec<_>>())
                        .unwrap_or_default();
                    SecurityContext::principal(user).with_roles(roles)
                }
                None => SecurityContext::anonymous(),
            }
        });
    build_router(state)
}

async fn get(app: &Router, path: &str) -> axum::response::Response {
    let req = Request::builder().uri(path).body(Body::empty()).unwrap();
    app.clone().oneshot(req).await.expect("request")
}

async fn post(app: &Router, path: &str, body: &str) -> axum::response::Response {
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .body(Body::from(body.to_string()))
        .unwrap();
    app.clone().oneshot(req).await.expect("request")
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn next_chunk(body: &mut Body) -> String {
    let frame = body.frame().await.expect("stream ended").expect("chunk");
    let data = frame.into_data().expect("data frame");
    String::from_utf8_lossy(&data).into_owned()
}

fn frames_payload(frames: &[Frame]) -> String {
    let wires: Vec<String> = frames.iter().map(Frame::to_wire).collect();
    serde_json::to_string(&wires).unwrap()
}

fn connect_frame() -> Frame {
    Frame::connect("localhost", &["1.2"]).build().unwrap()
}

async fn settle() {
    // let the relay pump feed the session queue
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_greeting() {
    let app = app();
    let response = get(&app, "/").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "Welcome to SockJS!\n");
}

#[tokio::test]
async fn test_info() {
    let app = app();
    let req = Request::builder()
        .uri("/info")
        .header(header::ORIGIN, "https://example.com")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "https://example.com"
    );
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-store, no-cache, must-revalidate, max-age=0"
    );

    let info: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(info["websocket"], true);
    assert_eq!(info["cookie_needed"], false);
    assert_eq!(info["origins"][0], "*:*");
    assert!(info["entropy"].is_number());
}

#[tokio::test]
async fn test_iframe_caching() {
    let app = app();
    let response = get(&app, "/iframe.html").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "public, max-age=31536000"
    );
    assert!(response.headers().contains_key(header::EXPIRES));
    let etag = response.headers().get(header::ETAG).unwrap().clone();
    assert!(body_string(response).await.contains("SockJS.bootstrap_iframe()"));

    // versioned names serve the same document
    let response = get(&app, "/iframe-1.5.0.html").await;
    assert_eq!(response.status(), StatusCode::OK);

    // conditional request hits the cache
    let req = Request::builder()
        .uri("/iframe.html")
        .header(header::IF_NONE_MATCH, etag)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

    let response = get(&app, "/other.html").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_options_preflight() {
    let app = app();
    let req = Request::builder()
        .method("OPTIONS")
        .uri("/srv/s1/xhr")
        .header(header::ORIGIN, "https://example.com")
        .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let headers = response.headers();
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_METHODS).unwrap(),
        "OPTIONS, POST"
    );
    assert_eq!(
        headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "https://example.com"
    );
    assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(), "true");
    assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(), "content-type");
    assert_eq!(headers.get(header::CACHE_CONTROL).unwrap(), "public, max-age=31536000");
}

#[tokio::test]
async fn test_xhr_open_then_empty_poll() {
    let app = app();
    let response = post(&app, "/srv/s1/xhr", "").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "o\n");

    // an empty queue polls an empty array immediately, no blocking
    let response = post(&app, "/srv/s1/xhr", "").await;
    assert_eq!(body_string(response).await, "a[]\n");
}

#[tokio::test]
async fn test_stomp_conversation_over_xhr() {
    let app = app();

    // subscriber session
    assert_eq!(body_string(post(&app, "/srv/sub/xhr", "").await).await, "o\n");
    let payload = frames_payload(&[
        connect_frame(),
        Frame::subscribe("sub-0", "/queue/greetings").build().unwrap(),
    ]);
    let response = post(&app, "/srv/sub/xhr_send", &payload).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    settle().await;

    let connected = body_string(post(&app, "/srv/sub/xhr", "").await).await;
    assert!(connected.contains("CONNECTED"), "got {connected}");
    assert!(connected.contains("version:1.2"), "got {connected}");

    // publisher session
    assert_eq!(body_string(post(&app, "/srv/pub/xhr", "").await).await, "o\n");
    let payload = frames_payload(&[
        connect_frame(),
        Frame::send("/queue/greetings", "hello there").build().unwrap(),
    ]);
    let response = post(&app, "/srv/pub/xhr_send", &payload).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    settle().await;

    let delivered = body_string(post(&app, "/srv/sub/xhr", "").await).await;
    assert!(delivered.contains("MESSAGE"), "got {delivered}");
    assert!(delivered.contains("destination:/queue/greetings"), "got {delivered}");
    assert!(delivered.contains("subscription:sub-0"), "got {delivered}");
    assert!(delivered.contains("hello there"), "got {delivered}");
}

#[tokio::test]
async fn test_send_to_unknown_session_is_404() {
    let app = app();
    let response = post(&app, "/srv/ghost/xhr_send", "[\"x\"]").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_send_payload_errors() {
    let app = app();
    assert_eq!(body_string(post(&app, "/srv/s1/xhr", "").await).await, "o\n");

    let response = post(&app, "/srv/s1/xhr_send", "").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_string(response).await, "Payload expected.");

    let response = post(&app, "/srv/s1/xhr_send", "[\"unterminated").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_string(response).await, "Broken JSON encoding.");
}

#[tokio::test]
async fn test_malformed_stomp_frame_errors_and_closes() {
    let app = app();
    assert_eq!(body_string(post(&app, "/srv/s1/xhr", "").await).await, "o\n");

    let payload = serde_json::to_string(&vec!["NONSENSE\n\n\u{0}"]).unwrap();
    let response = post(&app, "/srv/s1/xhr_send", &payload).await;
    // payload decoded fine; the frame-level failure closes the session
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = post(&app, "/srv/s1/xhr", "").await;
    assert_eq!(body_string(response).await, "c[3000,\"Go away!\"]\n");
}

#[tokio::test]
async fn test_security_denial_emits_error_frame() {
    let mut security = SecurityRegistry::new();
    security
        .limitation()
        .commands(&[Command::Send])
        .destinations(&["/admin/*"])
        .unwrap()
        .roles(&["admin"])
        .register();
    let app = app_with(security);

    // open the session with the caller's identity
    let req = Request::builder()
        .method("POST")
        .uri("/srv/s1/xhr")
        .header("x-test-user", "caller")
        .body(Body::empty())
        .unwrap();
    assert_eq!(body_string(app.clone().oneshot(req).await.unwrap()).await, "o\n");

    let payload = frames_payload(&[
        connect_frame(),
        Frame::send("/admin/x", "attack").build().unwrap(),
    ]);
    let req = Request::builder()
        .method("POST")
        .uri("/srv/s1/xhr_send")
        .header("x-test-user", "caller")
        .body(Body::from(payload))
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    // a denial is a policy refusal, not an HTTP error
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    settle().await;

    let drained = body_string(post(&app, "/srv/s1/xhr", "").await).await;
    assert!(drained.contains("ERROR"), "got {drained}");
    assert!(drained.contains("SEND denied"), "got {drained}");
    // the session survived the refusal
    assert_eq!(body_string(post(&app, "/srv/s1/xhr", "").await).await, "a[]\n");
}

#[tokio::test]
async fn test_security_permits_role_holder() {
    let mut security = SecurityRegistry::new();
    security
        .limitation()
        .commands(&[Command::Send])
        .destinations(&["/admin/*"])
        .unwrap()
        .roles(&["admin"])
        .register();
    let app = app_with(security);

    let open = Request::builder()
        .method("POST")
        .uri("/srv/root/xhr")
        .header("x-test-user", "root")
        .header("x-test-roles", "admin")
        .body(Body::empty())
        .unwrap();
    assert_eq!(body_string(app.clone().oneshot(open).await.unwrap()).await, "o\n");

    let payload = frames_payload(&[
        connect_frame(),
        Frame::send("/admin/x", "maintenance").build().unwrap(),
    ]);
    let req = Request::builder()
        .method("POST")
        .uri("/srv/root/xhr_send")
        .header("x-test-user", "root")
        .header("x-test-roles", "admin")
        .body(Body::from(payload))
        .unwrap();
    assert_eq!(
        app.clone().oneshot(req).await.unwrap().status(),
        StatusCode::NO_CONTENT
    );
    settle().await;

    let drained = body_string(post(&app, "/srv/root/xhr", "").await).await;
    assert!(!drained.contains("ERROR"), "got {drained}");
}

#[tokio::test]
async fn test_xhr_streaming_prelude_and_exclusivity() {
    let app = app();

    let response = post(&app, "/srv/s1/xhr_streaming", "").await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();

    let prelude = next_chunk(&mut body).await;
    assert_eq!(prelude, format!("{}\n", "h".repeat(2048)));
    assert_eq!(next_chunk(&mut body).await, "o\n");

    // while the stream holds the carrier slot, a poll is turned away
    let response = post(&app, "/srv/s1/xhr", "").await;
    assert_eq!(
        body_string(response).await,
        "c[2010,\"Another connection still open\"]\n"
    );

    // dropping the stream releases the carrier; the next poll drains again
    drop(body);
    settle().await;
    assert_eq!(body_string(post(&app, "/srv/s1/xhr", "").await).await, "a[]\n");
}

#[tokio::test]
async fn test_eventsource_framing() {
    let app = app();
    let response = get(&app, "/srv/s1/eventsource").await;
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream; charset=UTF-8"
    );
    let mut body = response.into_body();
    assert_eq!(next_chunk(&mut body).await, "\r\n");
    assert_eq!(next_chunk(&mut body).await, "data: o\r\n\r\n");
}

#[tokio::test]
async fn test_htmlfile_requires_callback() {
    let app = app();
    let response = get(&app, "/srv/s1/htmlfile").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_string(response).await, "\"callback\" parameter required");

    let response = get(&app, "/srv/s1/htmlfile?c=cb").await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();
    let prelude = next_chunk(&mut body).await;
    assert!(prelude.contains("var c = parent.cb;"));
    assert!(prelude.len() >= 1024);
    assert_eq!(next_chunk(&mut body).await, "<script>\np(\"o\");\n</script>\r\n");
}

#[tokio::test]
async fn test_jsonp_poll_and_send() {
    let app = app();

    let response = get(&app, "/srv/s1/jsonp").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let response = get(&app, "/srv/s1/jsonp?c=cb").await;
    assert_eq!(body_string(response).await, "cb(\"o\");\r\n");

    // form-encoded send
    let payload = frames_payload(&[connect_frame()]);
    let form = serde_urlencoded::to_string([("d", payload.as_str())]).unwrap();
    let req = Request::builder()
        .method("POST")
        .uri("/srv/s1/jsonp_send")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(form))
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "ok");
    settle().await;

    let drained = body_string(get(&app, "/srv/s1/jsonp?c=cb").await).await;
    assert!(drained.contains("CONNECTED"), "got {drained}");
}

#[tokio::test]
async fn test_disconnect_tears_down_session_state() {
    let app = app();
    assert_eq!(body_string(post(&app, "/srv/s1/xhr", "").await).await, "o\n");

    let payload = frames_payload(&[connect_frame()]);
    assert_eq!(
        post(&app, "/srv/s1/xhr_send", &payload).await.status(),
        StatusCode::NO_CONTENT
    );
    settle().await;

    let payload = frames_payload(&[Frame::disconnect().build().unwrap()]);
    assert_eq!(
        post(&app, "/srv/s1/xhr_send", &payload).await.status(),
        StatusCode::NO_CONTENT
    );
    settle().await;

    // the broker side ended, which closed the session
    let drained = body_string(post(&app, "/srv/s1/xhr", "").await).await;
    assert!(drained.contains("c[3000"), "got {drained}");
}

#[tokio::test]
async fn test_concurrent_opens_resolve_to_one_session() {
    let app = app();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            body_string(post(&app, "/srv/shared/xhr", "").await).await
        }));
    }

    let mut opens = 0;
    for handle in handles {
        let body = handle.await.unwrap();
        if body == "o\n" {
            opens += 1;
        } else {
            // losers either drain an empty array or are turned away
            assert!(
                body == "a[]\n" || body.starts_with("c[2010"),
                "unexpected body {body}"
            );
        }
    }
    assert_eq!(opens, 1);
}
