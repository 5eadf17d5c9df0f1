//! End-to-end tests of the HTTP surface, driving the router with an
//! in-memory messaging client.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tower::ServiceExt;

use wa_gateway::models::{AppConfig, ClientInfo, SessionStatus};
use wa_gateway::modules::api_server::{build_router, AppState};
use wa_gateway::modules::rate_limit::RateLimiter;
use wa_gateway::modules::sessions::SessionRegistry;
use wa_gateway::modules::whatsapp::{
    ClientError, ClientEvent, ClientFactory, EventSender, MediaFile, MessagingClient,
};

const KEY: &str = "test-key";

#[derive(Debug, Clone, PartialEq)]
enum Sent {
    Text { chat_id: String, body: String },
    Media { chat_id: String, mime_type: String, bytes: usize, caption: Option<String> },
}

/// How the in-memory client behaves.
#[derive(Debug, Clone, Copy, Default)]
struct Behavior {
    unpaired: bool,
    fail_init: bool,
    fail_send: bool,
    fail_logout: bool,
    destroy_delay: Duration,
}

struct FakeClient {
    profile_dir: PathBuf,
    events: EventSender,
    behavior: Behavior,
    sent: Arc<Mutex<Vec<Sent>>>,
}

#[async_trait]
impl MessagingClient for FakeClient {
    async fn initialize(&self) -> Result<(), ClientError> {
        if self.behavior.fail_init {
            return Err(ClientError::Browser("chromium not found".into()));
        }
        std::fs::create_dir_all(&self.profile_dir).map_err(|e| ClientError::Browser(e.to_string()))?;
        let _ = self.events.send(ClientEvent::Qr("2@fake-qr".into()));
        if !self.behavior.unpaired {
            let _ = self.events.send(ClientEvent::Authenticated);
            let _ = self.events.send(ClientEvent::Ready(ClientInfo {
                pushname: "Test".into(),
                wid: "15550001111@c.us".into(),
                platform: "android".into(),
            }));
        }
        Ok(())
    }

    async fn send_text(&self, chat_id: &str, body: &str) -> Result<String, ClientError> {
        if self.behavior.fail_send {
            return Err(ClientError::Send("composer vanished".into()));
        }
        let mut sent = self.sent.lock();
        sent.push(Sent::Text {
            chat_id: chat_id.to_string(),
            body: body.to_string(),
        });
        Ok(format!("true_{}_{}", chat_id, sent.len()))
    }

    async fn send_media(
        &self,
        chat_id: &str,
        media: &MediaFile,
        caption: Option<&str>,
    ) -> Result<String, ClientError> {
        let bytes = std::fs::read(&media.path).map_err(|e| ClientError::Send(e.to_string()))?;
        let mut sent = self.sent.lock();
        sent.push(Sent::Media {
            chat_id: chat_id.to_string(),
            mime_type: media.mime_type.clone(),
            bytes: bytes.len(),
            caption: caption.map(str::to_string),
        });
        Ok(format!("true_{}_{}", chat_id, sent.len()))
    }

    async fn logout(&self) -> Result<(), ClientError> {
        if self.behavior.fail_logout {
            return Err(ClientError::Send("logout rejected".into()));
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ClientError> {
        if !self.behavior.destroy_delay.is_zero() {
            tokio::time::sleep(self.behavior.destroy_delay).await;
        }
        Ok(())
    }
}

struct FakeFactory {
    session_path: PathBuf,
    behavior: Behavior,
    sent: Arc<Mutex<Vec<Sent>>>,
    senders: Arc<Mutex<HashMap<String, EventSender>>>,
}

impl ClientFactory for FakeFactory {
    fn create(&self, session_id: &str, events: EventSender) -> Arc<dyn MessagingClient> {
        self.senders
            .lock()
            .insert(session_id.to_string(), events.clone());
        Arc::new(FakeClient {
            profile_dir: self.session_path.join(session_id),
            events,
            behavior: self.behavior,
            sent: self.sent.clone(),
        })
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    state: AppState,
    app: Router,
    sent: Arc<Mutex<Vec<Sent>>>,
    senders: Arc<Mutex<HashMap<String, EventSender>>>,
}

fn harness_custom(behavior: Behavior, tweak: impl FnOnce(&mut AppConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig {
        api_key: KEY.to_string(),
        session_path: dir.path().join("sessions"),
        upload_path: dir.path().join("uploads"),
        environment: "test".to_string(),
        ..AppConfig::default()
    };
    tweak(&mut config);
    std::fs::create_dir_all(&config.session_path).unwrap();
    std::fs::create_dir_all(&config.upload_path).unwrap();

    let sent = Arc::new(Mutex::new(Vec::new()));
    let senders = Arc::new(Mutex::new(HashMap::new()));
    let factory = Arc::new(FakeFactory {
        session_path: config.session_path.clone(),
        behavior,
        sent: sent.clone(),
        senders: senders.clone(),
    });
    let sessions = Arc::new(SessionRegistry::new(
        factory,
        config.max_sessions,
        config.session_path.clone(),
    ));
    let limiter = Arc::new(RateLimiter::new(config.anti_ban.clone()));
    let state = AppState::new(config, sessions, limiter);
    let app = build_router(state.clone());

    Harness {
        _dir: dir,
        state,
        app,
        sent,
        senders,
    }
}

fn harness_with(pair: bool, tweak: impl FnOnce(&mut AppConfig)) -> Harness {
    harness_custom(
        Behavior {
            unpaired: !pair,
            ..Behavior::default()
        },
        tweak,
    )
}

fn harness() -> Harness {
    harness_with(true, |_| {})
}

impl Harness {
    async fn call(&self, req: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.call(
            Request::get(uri)
                .header("x-api-key", KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    async fn send_json(&self, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
        self.call(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("x-api-key", KEY)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn create(&self, id: &str) -> (StatusCode, Value) {
        self.send_json(Method::POST, "/api/sessions", json!({ "sessionId": id }))
            .await
    }

    async fn wait_for(&self, id: &str, status: SessionStatus) {
        for _ in 0..200 {
            if self.state.sessions.get(id).map(|s| s.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session {} never reached {:?}", id, status);
    }

    fn uploads_left(&self) -> usize {
        std::fs::read_dir(&self.state.config.upload_path)
            .unwrap()
            .count()
    }
}

const BOUNDARY: &str = "XTESTBOUNDARYX";

fn multipart(to: Option<&str>, caption: Option<&str>, file: Option<(&str, &str, &[u8])>) -> Body {
    let mut body = Vec::new();
    let mut text_part = |name: &str, value: &str| {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                BOUNDARY, name, value
            )
            .as_bytes(),
        );
    };
    if let Some(to) = to {
        text_part("to", to);
    }
    if let Some(caption) = caption {
        text_part("caption", caption);
    }
    if let Some((name, mime, bytes)) = file {
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                BOUNDARY, name, mime
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    Body::from(body)
}

fn media_request(session: &str, body: Body) -> Request<Body> {
    Request::post(format!("/api/sessions/{}/send-media", session))
        .header("x-api-key", KEY)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(body)
        .unwrap()
}

// ============================================================================
// System
// ============================================================================

#[tokio::test]
async fn health_is_public_and_carries_security_headers() {
    let h = harness();
    let response = h
        .app
        .clone()
        .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-content-type-options"], "nosniff");
    assert_eq!(response.headers()["x-frame-options"], "DENY");
    assert!(response.headers().contains_key("content-security-policy"));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "API is healthy");
    assert_eq!(body["data"]["status"], "healthy");
    assert_eq!(body["data"]["environment"], "test");
    assert_eq!(body["data"]["services"]["whatsapp"]["activeSessions"], 0);
    assert_eq!(body["data"]["services"]["whatsapp"]["maxSessions"], 10);
    assert_eq!(body["data"]["config"]["maxMessagesPerHour"], 50);
    assert_eq!(body["data"]["config"]["enableAntiBan"], false);
}

#[tokio::test]
async fn root_banner_and_swagger_document() {
    let h = harness();
    let (status, body) = h.call(Request::get("/").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["documentation"], "http://localhost:3001/api-docs");

    let (status, doc) = h
        .call(Request::get("/swagger.json").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/api/sessions/{session_id}/send-text"].is_object());
    assert!(doc["components"]["securitySchemes"]["api_key"].is_object());
}

#[tokio::test]
async fn unknown_route_is_enveloped_404() {
    let h = harness();
    let (status, body) = h.get("/api/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "Route /api/nope not found");
}

#[tokio::test]
async fn cors_preflight_for_allowed_origin() {
    let h = harness();
    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/api/sessions")
                .header(header::ORIGIN, "http://localhost:3000")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "http://localhost:3000"
    );
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS],
        "true"
    );

    let (_, body) = h
        .call(
            Request::get("/api/health/cors")
                .header(header::ORIGIN, "http://evil.test")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(body["data"]["currentOrigin"], "http://evil.test");
    assert_eq!(body["data"]["isAllowed"], false);
    assert_eq!(body["data"]["allowedOrigins"], json!(["http://localhost:3000"]));
}

#[tokio::test]
async fn request_throttle_kicks_in() {
    let h = harness_with(true, |c| c.rate_limit_max_requests = 2);
    for _ in 0..2 {
        let (status, _) = h.get("/api/health").await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = h.get("/api/health").await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "Too many requests, please try again later.");
}

// ============================================================================
// Auth
// ============================================================================

#[tokio::test]
async fn sessions_require_api_key() {
    let h = harness();

    let (status, body) = h
        .call(Request::get("/api/sessions").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "API key required");

    let (status, body) = h
        .call(
            Request::get("/api/sessions")
                .header("x-api-key", "wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid API key");

    let (status, _) = h
        .call(
            Request::get("/api/sessions")
                .header(header::AUTHORIZATION, format!("Bearer {}", KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn session_lifecycle() {
    let h = harness();

    let (status, body) = h.create("alpha1").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["id"], "alpha1");
    assert_eq!(body["message"], "Session created successfully");

    let (status, body) = h.create("alpha1").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Session alpha1 already exists");

    h.wait_for("alpha1", SessionStatus::Ready).await;
    let (status, body) = h.get("/api/sessions/alpha1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ready");
    assert_eq!(body["data"]["clientInfo"]["wid"], "15550001111@c.us");

    let (_, body) = h.get("/api/sessions").await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = h.get("/api/sessions/ghost1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Session not found");
}

#[tokio::test]
async fn generated_session_id_is_valid() {
    let h = harness();
    let (status, body) = h.send_json(Method::POST, "/api/sessions", json!({})).await;
    assert_eq!(status, StatusCode::CREATED);

    let id = body["data"]["id"].as_str().unwrap().to_string();
    assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    let (status, _) = h.get(&format!("/api/sessions/{}", id)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn session_id_and_capacity_are_enforced() {
    let h = harness_with(true, |c| c.max_sessions = 1);

    let (status, body) = h.create("no-dashes").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = h.create("first").await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = h.create("second").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "Maximum number of sessions (1) reached");
}

#[tokio::test]
async fn logout_wipes_profile_but_destroy_keeps_it() {
    let h = harness();
    let sessions_dir = h.state.config.session_path.clone();

    h.create("keep1").await;
    h.create("wipe1").await;
    assert!(sessions_dir.join("keep1").exists());
    assert!(sessions_dir.join("wipe1").exists());

    let (status, body) = h
        .call(
            Request::delete("/api/sessions/keep1")
                .header("x-api-key", KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Session destroyed successfully");
    assert!(sessions_dir.join("keep1").exists());

    let (status, body) = h
        .send_json(Method::POST, "/api/sessions/wipe1/logout", json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Logged out successfully");
    assert!(!sessions_dir.join("wipe1").exists());

    let (_, body) = h.get("/api/sessions").await;
    assert_eq!(body["data"], json!([]));

    let (status, _) = h
        .send_json(Method::POST, "/api/sessions/wipe1/logout", json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_initialization_frees_the_slot() {
    let h = harness_custom(
        Behavior {
            fail_init: true,
            ..Behavior::default()
        },
        |c| c.max_sessions = 1,
    );

    let (status, body) = h.create("broken1").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Failed to initialize session"));

    let (_, body) = h.get("/api/sessions").await;
    assert_eq!(body["data"], json!([]));

    // capacity was released, so this fails the same way instead of 503
    let (status, _) = h.create("broken2").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(h.state.sessions.get("broken1").is_none());
}

#[tokio::test]
async fn recreate_during_logout_is_rejected() {
    let h = harness_custom(
        Behavior {
            destroy_delay: Duration::from_millis(300),
            ..Behavior::default()
        },
        |_| {},
    );
    let profile = h.state.config.session_path.join("acct1");
    h.create("acct1").await;
    assert!(profile.exists());

    let logout = tokio::spawn(
        h.app.clone().oneshot(
            Request::post("/api/sessions/acct1/logout")
                .header("x-api-key", KEY)
                .body(Body::empty())
                .unwrap(),
        ),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, _) = h.create("acct1").await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = h.get("/api/sessions/acct1").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let response = logout.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!profile.exists());
    assert!(h.state.sessions.get("acct1").is_none());

    let (status, _) = h.create("acct1").await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(profile.exists());
}

#[tokio::test]
async fn failed_logout_keeps_the_session() {
    let h = harness_custom(
        Behavior {
            fail_logout: true,
            ..Behavior::default()
        },
        |_| {},
    );
    h.create("stuck1").await;

    let (status, body) = h
        .send_json(Method::POST, "/api/sessions/stuck1/logout", json!({}))
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["success"], false);

    let (status, body) = h.get("/api/sessions/stuck1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], "stuck1");
    assert!(h.state.config.session_path.join("stuck1").exists());
}

#[tokio::test]
async fn events_only_touch_registered_sessions() {
    let h = harness();
    assert!(!h.state.sessions.apply("ghost1", &ClientEvent::Authenticated));

    h.create("events1").await;
    h.wait_for("events1", SessionStatus::Ready).await;
    assert!(h
        .state
        .sessions
        .apply("events1", &ClientEvent::Disconnected("LOGOUT".into())));
    let (_, body) = h.get("/api/sessions/events1").await;
    assert_eq!(body["data"]["status"], "disconnected");

    let events = h.senders.lock().get("events1").cloned().unwrap();
    h.call(
        Request::delete("/api/sessions/events1")
            .header("x-api-key", KEY)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    let _ = events.send(ClientEvent::Qr("late".into()));
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!h.state.sessions.apply("events1", &ClientEvent::Authenticated));
    assert!(h.state.sessions.get("events1").is_none());
    let (_, body) = h.get("/api/sessions").await;
    assert_eq!(body["data"], json!([]));
}

// ============================================================================
// Messages
// ============================================================================

#[tokio::test]
async fn send_text_to_ready_session() {
    let h = harness();
    h.create("sender1").await;
    h.wait_for("sender1", SessionStatus::Ready).await;

    let (status, body) = h
        .send_json(
            Method::POST,
            "/api/sessions/sender1/send-text",
            json!({ "to": "+1 (555) 123-4567", "message": "  hello  " }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["messageId"], "true_15551234567@c.us_1");

    assert_eq!(
        h.sent.lock().as_slice(),
        &[Sent::Text {
            chat_id: "15551234567@c.us".into(),
            body: "hello".into(),
        }]
    );

    let (_, body) = h.get("/api/health/rate-limits").await;
    assert_eq!(body["data"]["global"]["globalHourlyCount"], 1);
    assert_eq!(body["data"]["sessions"][0]["sessionId"], "sender1");
    assert_eq!(body["data"]["sessions"][0]["status"]["hourlyCount"], 1);
}

#[tokio::test]
async fn send_text_rejects_bad_input_and_unready_sessions() {
    let h = harness_with(false, |_| {});
    h.create("pending1").await;
    h.wait_for("pending1", SessionStatus::Qr).await;

    let (status, body) = h
        .send_json(
            Method::POST,
            "/api/sessions/pending1/send-text",
            json!({ "message": "hi" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Phone number is required");

    let (status, _) = h
        .send_json(
            Method::POST,
            "/api/sessions/pending1/send-text",
            json!({ "to": "15551234567", "message": "" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = h
        .send_json(
            Method::POST,
            "/api/sessions/pending1/send-text",
            json!({ "to": "15551234567", "message": "hi" }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Session not ready");

    let (status, _) = h
        .send_json(
            Method::POST,
            "/api/sessions/missing1/send-text",
            json!({ "to": "15551234567", "message": "hi" }),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(h.sent.lock().is_empty());
}

#[tokio::test]
async fn anti_ban_pacing_blocks_and_resets() {
    let h = harness_with(true, |c| c.anti_ban.enabled = true);
    h.create("paced1").await;
    h.wait_for("paced1", SessionStatus::Ready).await;
    h.state.rate_limiter.record("paced1");

    let (status, body) = h
        .send_json(
            Method::POST,
            "/api/sessions/paced1/send-text",
            json!({ "to": "15551234567", "message": "again" }),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Minimum delay between messages not met"));
    assert!(body["data"]["delayMs"].as_u64().unwrap() > 0);
    assert!(h.sent.lock().is_empty());

    let (status, body) = h
        .send_json(Method::POST, "/api/health/rate-limits/paced1/reset", json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Rate limits reset for session paced1");

    let (_, body) = h.get("/api/health/rate-limits").await;
    assert_eq!(body["data"]["sessions"][0]["status"]["canSend"], true);
    assert_eq!(body["data"]["sessions"][0]["status"]["hourlyCount"], 0);
}

#[tokio::test]
async fn concurrent_sends_are_paced_together() {
    let h = harness_with(true, |c| c.anti_ban.enabled = true);
    h.create("burst1").await;
    h.wait_for("burst1", SessionStatus::Ready).await;

    let requests: Vec<_> = (0..5)
        .map(|i| {
            let req = Request::post("/api/sessions/burst1/send-text")
                .header("x-api-key", KEY)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({ "to": "15551234567", "message": format!("m{}", i) }).to_string(),
                ))
                .unwrap();
            tokio::spawn(h.app.clone().oneshot(req))
        })
        .collect();

    let mut statuses = Vec::new();
    for request in requests {
        statuses.push(request.await.unwrap().unwrap().status());
    }
    let accepted = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    let paced = statuses
        .iter()
        .filter(|s| **s == StatusCode::TOO_MANY_REQUESTS)
        .count();
    assert_eq!((accepted, paced), (1, 4), "{:?}", statuses);
    assert_eq!(h.sent.lock().len(), 1);

    let (_, body) = h.get("/api/health/rate-limits").await;
    assert_eq!(body["data"]["global"]["globalHourlyCount"], 1);
    assert_eq!(body["data"]["sessions"][0]["status"]["hourlyCount"], 1);
}

#[tokio::test]
async fn failed_send_is_not_counted() {
    let h = harness_custom(
        Behavior {
            fail_send: true,
            ..Behavior::default()
        },
        |c| c.anti_ban.enabled = true,
    );
    h.create("flaky1").await;
    h.wait_for("flaky1", SessionStatus::Ready).await;

    let (status, body) = h
        .send_json(
            Method::POST,
            "/api/sessions/flaky1/send-text",
            json!({ "to": "15551234567", "message": "hi" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "composer vanished");

    let (_, body) = h.get("/api/health/rate-limits").await;
    assert_eq!(body["data"]["global"]["globalHourlyCount"], 0);
    assert_eq!(body["data"]["sessions"][0]["status"]["hourlyCount"], 0);
    assert_eq!(body["data"]["sessions"][0]["status"]["canSend"], true);
}

#[tokio::test]
async fn send_media_uploads_and_cleans_up() {
    let h = harness();
    h.create("media1").await;
    h.wait_for("media1", SessionStatus::Ready).await;

    let png: &[u8] = b"\x89PNG\r\n\x1a\nnot-really-an-image";
    let (status, body) = h
        .call(media_request(
            "media1",
            multipart(Some("447911123456"), Some("look"), Some(("pic.png", "image/png", png))),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert!(body["data"]["messageId"].as_str().unwrap().starts_with("true_"));

    assert_eq!(
        h.sent.lock().as_slice(),
        &[Sent::Media {
            chat_id: "447911123456@c.us".into(),
            mime_type: "image/png".into(),
            bytes: png.len(),
            caption: Some("look".into()),
        }]
    );
    assert_eq!(h.uploads_left(), 0);
}

#[tokio::test]
async fn send_media_rejections_leave_no_files() {
    let h = harness_with(true, |c| c.max_file_size = 8);
    h.create("media2").await;
    h.wait_for("media2", SessionStatus::Ready).await;

    let (status, body) = h
        .call(media_request(
            "media2",
            multipart(Some("447911123456"), None, Some(("x.html", "text/html", &b"<p>"[..]))),
        ))
        .await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(body["error"], "File type text/html not allowed");

    let (status, _) = h
        .call(media_request(
            "media2",
            multipart(
                Some("447911123456"),
                None,
                Some(("big.pdf", "application/pdf", &[0u8; 64][..])),
            ),
        ))
        .await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    let (status, body) = h
        .call(media_request("media2", multipart(Some("447911123456"), None, None)))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "No file uploaded");

    let (status, _) = h
        .call(media_request(
            "media2",
            multipart(None, None, Some(("a.pdf", "application/pdf", &b"%PDF"[..]))),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(h.sent.lock().is_empty());
    assert_eq!(h.uploads_left(), 0);
}
