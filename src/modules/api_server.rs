//! HTTP API server with Swagger UI.
//!
//! Session management and messaging endpoints sit behind the API key;
//! health, rate-limit and CORS diagnostics are public. Serves Swagger UI at
//! /api-docs/ and the raw document at /swagger.json.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::{
        multipart::{Field, MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::{header, HeaderMap, StatusCode, Uri},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
use utoipa::{Modify, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::error::{AppError, AppResult};
use crate::models::{
    ApiResponse, ApiResponseDoc, AppConfig, ClientInfo, CreateSessionRequest, MessageSent,
    SendMediaForm, SendTextRequest, Session, SessionStatus,
};
use crate::modules::rate_limit::{GlobalRateStats, RateLimiter, Reservation, SessionRateStatus};
use crate::modules::security::{self, CorsSettings, RequestThrottle};
use crate::modules::sessions::SessionRegistry;
use crate::modules::validation;
use crate::modules::whatsapp::{to_chat_id, ClientError, MediaFile};

// ============================================================================
// State
// ============================================================================

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub cors: Arc<CorsSettings>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        sessions: Arc<SessionRegistry>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        let cors = Arc::new(CorsSettings::from_config(&config));
        Self {
            config: Arc::new(config),
            sessions,
            rate_limiter,
            cors,
            started_at: Instant::now(),
        }
    }
}

// ============================================================================
// OpenAPI Schema
// ============================================================================

#[derive(OpenApi)]
#[openapi(
    info(
        title = "WhatsApp API",
        description = "Messaging gateway over browser-driven web client sessions"
    ),
    paths(
        root,
        health,
        rate_limit_status,
        reset_rate_limits,
        cors_info,
        create_session,
        list_sessions,
        get_session,
        logout,
        destroy_session,
        send_text,
        send_media,
    ),
    components(schemas(
        ApiResponseDoc,
        Session,
        SessionStatus,
        ClientInfo,
        CreateSessionRequest,
        SendTextRequest,
        SendMediaForm,
        MessageSent,
        HealthData,
        RateLimitOverview,
        SessionRateStatus,
        GlobalRateStats,
        CorsInfo,
    )),
    modifiers(&SecurityAddon),
    tags(
        (name = "System", description = "Health and diagnostics"),
        (name = "Sessions", description = "Session lifecycle"),
        (name = "Messages", description = "Outgoing messages"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "api_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-API-Key"))),
            );
        }
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct HealthData {
    status: String,
    /// RFC 3339
    timestamp: String,
    /// Seconds since start
    uptime: f64,
    version: String,
    environment: String,
    services: HealthServices,
    config: HealthConfig,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct HealthServices {
    whatsapp: SessionCapacity,
    rate_limit: GlobalRateStats,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct SessionCapacity {
    active_sessions: usize,
    max_sessions: usize,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct HealthConfig {
    message_delay_ms: u64,
    max_messages_per_hour: u32,
    enable_anti_ban: bool,
    cors: CorsSummary,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct CorsSummary {
    allowed_origins: Vec<String>,
    allow_credentials: bool,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct SessionRateEntry {
    session_id: String,
    status: SessionRateStatus,
}

#[derive(Serialize, ToSchema)]
struct RateLimitOverview {
    sessions: Vec<SessionRateEntry>,
    global: GlobalRateStats,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct CorsInfo {
    #[serde(flatten)]
    settings: CorsSettings,
    current_origin: String,
    is_allowed: bool,
}

fn parse_json<T: DeserializeOwned + Default>(body: &Bytes) -> AppResult<T> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("Invalid JSON body: {}", e)))
}

// ============================================================================
// System endpoints
// ============================================================================

/// Service banner
#[utoipa::path(
    get, path = "/",
    tag = "System",
    responses((status = 200, description = "Service information", body = ApiResponseDoc))
)]
async fn root(State(state): State<AppState>) -> Json<Value> {
    let base = state.config.api_base_url.trim_end_matches('/');
    let docs_base = base.strip_suffix("/api").unwrap_or(base);
    Json(json!({
        "success": true,
        "message": "WhatsApp API Server",
        "version": env!("CARGO_PKG_VERSION"),
        "documentation": format!("{}/api-docs", docs_base),
        "endpoints": {
            "health": "/api/health",
            "sessions": "/api/sessions",
            "documentation": "/api-docs",
        }
    }))
}

/// Get API health status
#[utoipa::path(
    get, path = "/api/health",
    tag = "System",
    responses((status = 200, description = "Health check successful", body = ApiResponseDoc))
)]
async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthData>> {
    let config = &state.config;
    let data = HealthData {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime: state.started_at.elapsed().as_secs_f64(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        environment: config.environment.clone(),
        services: HealthServices {
            whatsapp: SessionCapacity {
                active_sessions: state.sessions.len(),
                max_sessions: state.sessions.max_sessions(),
            },
            rate_limit: state.rate_limiter.global_stats(),
        },
        config: HealthConfig {
            message_delay_ms: config.anti_ban.message_delay_ms,
            max_messages_per_hour: config.anti_ban.max_messages_per_hour,
            enable_anti_ban: config.anti_ban.enabled,
            cors: CorsSummary {
                allowed_origins: state.cors.allowed_origins.clone(),
                allow_credentials: state.cors.allow_credentials,
            },
        },
    };
    Json(ApiResponse::ok(data).with_message("API is healthy"))
}

/// Get per-session and global rate limit state
#[utoipa::path(
    get, path = "/api/health/rate-limits",
    tag = "System",
    responses((status = 200, description = "Rate limit status", body = ApiResponseDoc))
)]
async fn rate_limit_status(State(state): State<AppState>) -> Json<ApiResponse<RateLimitOverview>> {
    let sessions = state
        .sessions
        .list()
        .into_iter()
        .map(|session| SessionRateEntry {
            status: state.rate_limiter.session_status(&session.id),
            session_id: session.id,
        })
        .collect();

    Json(ApiResponse::ok(RateLimitOverview {
        sessions,
        global: state.rate_limiter.global_stats(),
    }))
}

/// Reset rate limits for a session
#[utoipa::path(
    post, path = "/api/health/rate-limits/{session_id}/reset",
    tag = "System",
    params(("session_id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Limits reset", body = ApiResponseDoc),
        (status = 400, description = "Invalid session id", body = ApiResponseDoc),
    )
)]
async fn reset_rate_limits(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<ApiResponse>> {
    let session_id = validation::session_id(&session_id)?;
    state.rate_limiter.reset_session(&session_id);
    Ok(Json(ApiResponse::message(format!(
        "Rate limits reset for session {}",
        session_id
    ))))
}

/// Show the CORS policy and whether the caller's origin passes it
#[utoipa::path(
    get, path = "/api/health/cors",
    tag = "System",
    responses((status = 200, description = "CORS policy", body = ApiResponseDoc))
)]
async fn cors_info(State(state): State<AppState>, headers: HeaderMap) -> Json<ApiResponse<CorsInfo>> {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    Json(ApiResponse::ok(CorsInfo {
        settings: (*state.cors).clone(),
        current_origin: origin.unwrap_or("No origin").to_string(),
        is_allowed: state.cors.is_allowed(origin),
    }))
}

// ============================================================================
// Session endpoints
// ============================================================================

/// Create a new session
#[utoipa::path(
    post, path = "/api/sessions",
    tag = "Sessions",
    request_body = CreateSessionRequest,
    security(("api_key" = [])),
    responses(
        (status = 201, description = "Session created", body = ApiResponseDoc),
        (status = 400, description = "Invalid session id", body = ApiResponseDoc),
        (status = 409, description = "Session already exists", body = ApiResponseDoc),
        (status = 503, description = "Session limit reached", body = ApiResponseDoc),
    )
)]
async fn create_session(State(state): State<AppState>, body: Bytes) -> AppResult<impl IntoResponse> {
    let req: CreateSessionRequest = parse_json(&body)?;
    let session_id = req
        .session_id
        .as_deref()
        .map(validation::session_id)
        .transpose()?;

    let session = state.sessions.create(session_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(session).with_message("Session created successfully")),
    ))
}

/// List all sessions
#[utoipa::path(
    get, path = "/api/sessions",
    tag = "Sessions",
    security(("api_key" = [])),
    responses((status = 200, description = "Session list", body = ApiResponseDoc))
)]
async fn list_sessions(State(state): State<AppState>) -> Json<ApiResponse<Vec<Session>>> {
    Json(ApiResponse::ok(state.sessions.list()))
}

/// Get session status (and QR payload while pairing)
#[utoipa::path(
    get, path = "/api/sessions/{session_id}",
    tag = "Sessions",
    params(("session_id" = String, Path, description = "Session id")),
    security(("api_key" = [])),
    responses(
        (status = 200, description = "Session", body = ApiResponseDoc),
        (status = 404, description = "Session not found", body = ApiResponseDoc),
    )
)]
async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<ApiResponse<Session>>> {
    let session_id = validation::session_id(&session_id)?;
    let session = state.sessions.get(&session_id).ok_or(AppError::SessionNotFound)?;
    Ok(Json(ApiResponse::ok(session)))
}

/// Log out: unlink the device and delete stored credentials
#[utoipa::path(
    post, path = "/api/sessions/{session_id}/logout",
    tag = "Sessions",
    params(("session_id" = String, Path, description = "Session id")),
    security(("api_key" = [])),
    responses(
        (status = 200, description = "Logged out", body = ApiResponseDoc),
        (status = 404, description = "Session not found", body = ApiResponseDoc),
    )
)]
async fn logout(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<ApiResponse>> {
    let session_id = validation::session_id(&session_id)?;
    state.sessions.logout(&session_id).await?;
    Ok(Json(ApiResponse::message("Logged out successfully")))
}

/// Destroy a session, keeping stored credentials
#[utoipa::path(
    delete, path = "/api/sessions/{session_id}",
    tag = "Sessions",
    params(("session_id" = String, Path, description = "Session id")),
    security(("api_key" = [])),
    responses(
        (status = 200, description = "Destroyed", body = ApiResponseDoc),
        (status = 404, description = "Session not found", body = ApiResponseDoc),
    )
)]
async fn destroy_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> AppResult<Json<ApiResponse>> {
    let session_id = validation::session_id(&session_id)?;
    state.sessions.destroy(&session_id).await?;
    Ok(Json(ApiResponse::message("Session destroyed successfully")))
}

// ============================================================================
// Message endpoints
// ============================================================================

/// Take an anti-ban send slot, then pause like a human would.
async fn pace(state: &AppState, session_id: &str) -> AppResult<Reservation> {
    let reservation = state.rate_limiter.try_acquire(session_id).map_err(|decision| {
        let reason = decision.reason.unwrap_or_else(|| "Rate limited".to_string());
        warn!("Send blocked for session {}: {}", session_id, reason);
        AppError::RateLimited {
            reason,
            delay_ms: decision.delay_ms,
        }
    })?;
    state.rate_limiter.human_delay().await;
    Ok(reservation)
}

/// Hand the slot back when the client did not deliver.
fn settle<T>(state: &AppState, reservation: Reservation, sent: Result<T, ClientError>) -> AppResult<T> {
    sent.map_err(|e| {
        state.rate_limiter.release(reservation);
        AppError::Client(e)
    })
}

/// Send a text message
#[utoipa::path(
    post, path = "/api/sessions/{session_id}/send-text",
    tag = "Messages",
    params(("session_id" = String, Path, description = "Session id")),
    request_body = SendTextRequest,
    security(("api_key" = [])),
    responses(
        (status = 200, description = "Message sent", body = ApiResponseDoc),
        (status = 400, description = "Invalid input", body = ApiResponseDoc),
        (status = 404, description = "Session not found", body = ApiResponseDoc),
        (status = 409, description = "Session not ready", body = ApiResponseDoc),
        (status = 429, description = "Anti-ban pacing", body = ApiResponseDoc),
        (status = 502, description = "Client failed to send", body = ApiResponseDoc),
    )
)]
async fn send_text(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> AppResult<Json<ApiResponse<MessageSent>>> {
    let session_id = validation::session_id(&session_id)?;
    let req: SendTextRequest = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("Invalid JSON body: {}", e)))?;
    let to = validation::phone_number(req.to.as_deref())?;
    let message = validation::text_message(req.message.as_deref())?;

    let client = state.sessions.client_for_send(&session_id)?;
    let reservation = pace(&state, &session_id).await?;

    let sent = client.send_text(&to_chat_id(&to), &message).await;
    let message_id = settle(&state, reservation, sent)?;

    info!("[{}] text sent to {} ({})", session_id, to, message_id);
    Ok(Json(ApiResponse::ok(MessageSent { message_id })))
}

#[derive(Default)]
struct MediaUpload {
    to: Option<String>,
    caption: Option<String>,
    file: Option<MediaFile>,
}

impl MediaUpload {
    async fn discard(self) {
        if let Some(file) = self.file {
            remove_upload(&file.path).await;
        }
    }
}

async fn remove_upload(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("Error deleting uploaded file {}: {}", path.display(), e);
    }
}

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge("Request too large".to_string())
    } else {
        AppError::BadRequest(e.body_text())
    }
}

/// Stream one file field to the upload directory, enforcing type and size.
async fn store_upload(
    mut field: Field<'_>,
    upload_dir: &std::path::Path,
    max_size: usize,
) -> AppResult<MediaFile> {
    let file_name = validation::file_name(field.file_name().unwrap_or("upload"));
    let mime_type = field
        .content_type()
        .map(|m| m.to_string())
        .filter(|m| m != "application/octet-stream")
        .unwrap_or_else(|| {
            mime_guess::from_path(&file_name)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });
    validation::mime_type(&mime_type)?;

    let path: PathBuf = upload_dir.join(format!("{}-{}", uuid::Uuid::new_v4().simple(), file_name));
    let mut out = tokio::fs::File::create(&path).await?;
    let mut written = 0usize;

    let outcome: AppResult<()> = async {
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            written += chunk.len();
            if written > max_size {
                return Err(AppError::PayloadTooLarge(format!(
                    "File too large. Maximum size is {} bytes",
                    max_size
                )));
            }
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        Ok(())
    }
    .await;

    if let Err(e) = outcome {
        drop(out);
        remove_upload(&path).await;
        return Err(e);
    }

    Ok(MediaFile {
        path,
        mime_type,
        file_name,
    })
}

async fn read_media_form(state: &AppState, mut multipart: Multipart) -> AppResult<MediaUpload> {
    let mut upload = MediaUpload::default();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                upload.discard().await;
                return Err(multipart_error(e));
            }
        };

        let name = field.name().map(str::to_owned);
        let result = match name.as_deref() {
            Some("to") => field.text().await.map(|v| upload.to = Some(v)).map_err(multipart_error),
            Some("caption") => field
                .text()
                .await
                .map(|v| upload.caption = Some(v))
                .map_err(multipart_error),
            Some("file") if upload.file.is_none() => {
                store_upload(field, &state.config.upload_path, state.config.max_file_size)
                    .await
                    .map(|f| upload.file = Some(f))
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            upload.discard().await;
            return Err(e);
        }
    }

    Ok(upload)
}

/// Send a media message (multipart upload)
#[utoipa::path(
    post, path = "/api/sessions/{session_id}/send-media",
    tag = "Messages",
    params(("session_id" = String, Path, description = "Session id")),
    request_body(content = SendMediaForm, content_type = "multipart/form-data"),
    security(("api_key" = [])),
    responses(
        (status = 200, description = "Message sent", body = ApiResponseDoc),
        (status = 400, description = "Invalid input", body = ApiResponseDoc),
        (status = 413, description = "File too large", body = ApiResponseDoc),
        (status = 415, description = "File type not allowed", body = ApiResponseDoc),
        (status = 429, description = "Anti-ban pacing", body = ApiResponseDoc),
    )
)]
async fn send_media(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Json<ApiResponse<MessageSent>>> {
    let session_id = validation::session_id(&session_id)?;
    let multipart = multipart.map_err(|e| AppError::BadRequest(e.body_text()))?;

    let mut upload = read_media_form(&state, multipart).await?;
    let Some(file) = upload.file.take() else {
        return Err(AppError::BadRequest("No file uploaded".to_string()));
    };

    let result = deliver_media(&state, &session_id, &upload, &file).await;
    remove_upload(&file.path).await;
    result
}

async fn deliver_media(
    state: &AppState,
    session_id: &str,
    upload: &MediaUpload,
    file: &MediaFile,
) -> AppResult<Json<ApiResponse<MessageSent>>> {
    let to = validation::phone_number(upload.to.as_deref())?;
    let caption = validation::caption(upload.caption.as_deref())?;

    let client = state.sessions.client_for_send(session_id)?;
    let reservation = pace(state, session_id).await?;

    let sent = client
        .send_media(&to_chat_id(&to), file, caption.as_deref())
        .await;
    let message_id = settle(state, reservation, sent)?;

    info!("[{}] {} sent to {} ({})", session_id, file.mime_type, to, message_id);
    Ok(Json(ApiResponse::ok(MessageSent { message_id })))
}

async fn not_found(uri: Uri) -> AppError {
    AppError::RouteNotFound(uri.path().to_string())
}

// ============================================================================
// Router & startup
// ============================================================================

pub fn build_router(state: AppState) -> Router {
    let api_key: Arc<str> = Arc::from(state.config.api_key.as_str());
    let throttle = Arc::new(RequestThrottle::new(
        Duration::from_millis(state.config.rate_limit_window_ms),
        state.config.rate_limit_max_requests,
    ));

    let public_api = Router::new()
        .route("/api/health", get(health))
        .route("/api/health/rate-limits", get(rate_limit_status))
        .route("/api/health/rate-limits/{session_id}/reset", post(reset_rate_limits))
        .route("/api/health/cors", get(cors_info));

    let protected_api = Router::new()
        .route("/api/sessions", post(create_session).get(list_sessions))
        .route("/api/sessions/{session_id}", get(get_session).delete(destroy_session))
        .route("/api/sessions/{session_id}/logout", post(logout))
        .route("/api/sessions/{session_id}/send-text", post(send_text))
        .route("/api/sessions/{session_id}/send-media", post(send_media))
        .route_layer(middleware::from_fn_with_state(api_key, security::require_api_key));

    let api = public_api
        .merge(protected_api)
        .route_layer(middleware::from_fn_with_state(throttle, security::throttle_requests));

    let mut app = Router::new()
        .route("/", get(root))
        .merge(api)
        .with_state(state.clone())
        .merge(SwaggerUi::new("/api-docs").url("/swagger.json", ApiDoc::openapi()))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(state.config.max_request_size))
        .layer(TraceLayer::new_for_http());

    for layer in security::security_header_layers() {
        app = app.layer(layer);
    }
    app.layer(state.cors.layer())
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    listener: TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = build_router(state);

    if let Ok(addr) = listener.local_addr() {
        info!("✅ API server listening on http://{}", addr);
        info!("📖 Swagger UI: http://{}/api-docs/", addr);
    }

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
}
