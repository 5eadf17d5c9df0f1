//! API key auth, per-client request throttle, CORS and security headers.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::warn;
use utoipa::ToSchema;

use crate::error::AppError;
use crate::models::AppConfig;

pub const API_KEY_HEADER: &str = "x-api-key";

// ============================================================================
// API key
// ============================================================================

/// Key from `X-API-Key`, falling back to `Authorization` (with or without `Bearer `).
fn presented_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(API_KEY_HEADER)
        .or_else(|| headers.get(header::AUTHORIZATION))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
        .filter(|v| !v.is_empty())
}

pub fn verify_api_key(expected: &str, headers: &HeaderMap) -> Result<(), AppError> {
    match presented_key(headers) {
        Some(key) if key.as_bytes().ct_eq(expected.as_bytes()).into() => Ok(()),
        Some(_) => Err(AppError::Unauthorized("Invalid API key".to_string())),
        None => Err(AppError::Unauthorized("API key required".to_string())),
    }
}

pub async fn require_api_key(
    State(expected): State<Arc<str>>,
    req: Request,
    next: Next,
) -> Response {
    match verify_api_key(&expected, req.headers()) {
        Ok(()) => next.run(req).await,
        Err(e) => {
            warn!("{} from {} on {}", e, client_ip(&req), req.uri().path());
            e.into_response()
        }
    }
}

// ============================================================================
// Request throttle
// ============================================================================

/// Fixed-window request counter keyed by client IP.
pub struct RequestThrottle {
    window: Duration,
    max_requests: u32,
    hits: Mutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl RequestThrottle {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request; false once the client exceeded its window budget.
    pub fn hit(&self, ip: IpAddr) -> bool {
        self.hit_at(ip, Instant::now())
    }

    pub(crate) fn hit_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut hits = self.hits.lock();
        if hits.len() > 10_000 {
            let window = self.window;
            hits.retain(|_, (start, _)| now.saturating_duration_since(*start) < window);
        }

        let entry = hits.entry(ip).or_insert((now, 0));
        if now.saturating_duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        entry.1 += 1;
        entry.1 <= self.max_requests
    }
}

fn client_ip(req: &Request) -> IpAddr {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

pub async fn throttle_requests(
    State(throttle): State<Arc<RequestThrottle>>,
    req: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&req);
    if throttle.hit(ip) {
        return next.run(req).await;
    }
    warn!("Rate limit exceeded for IP: {}", ip);
    AppError::RateLimited {
        reason: "Too many requests, please try again later.".to_string(),
        delay_ms: None,
    }
    .into_response()
}

// ============================================================================
// CORS
// ============================================================================

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
}

impl CorsSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            allowed_origins: config.cors_origins.clone(),
            allow_credentials: true,
            allowed_methods: ["GET", "POST", "PUT", "DELETE", "OPTIONS"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_headers: ["Content-Type", "Authorization", "X-API-Key"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Requests without an Origin (curl, mobile apps) are always allowed.
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(origin) => self.allowed_origins.iter().any(|o| o == origin),
        }
    }

    pub fn layer(&self) -> CorsLayer {
        let origins: Vec<HeaderValue> = self
            .allowed_origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin: {}", o);
                    None
                }
            })
            .collect();

        let methods: Vec<Method> = self
            .allowed_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        let headers: Vec<HeaderName> = self
            .allowed_headers
            .iter()
            .filter_map(|h| HeaderName::from_bytes(h.to_ascii_lowercase().as_bytes()).ok())
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(methods)
            .allow_headers(headers)
            .allow_credentials(self.allow_credentials)
    }
}

// ============================================================================
// Security headers
// ============================================================================

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; style-src 'self' 'unsafe-inline'; script-src 'self' 'unsafe-inline'; img-src 'self' data: https:";

pub fn security_header_layers() -> Vec<SetResponseHeaderLayer<HeaderValue>> {
    vec![
        SetResponseHeaderLayer::if_not_present(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ),
        SetResponseHeaderLayer::overriding(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains; preload"),
        ),
        SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ),
        SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ),
        SetResponseHeaderLayer::overriding(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ),
    ]
}
