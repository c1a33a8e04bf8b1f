//! HTTP front for the offline cache agent
//!
//! Provides /health and relays every other request to the origin through the
//! active agent incarnation. Absolute-form targets are relayed as-is when
//! their origin is the application origin or one the asset manifest uses.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use offline_cache_agent::{
    AgentHost, AssetManifest, CacheStats, CacheStorage, FetchOutcome, FetchRequest, FetchSource, FileStorage,
    HttpNetwork, IncarnationStatus, RequestKey,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use url::{Origin, Url};

/// Headers that describe a single connection and are never relayed
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state for the HTTP server
pub struct ServerState {
    pub host: AgentHost<FileStorage, HttpNetwork>,
    pub storage: Arc<FileStorage>,
    pub origin: Url,
    /// Origins an absolute-form request target may name
    pub allowed_origins: Vec<Origin>,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(
        host: AgentHost<FileStorage, HttpNetwork>,
        storage: Arc<FileStorage>,
        origin: Url,
    ) -> Self {
        Self {
            host,
            storage,
            allowed_origins: vec![origin.origin()],
            origin,
            started_at: Utc::now(),
        }
    }

    /// Also accept absolute-form targets on every origin `manifest` names
    pub fn with_manifest_origins(
        mut self,
        manifest: &AssetManifest,
    ) -> offline_cache_agent::Result<Self> {
        for key in manifest.resolve(&self.origin)? {
            let origin = Url::parse(&key.url)?.origin();
            if !self.allowed_origins.contains(&origin) {
                self.allowed_origins.push(origin);
            }
        }
        Ok(self)
    }
}

pub type SharedState = Arc<ServerState>;

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    uptime_secs: u64,
    active_cache: Option<String>,
    agents: Vec<IncarnationStatus>,
    cache: CacheStats,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(intercept)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(state);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let cache = state.storage.stats().await.unwrap_or_else(|e| {
        warn!(error = %e, "Failed to read cache stats");
        CacheStats::default()
    });

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: uptime_secs(state.started_at, Utc::now()),
        active_cache: state.host.active_cache_name().await,
        agents: state.host.statuses().await,
        cache,
    })
}

/// Seconds since `started_at`, zero if the clock stepped backwards
fn uptime_secs(started_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - started_at).num_seconds().max(0) as u64
}

/// Relay a request to the origin, network first with cache fallback
async fn intercept(
    State(state): State<SharedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(url) = target_url(&state.origin, &state.allowed_origins, &uri) else {
        warn!(target = %uri, "Refusing request for foreign origin");
        return (
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: "Target origin is not served by this proxy".to_string(),
            }),
        )
            .into_response();
    };

    let request = FetchRequest {
        key: RequestKey::new(method.as_str(), url.as_str()),
        headers: forwarded_headers(&headers),
        body: body.to_vec(),
    };

    match state.host.fetch(&request).await {
        Ok(outcome) => relay(outcome),
        Err(e) => {
            warn!(request = %request.key, error = %e, "Request failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse {
                    error: "Network unavailable and no cached response".to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// URL to fetch for an incoming request target.
///
/// Origin-form targets are mapped onto the application origin. Absolute-form
/// targets are kept when their origin is in `allowed`, otherwise `None`.
fn target_url(origin: &Url, allowed: &[Origin], uri: &Uri) -> Option<Url> {
    if uri.scheme().is_none() {
        let mut url = origin.clone();
        url.set_path(uri.path());
        url.set_query(uri.query());
        return Some(url);
    }

    let url = Url::parse(&uri.to_string()).ok()?;
    allowed.contains(&url.origin()).then_some(url)
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn forwarded_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn relay(outcome: FetchOutcome) -> Response {
    let FetchOutcome { response, source } = outcome;

    let mut relayed = Response::new(Body::from(response.body));
    *relayed.status_mut() =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);

    let headers = relayed.headers_mut();
    for (name, value) in &response.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    let cache_header = match source {
        FetchSource::Cache => "HIT",
        FetchSource::Network => "MISS",
    };
    headers.insert("x-cache", HeaderValue::from_static(cache_header));

    relayed
}
