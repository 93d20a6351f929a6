//! HTTP and WebSocket handlers for the roomcast server.
//!
//! Upgrade requests are authenticated and admission-checked before the
//! handshake completes; each accepted socket then becomes a core
//! [`Session`] that lives until either side goes away.

use crate::auth::{authenticate_request, AuthChain, Authenticator};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard, Metered};
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocket, Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use roomcast_core::{Hub, HubHandle, Identity, RoomKey, Session};
use roomcast_transport::websocket;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handle to the running hub.
    pub hub: HubHandle,
    /// Server configuration.
    pub config: Config,
    /// Verifies upgrade credentials.
    pub authenticator: Arc<dyn Authenticator>,
    /// One permit per open connection.
    connections: Arc<Semaphore>,
}

impl AppState {
    /// Create app state around a running hub.
    #[must_use]
    pub fn new(hub: HubHandle, config: Config, authenticator: Arc<dyn Authenticator>) -> Self {
        let connections = Arc::new(Semaphore::new(config.limits.max_connections));
        Self {
            hub,
            config,
            authenticator,
            connections,
        }
    }

    /// Number of connections currently admitted.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.config.limits.max_connections - self.connections.available_permits()
    }
}

/// Query parameters accepted on upgrade requests.
#[derive(Debug, Default, Deserialize)]
pub struct UpgradeQuery {
    /// Bearer token for clients that cannot set headers.
    pub token: Option<String>,
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.trim_end_matches('/');
    let ws_path = if ws_path.is_empty() { "/" } else { ws_path };
    let room_path = format!("{}/:room_type/:room_id", ws_path.trim_end_matches('/'));
    let cors = cors_layer(&state.config.cors.allowed_origins);

    Router::new()
        .route(ws_path, get(ws_handler))
        .route(&room_path, get(ws_room_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let hub = Hub::spawn();
    metrics::spawn_stats_sampler(
        hub.clone(),
        Duration::from_millis(config.metrics.sample_interval_ms),
    );

    let authenticator = Arc::new(AuthChain::from_config(&config.auth));
    if authenticator.is_empty() {
        warn!("No auth tokens or JWT secret configured; every upgrade will be rejected");
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(hub, config, authenticator));
    let app = router(Arc::clone(&state));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("roomcast server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(serde::Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    clients: usize,
    rooms: usize,
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.hub.stats().await {
        Ok(stats) => Json(Health {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
            clients: stats.clients,
            rooms: stats.rooms,
        })
        .into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Upgrade handler; rooms are joined with `join` envelopes.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<UpgradeQuery>,
    headers: HeaderMap,
) -> Response {
    admit(ws, state, &headers, query, None).await
}

/// Upgrade handler that joins the room named in the path.
async fn ws_room_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path((room_type, room_id)): Path<(String, String)>,
    Query(query): Query<UpgradeQuery>,
    headers: HeaderMap,
) -> Response {
    admit(ws, state, &headers, query, Some(RoomKey::new(room_type, room_id))).await
}

async fn admit(
    ws: WebSocketUpgrade,
    state: Arc<AppState>,
    headers: &HeaderMap,
    query: UpgradeQuery,
    room: Option<RoomKey>,
) -> Response {
    let identity =
        match authenticate_request(state.authenticator.as_ref(), headers, query.token.as_deref()).await {
            Ok(identity) => identity,
            Err(e) => {
                debug!(error = %e, "Rejected upgrade");
                metrics::record_auth_failure();
                return error_response(StatusCode::UNAUTHORIZED, &e.to_string());
            }
        };

    let Ok(permit) = Arc::clone(&state.connections).try_acquire_owned() else {
        warn!(user = identity.user_id, "Connection limit reached");
        metrics::record_error("connection_limit");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Too many connections");
    };

    let max_frame_size = state.config.limits.max_frame_size;
    ws.max_message_size(max_frame_size)
        .max_frame_size(max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, identity, room, permit))
}

/// Run a session over an upgraded socket until it closes.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    identity: Identity,
    room: Option<RoomKey>,
    _permit: OwnedSemaphorePermit,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (reader, writer) = websocket::split(socket, state.config.limits.max_frame_size);
    let session = Session::spawn(
        state.hub.clone(),
        identity,
        Metered(reader),
        Metered(writer),
        state.config.session_config(),
        room.clone(),
    )
    .await;

    debug!(
        client = %session.id(),
        user = identity.user_id,
        room = ?room.as_ref().map(ToString::to_string),
        "WebSocket connected"
    );

    session.closed().await;

    debug!(client = %session.id(), "WebSocket disconnected");
}
