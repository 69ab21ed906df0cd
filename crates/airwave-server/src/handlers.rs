//! HTTP and WebSocket handlers for the Airwave server.
//!
//! This module wires the radio, the bus and the broadcaster together and
//! exposes them over axum.

use crate::config::Config;
use crate::library;
use crate::metrics::{self, ConnectionMetricsGuard};
use airwave_core::{
    Catalog, Clock, EventBus, MemoryCatalog, Radio, RadioError, RadioHandle, ReactionRelay,
    SystemClock, Timeline,
};
use airwave_protocol::{
    ClientFrame, Encoding, PlaybackSnapshot, ReactionPayload, ServerFrame, Version,
    PROTOCOL_VERSION,
};
use airwave_transport::{websocket, Broadcaster, Connection, ConnectionId, TransportError};
use anyhow::Result;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error code for a client frame that could not be decoded.
const MALFORMED_FRAME: u16 = 1002;

/// Shared server state.
pub struct AppState {
    /// Front door to the timeline.
    pub radio: RadioHandle,
    /// Domain event bus.
    pub bus: Arc<EventBus>,
    /// Live listener connections.
    pub broadcaster: Broadcaster,
    /// Server configuration.
    pub config: Config,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build the bus, broadcaster and radio and start the radio task.
    #[must_use]
    pub fn start(
        config: Config,
        catalog: Arc<dyn Catalog>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let bus = Arc::new(EventBus::with_config(config.bus_config()));
        let broadcaster = Broadcaster::with_config(config.fanout_config());
        broadcaster.attach(&bus);

        let timeline = Timeline::new(catalog, Arc::clone(&bus), Arc::clone(&clock));
        let relay = ReactionRelay::new(Arc::clone(&bus), clock);
        let (radio, task) = Radio::spawn(timeline, relay, config.radio_config(), shutdown.clone());

        let state = Arc::new(Self {
            radio,
            bus,
            broadcaster,
            config,
            shutdown,
        });
        (state, task)
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/state", get(state_handler))
        .route("/api/skip", post(skip_handler))
        .route("/api/previous", post(previous_handler))
        .route("/api/pause", post(pause_handler))
        .route("/api/resume", post(resume_handler))
        .route("/api/playlists/:id/activate", post(activate_handler))
        .route("/api/reactions", post(reaction_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until ctrl-c.
///
/// # Errors
///
/// Returns an error if the library cannot be loaded or the server fails to
/// start.
pub async fn run_server(config: Config) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let catalog = match &config.library {
        Some(path) => MemoryCatalog::from_library(library::load(path)?, Arc::clone(&clock)),
        None => {
            warn!("No library configured; the radio starts empty");
            MemoryCatalog::new(Arc::clone(&clock))
        }
    };

    let addr = config.bind_addr()?;
    let shutdown = CancellationToken::new();
    let (state, radio_task) =
        AppState::start(config.clone(), Arc::new(catalog), clock, shutdown.clone());

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        metrics::spawn_reporter(
            Arc::clone(&state.bus),
            state.broadcaster.clone(),
            Duration::from_millis(config.metrics.report_interval_ms.max(1)),
            shutdown.clone(),
        );
    }

    let app = router(Arc::clone(&state));
    let listener = TcpListener::bind(addr).await?;

    info!("Airwave server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket_path);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    shutdown.cancel();
    if let Err(e) = radio_task.await {
        error!("Radio task failed: {}", e);
    }
    let grace = config.shutdown_grace();
    state.broadcaster.shutdown(grace).await;
    state.bus.shutdown(grace).await;

    info!("Airwave server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for ctrl-c: {}", e);
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

/// A [`RadioError`] as an HTTP response.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] RadioError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            RadioError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RadioError::NotFound(_) => StatusCode::NOT_FOUND,
            RadioError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RadioError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = Json(serde_json::json!({
            "code": self.0.code(),
            "error": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Time a playback command and record its outcome.
async fn command<F>(name: &'static str, fut: F) -> ApiResult<PlaybackSnapshot>
where
    F: Future<Output = Result<PlaybackSnapshot, RadioError>>,
{
    let start = Instant::now();
    let result = fut.await;
    metrics::record_command(name, result.is_ok(), start.elapsed().as_secs_f64());
    match result {
        Ok(snapshot) => Ok(Json(snapshot)),
        Err(e) => {
            debug!(command = name, error = %e, "Command rejected");
            Err(e.into())
        }
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": if state.radio.is_closed() { "stopped" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "connections": state.broadcaster.connection_count(),
        "heartbeat_interval_ms": state.config.heartbeat.interval_ms,
    }))
}

async fn state_handler(State(state): State<Arc<AppState>>) -> ApiResult<PlaybackSnapshot> {
    command("snapshot", state.radio.snapshot()).await
}

async fn skip_handler(State(state): State<Arc<AppState>>) -> ApiResult<PlaybackSnapshot> {
    command("skip", state.radio.skip()).await
}

async fn previous_handler(State(state): State<Arc<AppState>>) -> ApiResult<PlaybackSnapshot> {
    command("previous", state.radio.previous()).await
}

async fn pause_handler(State(state): State<Arc<AppState>>) -> ApiResult<PlaybackSnapshot> {
    command("pause", state.radio.pause()).await
}

async fn resume_handler(State(state): State<Arc<AppState>>) -> ApiResult<PlaybackSnapshot> {
    command("resume", state.radio.resume()).await
}

async fn activate_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<PlaybackSnapshot> {
    command("activate_playlist", state.radio.activate_playlist(&id)).await
}

/// Body of `POST /api/reactions`.
#[derive(Debug, Deserialize)]
pub struct ReactionRequest {
    pub user_id: String,
    pub emote: String,
}

async fn reaction_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ReactionRequest>,
) -> ApiResult<ReactionPayload> {
    let reaction = state
        .radio
        .submit_reaction(&request.user_id, &request.emote)?;
    metrics::record_reaction(reaction.emote.as_str());
    Ok(Json(reaction))
}

/// Query string of the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Outbound encoding, `json` (default) or `msgpack`.
    #[serde(default)]
    pub encoding: Option<Encoding>,
    /// Protocol version the listener speaks.
    #[serde(default)]
    pub v: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Some(v) = params.v.as_deref() {
        let compatible = v
            .parse::<Version>()
            .map(|v| v.is_compatible_with(&PROTOCOL_VERSION))
            .unwrap_or(false);
        if !compatible {
            return (
                StatusCode::BAD_REQUEST,
                format!("Unsupported protocol version {v}, server speaks {PROTOCOL_VERSION}"),
            )
                .into_response();
        }
    }

    let encoding = params.encoding.unwrap_or_default();
    let remote = connect_info.map(|ConnectInfo(addr)| addr.to_string());
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, encoding, remote, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    encoding: Encoding,
    remote: Option<String>,
    state: Arc<AppState>,
) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let config = state.config.websocket_config(encoding);
    let (sink, mut source) = websocket::split(socket, &config, remote.clone());

    let id = match register_listener(&state, sink).await {
        Ok(id) => id,
        Err(e) => {
            warn!(remote = ?remote, error = %e, "Connection rejected");
            metrics::record_error("register");
            return;
        }
    };

    debug!(connection = %id, remote = ?remote, encoding = ?encoding, "WebSocket connected");

    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);

    loop {
        let next = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            next = tokio::time::timeout(idle_timeout, source.recv()) => match next {
                Ok(next) => next,
                Err(_) => {
                    debug!(connection = %id, "Idle timeout");
                    break;
                }
            },
        };

        let reply = match next {
            Ok(Some(frame)) => {
                metrics::record_inbound(client_frame_type(&frame));
                handle_client_frame(&state, frame).await
            }
            Ok(None) => break,
            Err(TransportError::Protocol(e)) => {
                debug!(connection = %id, error = %e, "Malformed client frame");
                metrics::record_error("protocol");
                Some(ServerFrame::error(MALFORMED_FRAME, e.to_string()))
            }
            Err(e) => {
                warn!(connection = %id, error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        };

        if let Some(reply) = reply {
            if state.broadcaster.send_to(&id, reply).is_err() {
                break;
            }
        }
    }

    state.broadcaster.disconnect(&id);
    debug!(connection = %id, "WebSocket disconnected");
}

/// Register a listener and bring it up to date.
///
/// The greeting snapshot is taken before the connection can see broadcasts,
/// so events published in between never reach it. A second snapshot taken
/// after registration covers that window; the writer's `seq` check drops it
/// if something newer was already written.
async fn register_listener<C: Connection>(
    state: &AppState,
    conn: C,
) -> Result<ConnectionId, TransportError> {
    let greeting = match state.radio.snapshot().await {
        Ok(snapshot) => ServerFrame::State(snapshot),
        Err(e) => ServerFrame::error(e.code(), e.to_string()),
    };

    let id = state.broadcaster.register(conn, Some(greeting))?;

    if let Ok(snapshot) = state.radio.snapshot().await {
        state.broadcaster.send_to(&id, ServerFrame::State(snapshot))?;
    }
    Ok(id)
}

fn client_frame_type(frame: &ClientFrame) -> &'static str {
    match frame {
        ClientFrame::Sync => "sync",
        ClientFrame::Reaction { .. } => "reaction",
        ClientFrame::Ping { .. } => "ping",
    }
}

/// Handle a decoded client frame, returning the reply for this listener.
async fn handle_client_frame(state: &AppState, frame: ClientFrame) -> Option<ServerFrame> {
    match frame {
        ClientFrame::Sync => Some(match state.radio.snapshot().await {
            Ok(snapshot) => ServerFrame::State(snapshot),
            Err(e) => ServerFrame::error(e.code(), e.to_string()),
        }),

        ClientFrame::Reaction { id, user_id, emote } => {
            match state.radio.submit_reaction(&user_id, &emote) {
                Ok(reaction) => {
                    metrics::record_reaction(reaction.emote.as_str());
                    id.map(ServerFrame::ack)
                }
                Err(e) => Some(ServerFrame::error(e.code(), e.to_string())),
            }
        }

        ClientFrame::Ping { timestamp } => Some(ServerFrame::pong(timestamp)),
    }
}
