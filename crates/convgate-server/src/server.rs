use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use convgate_core::errors::GatewayError;
use convgate_core::events::{EventBus, JobEvent};
use convgate_host::{DispatchBridge, ExecutionContext, JobCleanup, JobCoordinator};

use crate::broadcaster::{Broadcaster, SessionRegistry};
use crate::router::CommandRouter;
use crate::session::{self, Session};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Listener configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8081,
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// The job-side half of the gateway: coordinator, bridge, and the event
/// stream that connects them to the broadcaster.
pub struct Gateway {
    pub coordinator: JobCoordinator,
    pub bridge: DispatchBridge,
    pub events: EventBus,
    event_rx: mpsc::UnboundedReceiver<JobEvent>,
}

impl Gateway {
    pub fn new(
        cleanup: Arc<dyn JobCleanup>,
        context: Arc<dyn ExecutionContext>,
        dispatch_timeout: Duration,
    ) -> Self {
        let (events, event_rx) = EventBus::channel();
        Self {
            coordinator: JobCoordinator::new(cleanup, events.clone()),
            bridge: DispatchBridge::new(context, dispatch_timeout),
            events,
            event_rx,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<CommandRouter>,
    pub coordinator: JobCoordinator,
    pub heartbeat_interval: Duration,
    pub shutdown: CancellationToken,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind the listener and start serving. Bind failures are returned; nothing
/// is left running in that case.
pub async fn start(config: ServerConfig, gateway: Gateway) -> Result<ServerHandle, std::io::Error> {
    let Gateway {
        coordinator,
        bridge,
        events,
        event_rx,
    } = gateway;

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let registry = Arc::new(SessionRegistry::new());
    let broadcaster = Broadcaster::new(Arc::clone(&registry)).start(event_rx);

    let shutdown = CancellationToken::new();
    let state = AppState {
        registry: Arc::clone(&registry),
        router: Arc::new(CommandRouter::new(coordinator.clone(), bridge, events)),
        coordinator: coordinator.clone(),
        heartbeat_interval: config.heartbeat_interval,
        shutdown: shutdown.clone(),
    };
    let app = build_router(state);

    tracing::info!(host = %config.host, port = local_addr.port(), "gateway listening");

    let stop = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
        {
            let err = GatewayError::transport(e);
            tracing::error!(error = %err, kind = err.error_kind(), "listener failed");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        registry,
        coordinator,
        shutdown,
        server,
        broadcaster,
    })
}

/// Handle returned by `start()`.
pub struct ServerHandle {
    pub port: u16,
    registry: Arc<SessionRegistry>,
    coordinator: JobCoordinator,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    broadcaster: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.server.is_finished()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    /// Stop accepting, close every session, and request cancellation of
    /// the running job, if any.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let closed = self.registry.close_all();
        if let Some(job_id) = self.coordinator.snapshot().job_id {
            self.coordinator.cancel(&job_id);
        }

        let mut server = self.server;
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
            tracing::warn!("listener did not stop in time, aborting");
            server.abort();
        }
        self.broadcaster.abort();
        tracing::info!(closed_sessions = closed, "gateway stopped");
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let (session, rx) = Session::new();
    // Refused once shutdown has closed the registry.
    if state.shutdown.is_cancelled() || !state.registry.add(Arc::clone(&session)) {
        tracing::debug!(session_id = %session.id(), "refusing session during shutdown");
        let _ = socket.send(WsMessage::Close(None)).await;
        return;
    }
    tracing::info!(
        session_id = %session.id(),
        open_sessions = state.registry.count(),
        "session opened"
    );

    session::run_session(
        socket,
        session,
        rx,
        state.registry,
        state.router,
        state.heartbeat_interval,
    )
    .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "connections": state.registry.count(),
        "job": state.coordinator.snapshot(),
    }))
}
