use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration, time::Instant};

use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::RelayConfig;
use crate::cors::cors_layer;
use crate::error::{
    attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
    ErrorCode, RelayError,
};
use crate::metrics::RelayMetrics;
use crate::room::RoomRegistry;
use crate::ws::ws_upgrade;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
    pub config: Arc<RelayConfig>,
    pub metrics: Arc<RelayMetrics>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let metrics = Arc::new(RelayMetrics::default());
        Self {
            registry: Arc::new(RoomRegistry::new(config.awareness_timeout, Arc::clone(&metrics))),
            config: Arc::new(config),
            metrics,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/{room_id}", get(ws_upgrade))
        .fallback(not_found);
    apply_middleware(router, state).layer(cors)
}

fn apply_middleware(router: Router<AppState>, state: AppState) -> Router {
    router
        .layer(middleware::from_fn_with_state(state.clone(), request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
        .with_state(state)
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

async fn not_found() -> RelayError {
    RelayError::from_code(ErrorCode::NotFound)
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            RelayError::from_code(ErrorCode::InternalError).into_response()
        }
    }
}

async fn request_context_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    let status = response.status().as_u16();
    let latency_ms = started_at.elapsed().as_millis() as u64;
    state.metrics.record_http_request(method.as_str(), &path, status, latency_ms);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}

/// Cloneable trigger for [`SyncServer::serve`]'s graceful shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
    }
}

/// A bound relay: listener, room registry and the shared application state.
///
/// `bind` is the init step. `serve` runs until either the supplied shutdown
/// future resolves or a [`ShutdownHandle`] fires; teardown then rejects new
/// joins, drops every connection's outbound queue so the sockets drain, and
/// stops the awareness sweeper.
pub struct SyncServer {
    listener: TcpListener,
    state: AppState,
    shutdown: ShutdownHandle,
}

impl SyncServer {
    pub async fn bind(config: RelayConfig) -> anyhow::Result<Self> {
        let listen_addr = config.listen_addr;
        let listener = TcpListener::bind(listen_addr)
            .await
            .with_context(|| format!("failed to bind relay listener on {listen_addr}"))?;
        let (sender, _) = watch::channel(false);

        Ok(Self {
            listener,
            state: AppState::new(config),
            shutdown: ShutdownHandle { sender: Arc::new(sender) },
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("failed to read relay listener address")
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.state.registry)
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.state.metrics)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.shutdown();
    }

    pub async fn serve<F>(self, signal: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Self { listener, state, shutdown } = self;
        let local_addr = listener.local_addr().ok();
        info!(listen_addr = ?local_addr, "starting relay server");

        let sweeper = spawn_awareness_sweeper(
            Arc::clone(&state.registry),
            state.config.awareness_sweep_interval,
            shutdown.sender.subscribe(),
        );

        let registry = Arc::clone(&state.registry);
        let mut stop = shutdown.sender.subscribe();
        let graceful = async move {
            tokio::select! {
                _ = signal => {}
                _ = stopped(&mut stop) => {}
            }
            info!("relay shutting down");
            registry.shutdown().await;
        };

        let result = axum::serve(listener, build_router(state))
            .with_graceful_shutdown(graceful)
            .await
            .context("relay server exited unexpectedly");

        shutdown.shutdown();
        if let Err(join_error) = sweeper.await {
            error!(?join_error, "awareness sweeper failed");
        }
        info!("relay stopped");
        result
    }
}

fn spawn_awareness_sweeper(
    registry: Arc<RoomRegistry>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = tokio::time::Instant::now().into_std();
                    let expired = registry.sweep_awareness(now).await;
                    if expired > 0 {
                        debug!(expired, "expired stale presence entries");
                    }
                }
                _ = stopped(&mut stop) => break,
            }
        }
    })
}

/// Resolves once the shutdown flag is set (or its sender is gone).
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|flag| *flag).await;
}
