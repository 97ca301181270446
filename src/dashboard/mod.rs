use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::cluster::Cluster;
use crate::error::SimError;
use crate::snapshot::ClusterSnapshot;

/// How often the stream endpoint pushes a fresh snapshot.
pub const PUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct DashboardState {
    pub cluster: Arc<Cluster>,
    snapshots: Arc<watch::Sender<Arc<ClusterSnapshot>>>,
}

impl DashboardState {
    pub async fn new(cluster: Arc<Cluster>) -> Self {
        let initial = Arc::new(cluster.snapshot().await);
        let (snapshots, _) = watch::channel(initial);
        Self {
            cluster,
            snapshots: Arc::new(snapshots),
        }
    }

    /// Capture a snapshot every `interval` for stream subscribers.
    pub async fn publish(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let snapshot = self.cluster.snapshot().await;
                    self.snapshots.send_replace(Arc::new(snapshot));
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct SetJobRateRequest {
    rate: f64,
}

#[derive(Serialize)]
struct SetJobRateResponse {
    job_rate_per_minute: f64,
}

#[derive(Deserialize)]
struct AddWorkerRequest {
    worker_id: Option<String>,
    failure_rate: f64,
}

#[derive(Serialize)]
struct AddWorkerResponse {
    worker_id: String,
    failure_rate: f64,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(e: SimError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match e {
        SimError::InvalidConfiguration(_) => StatusCode::BAD_REQUEST,
        SimError::DuplicateWorker(_) => StatusCode::CONFLICT,
        SimError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/api/job-rate", post(set_job_rate_handler))
        .route("/api/workers", post(add_worker_handler))
        .route("/api/stream", get(stream_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the dashboard until `shutdown` is cancelled.
pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    tokio::spawn(state.clone().publish(PUSH_INTERVAL, shutdown.clone()));
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn index_handler() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.cluster.snapshot().await)
}

async fn set_job_rate_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SetJobRateRequest>,
) -> impl IntoResponse {
    match state.cluster.set_job_rate(payload.rate) {
        Ok(rate) => Ok(Json(SetJobRateResponse {
            job_rate_per_minute: rate,
        })),
        Err(e) => Err(error_response(e)),
    }
}

async fn add_worker_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<AddWorkerRequest>,
) -> impl IntoResponse {
    match state
        .cluster
        .add_worker(payload.worker_id, payload.failure_rate)
        .await
    {
        Ok(worker_id) => Ok((
            StatusCode::CREATED,
            Json(AddWorkerResponse {
                worker_id,
                failure_rate: payload.failure_rate,
            }),
        )),
        Err(e) => Err(error_response(e)),
    }
}

async fn stream_handler(
    State(state): State<DashboardState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = WatchStream::new(state.snapshots.subscribe()).filter_map(|snapshot| {
        match Event::default().event("snapshot").json_data(&*snapshot) {
            Ok(event) => Some(Ok(event)),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode snapshot");
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
