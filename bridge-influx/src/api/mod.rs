//! HTTP API endpoints

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use bridge_core::line_protocol::{self, Precision};
use bridge_core::metrics::{MetricsSnapshot, PipelineMetrics};
use bridge_core::pipeline::{PipelineHandle, PipelineStatus};
use bridge_core::writer::CircuitState;
use bridge_core::BridgeError;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: PipelineHandle,
    pub metrics: Arc<PipelineMetrics>,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health))
        .route("/ping", get(ping))
        // Write endpoint (InfluxDB compatible)
        .route("/write", post(write))
        .route("/api/v2/write", post(write))
        // Stats
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WriteParams {
    precision: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub circuit: CircuitState,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub pipeline: PipelineStatus,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Points accepted before the failure
    pub accepted: usize,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString, accepted: usize) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            accepted,
        }),
    )
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.pipeline.status();
    Json(HealthResponse {
        status: if status.closed { "draining" } else { "ok" }.to_string(),
        version: bridge_core::VERSION.to_string(),
        circuit: status.circuit,
    })
}

async fn ping() -> &'static str {
    "pong"
}

async fn write(
    State(state): State<AppState>,
    Query(params): Query<WriteParams>,
    body: String,
) -> Result<StatusCode, ApiError> {
    let precision = match params.precision.as_deref() {
        None => Precision::default(),
        Some(p) => Precision::parse(p)
            .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, format!("Unknown precision: {}", p), 0))?,
    };

    let points = line_protocol::decode_with_precision(&body, precision)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e, 0))?;

    let total = points.len();
    for (accepted, point) in points.into_iter().enumerate() {
        state.pipeline.submit(point).await.map_err(|e| {
            let status = match e {
                BridgeError::Validation(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::SERVICE_UNAVAILABLE,
            };
            api_error(status, e, accepted)
        })?;
    }

    debug!(points = total, "Accepted write");
    Ok(StatusCode::NO_CONTENT)
}

async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        pipeline: state.pipeline.status(),
        metrics: state.metrics.snapshot(),
    })
}

async fn metrics(State(state): State<AppState>) -> String {
    let snapshot = state.metrics.snapshot();
    let status = state.pipeline.status();

    // Prometheus format
    let counters = [
        ("points_ingested_total", "Points accepted into the buffer", snapshot.points_ingested),
        ("points_dropped_total", "Points dropped by the buffer policy", snapshot.points_dropped),
        ("points_lost_total", "Points abandoned at the drain deadline", snapshot.points_lost),
        ("points_written_total", "Points committed by the database", snapshot.points_written),
        ("batches_written_total", "Batches committed by the database", snapshot.batches_written),
        (
            "batches_dead_lettered_total",
            "Batches sent to the dead-letter log",
            snapshot.batches_dead_lettered,
        ),
        (
            "points_dead_lettered_total",
            "Points sent to the dead-letter log",
            snapshot.points_dead_lettered,
        ),
        ("write_retries_total", "Write attempts rescheduled after a failure", snapshot.write_retries),
    ];

    let mut output = String::new();
    for (name, help, value) in counters {
        let _ = writeln!(output, "# HELP bridge_{} {}", name, help);
        let _ = writeln!(output, "# TYPE bridge_{} counter", name);
        let _ = writeln!(output, "bridge_{} {}", name, value);
    }

    output.push_str("# HELP bridge_circuit_transitions_total Circuit breaker transitions by target state\n");
    output.push_str("# TYPE bridge_circuit_transitions_total counter\n");
    for (to, value) in [
        (CircuitState::Open, snapshot.circuit_opened),
        (CircuitState::HalfOpen, snapshot.circuit_half_opened),
        (CircuitState::Closed, snapshot.circuit_closed),
    ] {
        let _ = writeln!(output, "bridge_circuit_transitions_total{{to=\"{}\"}} {}", to, value);
    }

    output.push_str("# HELP bridge_buffer_points Points currently buffered\n");
    output.push_str("# TYPE bridge_buffer_points gauge\n");
    let _ = writeln!(output, "bridge_buffer_points {}", status.buffered);

    output.push_str("# HELP bridge_buffer_capacity_points Buffer capacity\n");
    output.push_str("# TYPE bridge_buffer_capacity_points gauge\n");
    let _ = writeln!(output, "bridge_buffer_capacity_points {}", status.capacity);

    output.push_str("# HELP bridge_circuit_open Whether the circuit breaker is open\n");
    output.push_str("# TYPE bridge_circuit_open gauge\n");
    let open = u8::from(status.circuit != CircuitState::Closed);
    let _ = writeln!(output, "bridge_circuit_open {}", open);

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use bridge_core::batcher::BatchConfig;
    use bridge_core::buffer::{BufferConfig, DropPolicy};
    use bridge_core::deadletter::MemoryDeadLetterSink;
    use bridge_core::pipeline::{Pipeline, PipelineConfig};
    use bridge_core::writer::Transport;
    use bytes::Bytes;
    use std::time::Duration;
    use tower::ServiceExt;

    struct NullInflux;

    impl Transport for NullInflux {
        async fn send(&self, _payload: Bytes) -> bridge_core::Result<()> {
            Ok(())
        }
    }

    /// A pipeline whose batcher never fills a batch, so points stay buffered
    fn start(capacity: usize) -> (Pipeline, Router, Arc<PipelineMetrics>) {
        let config = PipelineConfig {
            buffer: BufferConfig {
                capacity,
                drop_policy: DropPolicy::Block,
                enqueue_timeout: Duration::from_millis(20),
            },
            batch: BatchConfig {
                max_points: 1_000,
                max_wait: Duration::from_secs(3600),
                max_in_flight_batches: 1,
            },
            ..Default::default()
        };
        let metrics = Arc::new(PipelineMetrics::new());
        let pipeline = Pipeline::start(
            config,
            NullInflux,
            Arc::new(MemoryDeadLetterSink::new()),
            metrics.clone(),
        );
        let router = create_router(AppState {
            pipeline: pipeline.handle(),
            metrics: metrics.clone(),
        });
        (pipeline, router, metrics)
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_string(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_write_accepted() {
        let (pipeline, router, metrics) = start(100);

        let body = "miner,entity_id=m1 height=1200i,online=true 1700000000\n\
                    miner,entity_id=m2 height=1201i 1700000001";
        let response = router
            .oneshot(post("/api/v2/write?precision=s", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(metrics.snapshot().points_ingested, 2);

        let report = pipeline.shutdown().await;
        assert_eq!(report.lost_points, 0);
        assert_eq!(metrics.snapshot().points_written, 2);
    }

    #[tokio::test]
    async fn test_write_rejects_bad_input() {
        let (pipeline, router, _) = start(100);

        let response = router
            .clone()
            .oneshot(post("/write", "miner height=\n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_string(response).await.contains("line 1"));

        let response = router
            .oneshot(post("/write?precision=fortnights", "m v=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_backpressure_is_503() {
        let (pipeline, router, _) = start(2);

        let response = router
            .oneshot(post("/write", "m v=1 1\nm v=2 2\nm v=3 3\n"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_string(response).await;
        assert!(body.contains("\"accepted\":2"));

        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_after_shutdown_is_503() {
        let (pipeline, router, _) = start(10);
        pipeline.shutdown().await;

        let response = router.oneshot(post("/write", "m v=1 1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_stats_and_metrics() {
        let (pipeline, router, _) = start(10);
        let response = router
            .clone()
            .oneshot(post("/write", "m v=1 1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = router.clone().oneshot(get("/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stats: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(stats["pipeline"]["buffered"], 1);
        assert_eq!(stats["pipeline"]["circuit"], "closed");
        assert_eq!(stats["metrics"]["points_ingested"], 1);

        let response = router.clone().oneshot(get("/metrics")).await.unwrap();
        let text = body_string(response).await;
        assert!(text.contains("bridge_points_ingested_total 1\n"));
        assert!(text.contains("bridge_buffer_points 1\n"));
        assert!(text.contains("bridge_circuit_transitions_total{to=\"open\"} 0\n"));

        let response = router.oneshot(get("/health")).await.unwrap();
        assert!(body_string(response).await.contains("\"status\":\"ok\""));

        pipeline.shutdown().await;
    }
}
