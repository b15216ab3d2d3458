//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics   Prometheus text format
//!   GET /healthz   Liveness probe (always 200 if process is running)
//!   GET /readyz    Readiness probe (200 once the crypto provider passed its self-test)

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use hatsmith_transfer::{JobOutcome, JobReport};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};
use prometheus_client::registry::Registry;

use crate::daemon::AppState;

/// Daemon counters, cheap to clone (every field is an `Arc` inside).
#[derive(Clone, Default)]
pub struct Metrics {
    pub downloads_started: Counter,
    pub downloads_rejected: Counter,
    pub bytes_streamed: Counter,
    pub jobs_finished: Counter,
    pub jobs_failed: Counter,
    pub jobs_skipped: Counter,
    pub bytes_read: Counter,
    pub live_streams: Gauge,
}

impl Metrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "hatsmith_downloads_started",
            "Downloads attached to an output stream",
            self.downloads_started.clone(),
        );
        registry.register(
            "hatsmith_downloads_rejected",
            "Download requests refused because another download was streaming",
            self.downloads_rejected.clone(),
        );
        registry.register(
            "hatsmith_bytes_streamed",
            "Bytes sent to download consumers",
            self.bytes_streamed.clone(),
        );
        registry.register(
            "hatsmith_jobs_finished",
            "Jobs whose output was fully written",
            self.jobs_finished.clone(),
        );
        registry.register(
            "hatsmith_jobs_failed",
            "Jobs aborted with an error",
            self.jobs_failed.clone(),
        );
        registry.register(
            "hatsmith_jobs_skipped",
            "Jobs not started after an earlier failure",
            self.jobs_skipped.clone(),
        );
        registry.register(
            "hatsmith_bytes_read",
            "Input bytes consumed by finished jobs",
            self.bytes_read.clone(),
        );
        registry.register(
            "hatsmith_live_streams",
            "Output streams currently open",
            self.live_streams.clone(),
        );
    }

    pub fn record(&self, report: &JobReport) {
        match &report.outcome {
            JobOutcome::Finished { bytes_in, .. } => {
                self.jobs_finished.inc();
                self.bytes_read.inc_by(*bytes_in);
            }
            JobOutcome::Failed(_) => {
                self.jobs_failed.inc();
            }
            JobOutcome::Skipped => {
                self.jobs_skipped.inc();
            }
        }
    }
}

pub fn routes(with_metrics: bool) -> Router<AppState> {
    let router = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler));
    if with_metrics {
        router.route("/metrics", get(metrics_handler))
    } else {
        router
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state
        .metrics
        .live_streams
        .set(state.hub.live_streams() as i64);

    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// 503 until the provider self-test passed.
async fn readyz_handler(State(state): State<AppState>) -> impl IntoResponse {
    if state.provider.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "crypto provider not ready")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::router;
    use axum::body::Body;
    use axum::http::Request;
    use hatsmith_crypto::Provider;
    use hatsmith_transfer::{DownloadHub, KeyMaterial, TransferError, TransferJob};
    use secrecy::SecretString;
    use tower::ServiceExt;

    fn state(provider: Provider) -> AppState {
        AppState::new(DownloadHub::new(4, "encrypted_file.enc", None), provider)
    }

    async fn fetch(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_healthz() {
        let app = router(state(Provider::new()), "/api/download-file", true);
        assert_eq!(fetch(app, "/healthz").await, (StatusCode::OK, "ok".into()));
    }

    #[tokio::test]
    async fn test_readyz_follows_provider() {
        let provider = Provider::new();
        let app = router(state(provider.clone()), "/api/download-file", true);
        let (status, _) = fetch(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        provider.initialize().unwrap();
        let (status, _) = fetch(app, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
    }

    fn report(source: &str, outcome: JobOutcome) -> JobReport {
        let job = TransferJob::encrypt(
            source,
            KeyMaterial::Password(SecretString::from("unused-password".to_string())),
        );
        JobReport {
            id: job.id,
            source: job.source,
            output_name: job.output_name,
            direction: job.direction,
            outcome,
        }
    }

    #[tokio::test]
    async fn test_metrics_text() {
        let state = state(Provider::new());
        state.metrics.record(&report(
            "a.txt",
            JobOutcome::Finished {
                bytes_in: 10,
                bytes_out: 95,
                chunks: 1,
            },
        ));
        state
            .metrics
            .record(&report("b.txt", JobOutcome::Failed(TransferError::Truncated)));

        let app = router(state, "/api/download-file", true);
        let (status, body) = fetch(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("hatsmith_jobs_finished_total 1"), "{body}");
        assert!(body.contains("hatsmith_jobs_failed_total 1"), "{body}");
        assert!(body.contains("hatsmith_bytes_read_total 10"), "{body}");
        assert!(body.contains("hatsmith_live_streams 0"), "{body}");
    }

    #[tokio::test]
    async fn test_metrics_can_be_disabled() {
        let app = router(state(Provider::new()), "/api/download-file", false);
        let (status, _) = fetch(app, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
