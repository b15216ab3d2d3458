//! Daemon lifecycle: provider self-test, coordinator, HTTP server, job queue

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use hatsmith_core::config::HatsmithConfig;
use hatsmith_crypto::Provider;
use hatsmith_transfer::{
    spawn_coordinator, CoordinatorConfig, DownloadHub, JobOutcome, JobQueue, JobReport,
    QueueOptions, TransferJob,
};
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;

/// State shared by every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: DownloadHub,
    pub provider: Provider,
    pub metrics: Metrics,
    pub registry: Arc<Registry>,
}

impl AppState {
    pub fn new(hub: DownloadHub, provider: Provider) -> Self {
        let metrics = Metrics::default();
        let mut registry = Registry::default();
        metrics.register(&mut registry);
        Self {
            hub,
            provider,
            metrics,
            registry: Arc::new(registry),
        }
    }
}

pub fn router(state: AppState, download_path: &str, with_metrics: bool) -> Router {
    crate::bridge::routes(download_path)
        .merge(crate::metrics::routes(with_metrics))
        .with_state(state)
}

pub async fn run(config: HatsmithConfig, listen: String, jobs: Vec<TransferJob>) -> Result<()> {
    info!("daemon starting");
    let cancel = CancellationToken::new();

    let provider = Provider::new();

    let (handle, hub, coordinator) = spawn_coordinator(
        &CoordinatorConfig::from_config(&config),
        provider.clone(),
        cancel.clone(),
    );

    let state = AppState::new(hub, provider.clone());
    let metrics = state.metrics.clone();
    let app = router(state, &config.download.path, config.daemon.metrics);

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("bind {listen}"))?;
    info!(addr = %listen, path = %config.download.path, "download bridge listening");

    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    // /readyz answers 503 until this passes
    let self_test = provider.clone();
    tokio::task::spawn_blocking(move || self_test.initialize())
        .await
        .context("provider self-test task")?
        .context("crypto provider self-test")?;
    info!("crypto provider ready");
    notify_ready();

    let mut failed = 0usize;
    if jobs.is_empty() {
        drop(handle);
        info!("no files given; serving probes until interrupted");
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    } else {
        let total = jobs.len();
        let mut queue = JobQueue::new(handle, QueueOptions::from_config(&config))
            .with_progress(Box::new(|done: u64, total: u64, file: &str| {
                debug!(file, done, total, "progress")
            }))
            .with_reports(Box::new(move |report: &JobReport| {
                metrics.record(report);
                log_report(report);
            }));
        for job in jobs {
            info!(job_id = %job.id, file = %job.source.display(), output = %job.output_name, "job queued");
            queue.push(job);
        }

        tokio::select! {
            reports = queue.run() => {
                failed = reports
                    .iter()
                    .filter(|r| !matches!(r.outcome, JobOutcome::Finished { .. }))
                    .count();
                info!(total, failed, "queue drained");
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupted; aborting queue");
            }
        }
    }

    cancel.cancel();
    if let Err(e) = coordinator.await {
        warn!("coordinator task ended abnormally: {e}");
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("http server failed: {e}"),
        Err(e) => error!("http server task ended abnormally: {e}"),
    }
    info!("daemon stopped");

    if failed > 0 {
        anyhow::bail!("{failed} job(s) did not complete");
    }
    Ok(())
}

fn log_report(report: &JobReport) {
    match &report.outcome {
        JobOutcome::Finished {
            bytes_in,
            bytes_out,
            chunks,
        } => info!(
            job_id = %report.id,
            output = %report.output_name,
            bytes_in,
            bytes_out,
            chunks,
            "job finished"
        ),
        JobOutcome::Failed(e) => {
            error!(job_id = %report.id, file = %report.source.display(), error = %e, "job failed")
        }
        JobOutcome::Skipped => {
            warn!(job_id = %report.id, file = %report.source.display(), "job skipped")
        }
    }
}

fn notify_ready() {
    // sd_notify(READY=1) when run as a systemd service; no-op without $NOTIFY_SOCKET
    #[cfg(unix)]
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
