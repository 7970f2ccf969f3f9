use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use content_gateway::config::GatewayConfig;
use content_gateway::health::HealthChecker;
use content_gateway::http::{self, AppState};
use content_gateway::net::tls::load_acceptor;
use content_gateway::net::{ConnectionRegistry, StreamTimeouts};
use content_gateway::prefetch::{DataPrefetcher, HttpDataSource};
use content_gateway::scheduler::spawn_cron;
use content_gateway::shutdown::ShutdownController;
use content_gateway::shutdown::signals::spawn_signal_listener;
use content_gateway::webhook::Notifier;
use content_gateway::{store, supervisor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let started_at = Instant::now();

    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let log_dir = std::env::var_os(GatewayConfig::LOG_DIR_VAR);
    let _log_guard = init_tracing(log_dir.as_deref().map(Path::new));

    let config = GatewayConfig::from_env();
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        workers = config.pool.worker_count,
        upstream = %config.upstream.base_url,
        "Starting content gateway"
    );

    // ── Storage & prefetching ────────────────────────────────────────────
    let store = store::open(&config.store)
        .await
        .context("Failed to open key/value store")?;
    let source = Arc::new(HttpDataSource::new(&config.upstream));
    let prefetcher = DataPrefetcher::new(config.pool.clone(), source, Arc::clone(&store));

    // ── Health checks ────────────────────────────────────────────────────
    let notifier = Notifier::new(config.webhook.clone());
    if !notifier.is_enabled() {
        tracing::info!("No webhook or PagerDuty target configured, alerts are log-only");
    }
    let checker = HealthChecker::new(config.health.clone(), notifier);
    let health_task = match spawn_cron("healthcheck", &config.health.schedule, move || {
        let checker = checker.clone();
        async move {
            checker.run_health_check().await;
            Ok::<(), Infallible>(())
        }
    }) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "Failed to schedule health check");
            std::process::exit(1);
        }
    };

    // ── Listeners ────────────────────────────────────────────────────────
    let registry = ConnectionRegistry::new();
    let timeouts = StreamTimeouts {
        keep_alive: config.listener.keep_alive_timeout,
        headers: config.listener.headers_timeout,
    };
    let idle = registry.clone();
    let controller = ShutdownController::new(config.shutdown.clone(), timeouts, registry)
        .with_pre_shutdown(move || async move {
            let closed = idle.close_idle();
            tracing::info!(closed, "Closing idle connections");
        });

    let plain_addr = config.listener.plain_addr();
    controller
        .bind(plain_addr, None)
        .await
        .with_context(|| format!("Failed to bind {plain_addr}"))?;

    if let Some(tls) = &config.listener.tls {
        let acceptor = load_acceptor(&tls.cert_path, &tls.key_path)?;
        let secure_addr = SocketAddr::new(config.listener.host, tls.port);
        controller
            .bind(secure_addr, Some(acceptor))
            .await
            .with_context(|| format!("Failed to bind {secure_addr}"))?;
    }

    supervisor::notify_ready().await;

    let control = config
        .supervisor
        .stdin_control
        .then(supervisor::control_messages);
    let signals = spawn_signal_listener(controller.clone(), control);

    let app = http::routes(AppState {
        store,
        prefetcher: prefetcher.clone(),
        shutdown: controller.clone(),
        started_at,
    });
    controller.serve(app).await;

    // ── Teardown ─────────────────────────────────────────────────────────
    health_task.abort();
    prefetcher.shutdown().await;
    let _ = signals.await;

    tracing::info!(
        uptime_secs = started_at.elapsed().as_secs(),
        "Shutdown complete"
    );
    Ok(())
}

/// Stderr logging, plus daily-rolling files when `log_dir` is set. The
/// returned guard flushes the file writer on drop.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "content-gateway.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
