//! cangw entry point: wire configuration, backend, hub and server together.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cangw::backend;
use cangw::codec::CannelloniCodec;
use cangw::config::{AppConfig, LogFormat};
use cangw::core::metrics;
use cangw::hub::Hub;
use cangw::server::Server;

/// Bound on the graceful-shutdown cohort wait.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

fn setup_logging(cfg: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.as_filter()));
    match cfg.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Periodically log a metrics snapshot, for setups without a scraper.
fn start_metrics_logger(mut cancel: watch::Receiver<bool>, every: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.wait_for(|c| *c) => return,
                _ = tick.tick() => {}
            }
            let s = metrics::metrics().snapshot();
            info!(
                serial_rx = s.serial_rx,
                serial_tx = s.serial_tx,
                socketcan_rx = s.socketcan_rx,
                socketcan_tx = s.socketcan_tx,
                tcp_rx = s.tcp_rx,
                tcp_tx = s.tcp_tx,
                hub_dropped = s.hub_dropped,
                hub_kicked = s.hub_kicked,
                hub_rejected = s.hub_rejected,
                hub_clients = s.hub_active_clients,
                malformed = s.malformed_frames,
                errors = s.errors,
                "metrics"
            );
        }
    });
}

#[tokio::main]
async fn main() {
    let cfg = AppConfig::parse();
    if let Err(e) = cfg.validate() {
        eprintln!("configuration error: {e}");
        std::process::exit(2);
    }
    setup_logging(&cfg);

    let hub = Arc::new(Hub::with_config(cfg.hub_buffer, cfg.policy()));
    info!(policy = %hub.policy(), buffer = hub.out_buf_size(), "hub_config");

    let (cancel_tx, cancel) = watch::channel(false);

    if cfg.log_metrics_interval_ms > 0 {
        start_metrics_logger(
            cancel.clone(),
            Duration::from_millis(cfg.log_metrics_interval_ms),
        );
    }

    let mut backend = match backend::init_backend(cancel.clone(), &cfg, Arc::clone(&hub)).await {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, "backend_init_error");
            std::process::exit(1);
        }
    };
    let mut backend_rx = backend.take_rx_task().expect("fresh backend has an rx task");

    let server: Server<CannelloniCodec> = Server::new(
        cfg.server_config(),
        Arc::clone(&hub),
        CannelloniCodec,
        backend.sink(),
    );

    // Ready when the listener is bound and the gateway is not cancelled.
    {
        let server = server.clone();
        metrics::set_readiness_fn(move || server.is_ready());
    }

    let serve_task = {
        let server = server.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { server.serve(cancel).await })
    };

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown_signal");
        }
        res = &mut backend_rx => {
            // The RX loop only ends early on fatal device failure; the
            // supervisor restarts the process.
            error!(panicked = res.is_err(), "backend_rx_terminated");
        }
        res = serve_task => {
            match res {
                Ok(Err(e)) => error!(error = %e, "tcp_server_error"),
                Ok(Ok(())) => info!("tcp_server_stopped"),
                Err(e) => error!(error = %e, "tcp_server_panic"),
            }
            cancel_tx.send_replace(true);
            backend.close().await;
            return;
        }
    }

    cancel_tx.send_replace(true);
    if let Err(e) = server.shutdown(SHUTDOWN_TIMEOUT).await {
        error!(error = %e, "shutdown_error");
    }
    backend.close().await;
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
