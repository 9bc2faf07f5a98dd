//! meshperf -- pairwise throughput and latency probing across a cluster.
//!
//! Every node runs the probe server: a `/perf` flood sink and a `/dispatch`
//! endpoint that floods a list of targets on a coordinator's behalf. The
//! prober walks a descending ladder of (payload size, thread count) tiers and
//! keeps the first one the link sustains.

pub mod analysis;
pub mod api;
pub mod config;
pub mod dispatch;
pub mod flood;
pub mod net;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::{LoggingConfig, ProbeConfig};

/// Install the global tracing subscriber. `RUST_LOG` overrides the configured
/// level.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = installed {
        eprintln!("tracing already initialized: {}", e);
    }
}

/// Process-wide shutdown token, cancelled on SIGINT or SIGTERM.
pub fn shutdown_token() -> Result<CancellationToken> {
    let token = CancellationToken::new();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            }
            trigger.cancel();
        });
    }

    #[cfg(not(unix))]
    {
        let trigger = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received Ctrl-C, shutting down");
            }
            trigger.cancel();
        });
    }

    Ok(token)
}

/// Run the probe server until `shutdown` is cancelled.
pub async fn serve(config: ProbeConfig, shutdown: CancellationToken) -> Result<()> {
    config.validate()?;
    let addr = config.network.listen_address();

    let state = api::state::AppState::new(config, shutdown.clone())?;
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(%addr, "meshperf probe server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("probe server failed")?;

    tracing::info!("probe server stopped");
    Ok(())
}
