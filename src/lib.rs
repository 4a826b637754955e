//! cronguard -- cron-scheduled, single-flight backup runner.
//!
//! This crate provides the core library: the dumper and its run guard,
//! bounded execution history, failure/digest notification, and the
//! orchestrator that ties them to a cron schedule.

pub mod api;
pub mod config;
pub mod dumper;
pub mod guard;
pub mod history;
pub mod notify;
pub mod scheduler;
pub mod stat;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dumper::ProcessDumper;
use crate::history::{HistoryStore, MemoryHistory, SqliteHistory};
use crate::notify::{EmailNotifier, LogNotifier, Notifier};
use crate::scheduler::Orchestrator;

/// Open the history store described by `config`. With history disabled an
/// in-memory store stands in so readers still get an empty snapshot.
pub fn open_history(config: &Config) -> Result<Arc<dyn HistoryStore>> {
    if config.retention < 0 {
        return Ok(Arc::new(MemoryHistory::new(0)));
    }

    std::fs::create_dir_all(&config.lib_path)
        .with_context(|| format!("failed to create {}", config.lib_path.display()))?;
    let db_path = config.db_path();
    tracing::info!(path = %db_path.display(), "Initializing history database");
    let store = SqliteHistory::open(&db_path, config.history_retention())
        .with_context(|| format!("failed to open history database {}", db_path.display()))?;
    Ok(Arc::new(store))
}

/// Wire the dumper, notifier and history store into an orchestrator.
pub fn build_orchestrator(config: &Config, history: Arc<dyn HistoryStore>) -> Result<Orchestrator> {
    let dumper = Arc::new(ProcessDumper::new(config.dump_settings()?));
    let notifier: Arc<dyn Notifier> = match config.email_settings() {
        Some(settings) => Arc::new(EmailNotifier::new(settings)),
        None => {
            tracing::info!("no email configured, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };
    Ok(Orchestrator::new(
        config.orchestrator_settings()?,
        dumper,
        notifier,
        history,
    ))
}

/// Start the cronguard daemon: scheduler plus optional health endpoints,
/// until SIGINT or SIGTERM.
pub async fn serve(config: Config) -> Result<()> {
    let history = open_history(&config)?;
    let orchestrator = build_orchestrator(&config, Arc::clone(&history))?;
    orchestrator.start().await?;

    let shutdown = CancellationToken::new();
    let server = match &config.http {
        Some(http) => {
            let addr = http.socket_addr()?;
            let app = api::router(api::state::AppState::new(Arc::clone(&history)));
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind {}", addr))?;
            tracing::info!(%addr, "cronguard listening");
            let token = shutdown.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(token.cancelled_owned())
                    .await
            }))
        }
        None => None,
    };

    shutdown_signal().await;
    tracing::info!("shutting down");

    shutdown.cancel();
    orchestrator.stop().await;
    if let Some(server) = server {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "http server failed"),
            Err(e) => tracing::error!(error = %e, "http server task failed"),
        }
    }
    if let Err(e) = history.close() {
        tracing::error!(error = %e, "failed to close history store");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
