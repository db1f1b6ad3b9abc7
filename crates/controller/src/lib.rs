pub mod addressing;
pub mod app_state;
pub mod backend;
pub mod checksum;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod http;
pub mod keys;
pub mod metrics;
pub mod persistence;
pub mod pki;
pub mod services;
pub mod status;
pub mod tasks;
pub mod telemetry;
pub mod version;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{env, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::app_state::AppState;
use crate::backend::{BackendRegistry, DsaPolicy};
use crate::checksum::ChecksumCache;
use crate::context::{ContextFunctions, ContextResolver};
use crate::events::{EventBus, TracingEventHandler};
use crate::metrics::{init_metrics_recorder, record_build_info};
use crate::pki::{OpensslDhGenerator, RcgenIssuer};
use crate::tasks::{RetryPolicy, TaskMode, TaskRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    Serve,
    MigrationsDryRun,
}

pub fn parse_command() -> Result<CommandMode> {
    let mut args = env::args().skip(1);
    let Some(first) = args.next() else {
        return Ok(CommandMode::Serve);
    };

    match first.as_str() {
        "--migrations-dry-run" | "migrations-dry-run" => Ok(CommandMode::MigrationsDryRun),
        "migrate" => match args.next().as_deref() {
            Some("--dry-run") | Some("dry-run") => Ok(CommandMode::MigrationsDryRun),
            _ => anyhow::bail!("unknown migrate option; use --dry-run"),
        },
        "--help" | "-h" => {
            println!(
                "Usage: devconf-controller [--migrations-dry-run]|[migrate --dry-run]\n\
                 Run without arguments to start the server."
            );
            std::process::exit(0);
        }
        other => anyhow::bail!("unknown argument: {other}"),
    }
}

/// Boot the controller using the provided command mode.
pub async fn run(mode: CommandMode) -> Result<()> {
    run_with_shutdown(mode, ContextFunctions::new(), shutdown_signal()).await
}

/// Wire the long-lived components described by the configuration.
/// `functions` contribute per-device variables after the VPN scope.
pub fn build_state(
    app_config: &config::AppConfig,
    db: persistence::Db,
    metrics_handle: PrometheusHandle,
    functions: ContextFunctions,
) -> Result<AppState> {
    let backends = BackendRegistry::with_defaults(DsaPolicy::from_config(&app_config.dsa)?)?;
    info!(
        backends = ?backends.ids().collect::<Vec<_>>(),
        "configuration backends registered"
    );
    info!(
        functions = ?functions.names().collect::<Vec<_>>(),
        "context functions registered"
    );

    Ok(AppState {
        db,
        registration: app_config.registration.clone(),
        vpn: app_config.vpn.clone(),
        limits: app_config.limits.clone(),
        backends: Arc::new(backends),
        context: Arc::new(ContextResolver::from_config(app_config, functions)),
        checksums: ChecksumCache::new(Duration::from_secs(app_config.checksum.cache_ttl_secs)),
        events: EventBus::with_handler(Arc::new(TracingEventHandler)),
        cert_issuer: Arc::new(RcgenIssuer),
        dh_generator: Arc::new(OpensslDhGenerator),
        tasks: TaskRunner::new(TaskMode::Spawn, RetryPolicy::from_config(&app_config.tasks)),
        metrics_handle,
    })
}

pub async fn run_with_shutdown<S>(
    mode: CommandMode,
    functions: ContextFunctions,
    shutdown: S,
) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let metrics_handle = init_metrics_recorder();

    let db_pool = persistence::migrations::init_pool(&app_config.database.url).await?;
    if mode == CommandMode::MigrationsDryRun
        || (app_config.features.migrations_dry_run_on_start && mode == CommandMode::Serve)
    {
        let snapshot = persistence::migrations::dry_run_migrations(&db_pool).await?;
        info!(
            current_version = snapshot.latest_applied,
            target_version = snapshot.latest_available,
            pending = snapshot.pending.len(),
            "migration dry-run completed"
        );
        if mode == CommandMode::MigrationsDryRun {
            return Ok(());
        }
    }

    let migration_outcome = persistence::migrations::run_migrations(&db_pool).await?;
    if migration_outcome.applied.is_empty() {
        info!(
            current_version = migration_outcome.snapshot.latest_applied,
            target_version = migration_outcome.snapshot.latest_available,
            "database schema is up to date"
        );
    } else {
        for mig in &migration_outcome.applied {
            info!(
                version = mig.version,
                description = mig.description,
                "applied database migration"
            );
        }
    }
    record_build_info(&migration_outcome.snapshot);

    let state = build_state(&app_config, db_pool, metrics_handle, functions)?;

    let api_addr: SocketAddr = format!("{}:{}", app_config.server.host, app_config.server.port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid listen address: {}", err))?;
    let metrics_addr: SocketAddr =
        format!("{}:{}", app_config.metrics.host, app_config.metrics.port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {}", err))?;

    let app: Router = http::build_router(state.clone()).with_state(state.clone());
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let metrics_app: Router = http::build_metrics_router().with_state(state.clone());
    let metrics_service = metrics_app.into_make_service_with_connect_info::<SocketAddr>();

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%api_addr, "controller listening");
    info!(%metrics_addr, "controller metrics listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    let mut api_shutdown = shutdown_rx.clone();
    let mut metrics_shutdown = shutdown_rx.clone();

    let mut api_task = tokio::spawn(async move {
        axum::serve(api_listener, make_service)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await
    });

    let mut metrics_task = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_service)
            .with_graceful_shutdown(async move {
                let _ = metrics_shutdown.changed().await;
            })
            .await
    });

    tokio::select! {
        res = &mut api_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("controller task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("controller server failed: {err}"))?;
        }
        res = &mut metrics_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("controller metrics task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("controller metrics server failed: {err}"))?;
        }
    }

    if !api_task.is_finished() {
        api_task
            .await
            .map_err(|err| anyhow::anyhow!("controller task failed: {err}"))?
            .map_err(|err| anyhow::anyhow!("controller server failed: {err}"))?;
    }
    if !metrics_task.is_finished() {
        metrics_task
            .await
            .map_err(|err| anyhow::anyhow!("controller metrics task failed: {err}"))?
            .map_err(|err| anyhow::anyhow!("controller metrics server failed: {err}"))?;
    }

    Ok(())
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
}
