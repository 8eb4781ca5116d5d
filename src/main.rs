//! SchemaFlow Runner - database change pipeline backend
//!
//! Executes pipeline tasks (database creation, schema migrations) against
//! registered PostgreSQL and MySQL instances and keeps the catalog of
//! databases and their schemas in sync with what is actually on the servers.
//!
//! Background loops:
//! - Scheduler: claims pending tasks and drives their executors
//! - Schema sync: periodically mirrors every instance into the store
//!
//! A small read-only HTTP API exposes task and schema status.

mod config;
mod driver;
mod error;
mod migration;
mod models;
mod routes;
mod schema;
mod state;
mod store;
mod sync;
mod task;

use crate::config::{LogFormat, SeedInstance, Settings};
use crate::driver::DriverRegistry;
use crate::error::AppError;
use crate::models::InstanceCreate;
use crate::routes::create_router;
use crate::state::AppState;
use crate::store::{MemoryStore, PgStore, Store};
use crate::sync::SchemaSyncer;
use crate::task::{ExecutorContext, ExecutorRegistry, Scheduler};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    init_tracing(settings.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "starting SchemaFlow runner");

    let store = init_store(&settings).await?;
    seed_instances(store.as_ref(), &settings.seed_instances).await?;

    let drivers = Arc::new(DriverRegistry::with_builtins(&settings.runner.metadata_database));
    info!(engines = ?drivers.engines(), "drivers registered");

    let ctx = Arc::new(ExecutorContext {
        store: store.clone(),
        drivers: drivers.clone(),
        release_version: settings.runner.release_version.clone(),
        require_issue_lineage: settings.runner.require_issue_lineage,
        pending_migration_timeout: settings.runner.pending_migration_timeout,
    });
    let scheduler = Scheduler::new(
        ctx,
        Arc::new(ExecutorRegistry::with_builtins()),
        settings.scheduler.clone(),
    );
    let syncer = SchemaSyncer::new(store.clone(), drivers, settings.sync_interval);

    let cancel = CancellationToken::new();
    let scheduler_loop = tokio::spawn(scheduler.clone().run(cancel.clone()));
    let sync_loop = tokio::spawn(syncer.run(cancel.clone()));

    let state = Arc::new(AppState::new(store, scheduler));
    let app = create_router(state, &settings.cors);

    let addr = SocketAddr::from((settings.server.host, settings.server.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "status API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Running tasks see the cancellation and fail with "Execution cancelled"
    cancel.cancel();
    for (name, handle) in [("scheduler", scheduler_loop), ("schema sync", sync_loop)] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "background loop panicked");
        }
    }

    info!("runner stopped");
    Ok(())
}

/// Initialize tracing subscriber with environment filter
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,schemaflow_runner=debug,tower_http=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init(),
    }
}

/// PostgreSQL store when `DATABASE_URL` is set, in-memory otherwise
async fn init_store(settings: &Settings) -> anyhow::Result<Arc<dyn Store>> {
    match &settings.store {
        Some(config) => {
            let store = PgStore::connect(&config.url, config.max_connections).await?;
            store.bootstrap().await?;
            info!(max_connections = config.max_connections, "metadata store ready");
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set, using the in-memory store; state is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Register `SEED_INSTANCES`; instances already present are left as they are
async fn seed_instances(store: &dyn Store, seeds: &[SeedInstance]) -> anyhow::Result<()> {
    for seed in seeds {
        let create = InstanceCreate {
            name: seed.name.clone(),
            environment_id: seed.environment_id,
            environment_name: seed.environment_name.clone(),
            connection: seed.connection.clone(),
        };
        match store.create_instance(&create).await {
            Ok(instance) => info!(
                instance = %instance.name,
                connection = %seed.connection.to_display_string(),
                "instance registered"
            ),
            Err(AppError::Conflict(_)) => info!(instance = %seed.name, "instance already registered"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
