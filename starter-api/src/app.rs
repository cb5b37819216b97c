//! Startup sequencing: open the pool, migrate, then hand the listener to the
//! lifecycle manager. The pool is closed exactly once, after the listener is gone.

use std::sync::Arc;

use common_database::{
    migration_store, open, run_migrations, DatabaseError, Dialect, MigrationError,
    MigrationSet, MigrationStore, PostgresClient,
};
use health::HealthReporter;
use lifecycle::{LifecycleError, Manager, ShutdownReport};
use thiserror::Error;

use crate::config::{Config, ServiceConfig};
use crate::migrations;
use crate::router::router;
use crate::server;

pub const SERVICE_NAME: &str = "starter-api";

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Run the service to completion with a manager that traps SIGINT/SIGTERM.
pub async fn run(config: &Config, service: ServiceConfig) -> Result<ShutdownReport, StartupError> {
    let manager = Manager::builder(SERVICE_NAME)
        .with_shutdown_grace_period(service.shutdown_grace_period)
        .build();
    run_with_manager(manager, config, service).await
}

/// Same as [`run`], with a caller-supplied manager (tests drive shutdown through its handle).
pub async fn run_with_manager(
    manager: Manager,
    config: &Config,
    service: ServiceConfig,
) -> Result<ShutdownReport, StartupError> {
    let dialect: Dialect = config.migration_dialect.parse()?;
    let migrations = migrations::bundled()?;
    let handle = open(
        &config.dsn(),
        config.max_pg_connections,
        config.database_timeouts(),
    )?;
    let store = migration_store(dialect, handle.pool().clone());

    run_with_database(manager, Arc::new(handle), store.as_ref(), &migrations, service).await
}

/// Migrate through `store`, serve until the manager stops, then close `database`.
/// The close happens once on every path, including a failed migration.
pub async fn run_with_database(
    manager: Manager,
    database: PostgresClient,
    store: &dyn MigrationStore,
    migrations: &MigrationSet,
    service: ServiceConfig,
) -> Result<ShutdownReport, StartupError> {
    let result = migrate_and_serve(manager, database.clone(), store, migrations, service).await;
    database.close().await;
    result
}

async fn migrate_and_serve(
    manager: Manager,
    database: PostgresClient,
    store: &dyn MigrationStore,
    migrations: &MigrationSet,
    service: ServiceConfig,
) -> Result<ShutdownReport, StartupError> {
    run_migrations(store, migrations).await?;

    let reporter = HealthReporter::new("database", database);
    let app = router(reporter, service.write_timeout);

    let shutdown = manager.shutdown_signal();
    let report = manager
        .serve(server::serve(service, app, shutdown))
        .await?;
    Ok(report)
}
