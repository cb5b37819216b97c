//! Versioned schema migrations on top of sqlx's migrator. Scripts run in ascending
//! version order; the Postgres store applies each one in its own transaction together
//! with the row that records it, so a script is either fully applied and recorded or
//! not applied at all. Already-applied scripts are checked against their checksum.

use std::borrow::Cow;
use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::migrate::{AppliedMigration, Migrate, MigrateError, Migration, Migrator};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("db:migrate:set-dialect: unsupported dialect {0:?}")]
    DialectUnsupported(String),

    #[error("duplicate migration version {0}")]
    DuplicateVersion(i64),

    #[error("db:migrate:up: migration {0} was changed after it was applied")]
    ChecksumMismatch(i64),

    #[error("db:migrate: {0}")]
    Store(#[source] MigrateError),

    #[error("db:migrate:up: migration {version} ({name}) failed: {source}")]
    MigrationFailed {
        version: i64,
        name: String,
        #[source]
        source: MigrateError,
    },
}

/// Database the version bookkeeping lives in. Only Postgres is supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
}

impl FromStr for Dialect {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pgx" => Ok(Dialect::Postgres),
            other => Err(MigrationError::DialectUnsupported(other.to_string())),
        }
    }
}

/// The store that tracks and applies migrations for `dialect`.
pub fn migration_store(dialect: Dialect, pool: PgPool) -> Box<dyn MigrationStore> {
    match dialect {
        Dialect::Postgres => Box::new(PgMigrationStore::new(pool)),
    }
}

/// Up-migrations in strictly ascending version order.
#[derive(Clone, Debug, Default)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl MigrationSet {
    pub fn new(migrations: Vec<Migration>) -> Result<Self, MigrationError> {
        let mut migrations: Vec<_> = migrations
            .into_iter()
            .filter(|m| !m.migration_type.is_down_migration())
            .collect();
        migrations.sort_by_key(|m| m.version);
        if let Some(pair) = migrations
            .windows(2)
            .find(|pair| pair[0].version == pair[1].version)
        {
            return Err(MigrationError::DuplicateVersion(pair[0].version));
        }
        Ok(Self { migrations })
    }

    /// Take the scripts embedded by `sqlx::migrate!`.
    pub fn from_migrator(migrator: &Migrator) -> Result<Self, MigrationError> {
        Self::new(migrator.iter().cloned().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }

    pub fn latest_version(&self) -> Option<i64> {
        self.migrations.last().map(|m| m.version)
    }
}

/// Where applied versions are tracked and scripts are executed.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    /// Create the version bookkeeping if it doesn't exist yet.
    async fn prepare(&self) -> Result<(), MigrateError>;

    async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrateError>;

    /// Run the script and record its version as one atomic unit.
    async fn apply(&self, migration: &Migration) -> Result<(), MigrateError>;
}

/// Bookkeeping in sqlx's `_sqlx_migrations` table.
pub struct PgMigrationStore {
    pool: PgPool,
}

impl PgMigrationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MigrationStore for PgMigrationStore {
    async fn prepare(&self) -> Result<(), MigrateError> {
        let mut conn = self.pool.acquire().await?;
        conn.ensure_migrations_table().await?;

        // A run interrupted mid-script leaves a dirty row; it needs fixing by hand.
        if let Some(version) = conn.dirty_version().await? {
            return Err(MigrateError::Dirty(version));
        }
        Ok(())
    }

    async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrateError> {
        let mut conn = self.pool.acquire().await?;
        conn.list_applied_migrations().await
    }

    async fn apply(&self, migration: &Migration) -> Result<(), MigrateError> {
        let mut conn = self.pool.acquire().await?;
        conn.apply(migration).await?;
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Versions applied by this run, in order.
    pub applied: Vec<i64>,
    /// Migrations found already recorded and left alone.
    pub skipped: usize,
    pub current_version: Option<i64>,
}

/// Apply every migration in `set` not yet recorded in `store`, in ascending order.
/// Stops at the first failing script; everything before it stays applied.
pub async fn run_migrations<S>(
    store: &S,
    set: &MigrationSet,
) -> Result<MigrationReport, MigrationError>
where
    S: MigrationStore + ?Sized,
{
    store.prepare().await.map_err(MigrationError::Store)?;

    let applied: HashMap<i64, Cow<'static, [u8]>> = store
        .applied()
        .await
        .map_err(MigrationError::Store)?
        .into_iter()
        .map(|m| (m.version, m.checksum))
        .collect();

    let mut report = MigrationReport::default();
    for migration in set.iter() {
        if let Some(checksum) = applied.get(&migration.version) {
            if *checksum != migration.checksum {
                error!(
                    version = migration.version,
                    name = %migration.description,
                    "db:migrate:up: applied migration was modified"
                );
                return Err(MigrationError::ChecksumMismatch(migration.version));
            }
            report.skipped += 1;
            report.current_version = Some(migration.version);
            continue;
        }

        if let Err(source) = store.apply(migration).await {
            error!(
                version = migration.version,
                name = %migration.description,
                error = %source,
                "db:migrate:up: migration failed, aborting run"
            );
            return Err(MigrationError::MigrationFailed {
                version: migration.version,
                name: migration.description.to_string(),
                source,
            });
        }

        info!(
            version = migration.version,
            name = %migration.description,
            "db:migrate:up: applied migration"
        );
        report.applied.push(migration.version);
        report.current_version = Some(migration.version);
    }

    info!(
        applied = report.applied.len(),
        skipped = report.skipped,
        current_version = ?report.current_version,
        target_version = ?set.latest_version(),
        "db:migrate:up: migrations applied successfully"
    );
    Ok(report)
}
