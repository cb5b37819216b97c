use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use sqlx::{
    postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode},
    Connection,
};
use thiserror::Error;

mod migrate;

pub use sqlx::Error as SqlxError;

pub use migrate::{
    migration_store, run_migrations, Dialect, MigrationError, MigrationReport, MigrationSet,
    MigrationStore, PgMigrationStore,
};
pub use sqlx::migrate::{AppliedMigration, MigrateError, Migration, MigrationType, Migrator};

// Pool defaults for a single-listener service: connections are opened on first use,
// and a stuck acquire should fail the caller (health check, migration) rather than hang.
pub const DEFAULT_TIMEOUTS: DatabaseTimeouts = DatabaseTimeouts {
    acquire_timeout: Duration::from_secs(5),
    idle_timeout: Duration::from_secs(300),
    max_lifetime: Duration::from_secs(1800),
};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("db:open: {0}")]
    ConnectFailed(#[source] sqlx::Error),

    #[error(transparent)]
    PingFailed(sqlx::Error),

    #[error("database handle is closed")]
    Closed,
}

pub type PostgresClient = Arc<dyn Client + Send + Sync>;

/// What the rest of the service needs from the database handle.
/// Implemented by [`ConnectionHandle`]; tests substitute their own.
#[async_trait]
pub trait Client {
    /// Single liveness round-trip. Never retries.
    async fn ping(&self) -> Result<(), DatabaseError>;

    /// Close the underlying pool. Only the first call does anything; it returns true.
    async fn close(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct DatabaseTimeouts {
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

/// Discrete Postgres connection parameters, mirroring a libpq keyword/value DSN.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub ssl_mode: String,
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// Where to connect: either a full `postgres://` URL or discrete settings.
#[derive(Clone, Debug)]
pub enum Dsn {
    Url(String),
    Settings(ConnectionSettings),
}

impl Dsn {
    pub fn connect_options(&self) -> Result<PgConnectOptions, sqlx::Error> {
        match self {
            Dsn::Url(url) => PgConnectOptions::from_str(url),
            Dsn::Settings(settings) => {
                let ssl_mode = PgSslMode::from_str(&settings.ssl_mode)?;
                Ok(PgConnectOptions::new()
                    .host(&settings.host)
                    .port(settings.port)
                    .username(&settings.user)
                    .password(&settings.password)
                    .database(&settings.database)
                    .ssl_mode(ssl_mode))
            }
        }
    }
}

/// Build the pool for `dsn` without touching the network. Connections are established
/// (and therefore validated) on first use: the migration run or a health check.
pub fn open(
    dsn: &Dsn,
    max_connections: u32,
    timeouts: DatabaseTimeouts,
) -> Result<ConnectionHandle, DatabaseError> {
    let options = dsn.connect_options().map_err(DatabaseError::ConnectFailed)?;

    tracing::info!(
        host = options.get_host(),
        port = options.get_port(),
        database = options.get_database().unwrap_or_default(),
        max_connections,
        "db:open: connection pool created"
    );

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(timeouts.acquire_timeout)
        .test_before_acquire(true)
        .idle_timeout(timeouts.idle_timeout)
        .max_lifetime(timeouts.max_lifetime)
        .connect_lazy_with(options);

    Ok(ConnectionHandle::new(pool))
}

/// Shared handle over the connection pool. Clones share the pool and the closed flag,
/// so however many clones exist the pool is closed once.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    pool: PgPool,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn ping(&self) -> Result<(), DatabaseError> {
        if self.is_closed() {
            return Err(DatabaseError::Closed);
        }
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(DatabaseError::PingFailed)?;
        conn.ping().await.map_err(DatabaseError::PingFailed)
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    /// Returns false if the handle had already been closed.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::warn!("db:close: handle already closed, ignoring");
            return false;
        }
        self.pool.close().await;
        tracing::info!("db:close: connection pool closed");
        true
    }
}

#[async_trait]
impl Client for ConnectionHandle {
    async fn ping(&self) -> Result<(), DatabaseError> {
        ConnectionHandle::ping(self).await
    }

    async fn close(&self) -> bool {
        ConnectionHandle::close(self).await
    }
}
