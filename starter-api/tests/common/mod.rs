#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common_database::{
    AppliedMigration, Client, DatabaseError, MigrateError, Migration, MigrationStore, SqlxError,
};
use lifecycle::ServerState;
use starter_api::config::ServiceConfig;
use tokio::sync::watch;

/// Database stand-in: healthy unless given a failure message. Records every close
/// together with the lifecycle state seen at that moment, if it was given one to watch.
pub struct FakeDatabase {
    fail_with: Option<String>,
    state: Option<watch::Receiver<ServerState>>,
    pub pings: AtomicUsize,
    closes: Mutex<Vec<Option<ServerState>>>,
}

impl FakeDatabase {
    fn build(fail_with: Option<String>, state: Option<watch::Receiver<ServerState>>) -> Arc<Self> {
        Arc::new(Self {
            fail_with,
            state,
            pings: AtomicUsize::new(0),
            closes: Mutex::new(Vec::new()),
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::build(None, None)
    }

    pub fn failing(msg: &str) -> Arc<Self> {
        Self::build(Some(msg.to_owned()), None)
    }

    pub fn watching(state: watch::Receiver<ServerState>) -> Arc<Self> {
        Self::build(None, Some(state))
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> Vec<Option<ServerState>> {
        self.closes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Client for FakeDatabase {
    async fn ping(&self) -> Result<(), DatabaseError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            None => Ok(()),
            Some(msg) => Err(DatabaseError::PingFailed(SqlxError::Protocol(msg.clone()))),
        }
    }

    async fn close(&self) -> bool {
        let seen = self.state.as_ref().map(|rx| *rx.borrow());
        let mut closes = self.closes.lock().unwrap();
        closes.push(seen);
        closes.len() == 1
    }
}

/// In-memory migration bookkeeping; fails on `fail_on` if set.
#[derive(Default)]
pub struct MemoryStore {
    fail_on: Option<i64>,
    applied: Mutex<BTreeMap<i64, Migration>>,
}

impl MemoryStore {
    pub fn failing_on(version: i64) -> Self {
        Self {
            fail_on: Some(version),
            ..Self::default()
        }
    }

    pub fn applied_versions(&self) -> Vec<i64> {
        self.applied.lock().unwrap().keys().copied().collect()
    }
}

#[async_trait]
impl MigrationStore for MemoryStore {
    async fn prepare(&self) -> Result<(), MigrateError> {
        Ok(())
    }

    async fn applied(&self) -> Result<Vec<AppliedMigration>, MigrateError> {
        Ok(self
            .applied
            .lock()
            .unwrap()
            .values()
            .map(|m| AppliedMigration {
                version: m.version,
                checksum: m.checksum.clone(),
            })
            .collect())
    }

    async fn apply(&self, migration: &Migration) -> Result<(), MigrateError> {
        if self.fail_on == Some(migration.version) {
            return Err(MigrateError::ExecuteMigration(
                SqlxError::Protocol("relation does not exist".to_owned()),
                migration.version,
            ));
        }
        self.applied
            .lock()
            .unwrap()
            .insert(migration.version, migration.clone());
        Ok(())
    }
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

pub fn service_config(port: u16, grace: Duration) -> ServiceConfig {
    ServiceConfig {
        listen_host: Ipv4Addr::LOCALHOST.into(),
        listen_port: port,
        read_timeout: Duration::from_secs(10),
        write_timeout: Duration::from_secs(10),
        idle_timeout: Duration::from_secs(60),
        shutdown_grace_period: grace,
    }
}

/// True if `addr` can be bound, i.e. nobody else holds it.
pub fn port_is_free(addr: SocketAddr) -> bool {
    std::net::TcpListener::bind(addr).is_ok()
}
