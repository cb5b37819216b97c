use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use common_database::{ConnectionSettings, DatabaseTimeouts, Dsn, DEFAULT_TIMEOUTS};
use envconfig::Envconfig;

/// Command line flags. Everything else comes from the environment, see [`Config`].
#[derive(Parser, Debug, Clone)]
#[command(name = "starter-api", version, about = "Migrates the database, then serves /health")]
pub struct Args {
    /// Port for the HTTP listener
    #[arg(long, env = "BIND_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Address for the HTTP listener
    #[arg(long, env = "BIND_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "localhost")]
    pub database_host: String,

    #[envconfig(default = "5432")]
    pub database_port: u16,

    #[envconfig(default = "postgres")]
    pub database_user: String,

    #[envconfig(default = "postgres")]
    pub database_password: String,

    #[envconfig(default = "postgres")]
    pub database_name: String,

    #[envconfig(default = "disable")]
    pub database_sslmode: String,

    // Takes precedence over the individual DATABASE_* fields when set.
    pub database_url: Option<String>,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(default = "5000")]
    pub pg_acquire_timeout_ms: u64,

    #[envconfig(default = "postgres")]
    pub migration_dialect: String,

    #[envconfig(default = "10")]
    pub read_timeout_secs: u64,

    #[envconfig(default = "10")]
    pub write_timeout_secs: u64,

    #[envconfig(default = "60")]
    pub idle_timeout_secs: u64,

    #[envconfig(default = "10")]
    pub shutdown_grace_period_secs: u64,

    #[envconfig(default = "false")]
    pub debug: bool,
}

impl Config {
    pub fn dsn(&self) -> Dsn {
        match &self.database_url {
            Some(url) if !url.trim().is_empty() => Dsn::Url(url.clone()),
            _ => Dsn::Settings(ConnectionSettings {
                host: self.database_host.clone(),
                port: self.database_port,
                user: self.database_user.clone(),
                password: self.database_password.clone(),
                database: self.database_name.clone(),
                ssl_mode: self.database_sslmode.clone(),
            }),
        }
    }

    pub fn database_timeouts(&self) -> DatabaseTimeouts {
        DatabaseTimeouts {
            acquire_timeout: Duration::from_millis(self.pg_acquire_timeout_ms),
            ..DEFAULT_TIMEOUTS
        }
    }

    pub fn service_config(&self, args: &Args) -> ServiceConfig {
        ServiceConfig {
            listen_host: args.host,
            listen_port: args.port,
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            write_timeout: Duration::from_secs(self.write_timeout_secs),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            shutdown_grace_period: Duration::from_secs(self.shutdown_grace_period_secs),
        }
    }
}

/// Listener settings, fixed for the life of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServiceConfig {
    pub listen_host: IpAddr,
    pub listen_port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub shutdown_grace_period: Duration,
}

impl ServiceConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_host, self.listen_port)
    }
}
