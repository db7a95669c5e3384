//! Configuration for the MySQL-to-PostgreSQL translating proxy.
//!
//! Parsed from a single TOML file; globally available through an
//! atomically-swappable handle so a future reload does not require
//! restarting client tasks.

use arc_swap::ArcSwap;
use log::info;
use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::errors::Error;

#[cfg(test)]
mod tests;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Globally available configuration.
static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Configuration wrapper.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: Server,

    #[serde(default)]
    pub postgres: Postgres,

    #[serde(default)]
    pub schema_cache: SchemaCache,

    #[serde(default)]
    pub sql_rewrite: SqlRewrite,

    #[serde(default)]
    pub observability: Observability,
}

/// MySQL-facing listener settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Server {
    #[serde(default = "Server::default_host")]
    pub host: String,

    #[serde(default = "Server::default_port")]
    pub port: u16,

    /// Version string advertised in the protocol 10 greeting. Clients sniff
    /// this for feature detection, so it must look like a MySQL 8 build.
    #[serde(default = "Server::default_version")]
    pub version: String,

    /// Bounds command-read to response-flush, in milliseconds. 0 disables.
    #[serde(default = "Server::default_command_timeout")]
    pub command_timeout: u64,

    #[serde(default = "Server::default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    #[serde(default = "Server::default_worker_threads")]
    pub worker_threads: usize,
}

impl Server {
    pub fn default_host() -> String {
        "0.0.0.0".into()
    }

    pub fn default_port() -> u16 {
        3306
    }

    pub fn default_version() -> String {
        format!("8.0.35-aproxy-{VERSION}")
    }

    pub fn default_command_timeout() -> u64 {
        0
    }

    pub fn default_shutdown_timeout() -> u64 {
        10_000
    }

    pub fn default_worker_threads() -> usize {
        num_cpus::get().clamp(2, 8)
    }
}

impl Default for Server {
    fn default() -> Server {
        Server {
            host: Self::default_host(),
            port: Self::default_port(),
            version: Self::default_version(),
            command_timeout: Self::default_command_timeout(),
            shutdown_timeout: Self::default_shutdown_timeout(),
            worker_threads: Self::default_worker_threads(),
        }
    }
}

/// When a leased backend connection returns to the pool.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    #[default]
    Session,
    Transaction,
    Statement,
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionMode::Session => write!(f, "session"),
            ConnectionMode::Transaction => write!(f, "transaction"),
            ConnectionMode::Statement => write!(f, "statement"),
        }
    }
}

/// Backend PostgreSQL settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Postgres {
    #[serde(default = "Postgres::default_host")]
    pub host: String,

    #[serde(default = "Postgres::default_port")]
    pub port: u16,

    #[serde(default)]
    pub database: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "Postgres::default_sslmode")]
    pub sslmode: String,

    #[serde(default = "Postgres::default_max_pool_size")]
    pub max_pool_size: usize,

    #[serde(default)]
    pub connection_mode: ConnectionMode,

    #[serde(default = "Postgres::default_connect_timeout")]
    pub connect_timeout: u64,

    /// How long an `acquire` waits on a saturated pool before failing with
    /// the pool-exhausted error, in milliseconds.
    #[serde(default = "Postgres::default_acquire_timeout")]
    pub acquire_timeout: u64,
}

impl Postgres {
    pub fn default_host() -> String {
        "127.0.0.1".into()
    }

    pub fn default_port() -> u16 {
        5432
    }

    pub fn default_sslmode() -> String {
        "disable".into()
    }

    pub fn default_max_pool_size() -> usize {
        20
    }

    pub fn default_connect_timeout() -> u64 {
        3_000
    }

    pub fn default_acquire_timeout() -> u64 {
        5_000
    }
}

impl Default for Postgres {
    fn default() -> Postgres {
        Postgres {
            host: Self::default_host(),
            port: Self::default_port(),
            database: String::default(),
            user: String::default(),
            password: String::default(),
            sslmode: Self::default_sslmode(),
            max_pool_size: Self::default_max_pool_size(),
            connection_mode: ConnectionMode::default(),
            connect_timeout: Self::default_connect_timeout(),
            acquire_timeout: Self::default_acquire_timeout(),
        }
    }
}

/// Backend schema snapshot cache, consulted by the rewriter.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SchemaCache {
    #[serde(default = "SchemaCache::default_enabled")]
    pub enabled: bool,

    /// Entry time-to-live in milliseconds.
    #[serde(default = "SchemaCache::default_ttl")]
    pub ttl: u64,

    #[serde(default = "SchemaCache::default_max_entries")]
    pub max_entries: usize,
}

impl SchemaCache {
    pub fn default_enabled() -> bool {
        true
    }

    pub fn default_ttl() -> u64 {
        30_000
    }

    pub fn default_max_entries() -> usize {
        1024
    }
}

impl Default for SchemaCache {
    fn default() -> SchemaCache {
        SchemaCache {
            enabled: Self::default_enabled(),
            ttl: Self::default_ttl(),
            max_entries: Self::default_max_entries(),
        }
    }
}

/// Dialect translation settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SqlRewrite {
    /// When false, SQL passes through verbatim and only placeholder syntax
    /// is translated.
    #[serde(default = "SqlRewrite::default_enabled")]
    pub enabled: bool,

    /// Log the full SQL text of statements that fail to rewrite.
    #[serde(default)]
    pub debug_sql: bool,
}

impl SqlRewrite {
    pub fn default_enabled() -> bool {
        true
    }
}

impl Default for SqlRewrite {
    fn default() -> SqlRewrite {
        SqlRewrite {
            enabled: Self::default_enabled(),
            debug_sql: false,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Observability {
    #[serde(default = "Observability::default_log_level")]
    pub log_level: String,

    /// One of `text`, `json`, `pretty`.
    #[serde(default = "Observability::default_log_format")]
    pub log_format: String,

    /// Strip bound parameter values from debug logs.
    #[serde(default = "Observability::default_redact_parameters")]
    pub redact_parameters: bool,

    #[serde(default = "Observability::default_metrics_host")]
    pub metrics_host: String,

    /// 0 disables the metrics/health endpoint.
    #[serde(default = "Observability::default_metrics_port")]
    pub metrics_port: u16,
}

impl Observability {
    pub fn default_log_level() -> String {
        "info".into()
    }

    pub fn default_log_format() -> String {
        "text".into()
    }

    pub fn default_redact_parameters() -> bool {
        true
    }

    pub fn default_metrics_host() -> String {
        "0.0.0.0".into()
    }

    pub fn default_metrics_port() -> u16 {
        9127
    }
}

impl Default for Observability {
    fn default() -> Observability {
        Observability {
            log_level: Self::default_log_level(),
            log_format: Self::default_log_format(),
            redact_parameters: Self::default_redact_parameters(),
            metrics_host: Self::default_metrics_host(),
            metrics_port: Self::default_metrics_port(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.postgres.database.is_empty() {
            return Err(Error::BadConfig("postgres.database is required".into()));
        }
        if self.postgres.user.is_empty() {
            return Err(Error::BadConfig("postgres.user is required".into()));
        }
        if self.postgres.max_pool_size == 0 {
            return Err(Error::BadConfig(
                "postgres.max_pool_size must be at least 1".into(),
            ));
        }
        match self.postgres.sslmode.as_str() {
            "disable" | "prefer" | "require" => {}
            other => {
                return Err(Error::BadConfig(format!(
                    "postgres.sslmode {other:?} is not one of disable/prefer/require"
                )))
            }
        }
        match self.observability.log_format.as_str() {
            "text" | "json" | "pretty" => {}
            other => {
                return Err(Error::BadConfig(format!(
                    "observability.log_format {other:?} is not one of text/json/pretty"
                )))
            }
        }
        Ok(())
    }

    pub fn show(&self) {
        info!("listening on {}:{}", self.server.host, self.server.port);
        info!(
            "backend postgres://{}@{}:{}/{} (sslmode={})",
            self.postgres.user,
            self.postgres.host,
            self.postgres.port,
            self.postgres.database,
            self.postgres.sslmode
        );
        info!(
            "pool: size={} mode={} acquire_timeout={}ms",
            self.postgres.max_pool_size, self.postgres.connection_mode, self.postgres.acquire_timeout
        );
        info!(
            "schema cache: enabled={} ttl={}ms max_entries={}",
            self.schema_cache.enabled, self.schema_cache.ttl, self.schema_cache.max_entries
        );
        info!(
            "sql rewrite: enabled={} debug_sql={}",
            self.sql_rewrite.enabled, self.sql_rewrite.debug_sql
        );
        if self.observability.metrics_port != 0 {
            info!(
                "metrics on {}:{}",
                self.observability.metrics_host, self.observability.metrics_port
            );
        }
    }
}

pub fn parse_config(contents: &str) -> Result<Config, Error> {
    let config: Config =
        toml::from_str(contents).map_err(|err| Error::BadConfig(format!("TOML parse error: {err}")))?;
    config.validate()?;
    Ok(config)
}

/// Read, parse and install the configuration from a file.
pub async fn load_config(path: &str) -> Result<Config, Error> {
    let mut contents = String::new();
    let mut file = File::open(path)
        .await
        .map_err(|err| Error::BadConfig(format!("could not open {path:?}: {err}")))?;
    file.read_to_string(&mut contents)
        .await
        .map_err(|err| Error::BadConfig(format!("could not read {path:?}: {err}")))?;

    let config = parse_config(&contents)?;
    set_config(config.clone());
    Ok(config)
}

pub fn get_config() -> Arc<Config> {
    CONFIG.load_full()
}

pub fn set_config(config: Config) {
    CONFIG.store(Arc::new(config));
}
