//! Configuration loading.
//!
//! Settings come from environment variables following the 12-factor
//! methodology. The table-to-relationship mapping itself lives in a JSON
//! file pointed at by `MAPPING_FILE`; see [`crate::mapping`].

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::Error;

/// All settings for a sync run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub sync: SyncConfig,
}

/// PostgreSQL connection settings.
///
/// Two sessions are opened from these: a plain one for the backfill queries
/// and a `replication=database` one for schema reflection and the WAL
/// stream.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
}

/// Sync behaviour settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncConfig {
    /// Path to the JSON mapping file.
    pub mapping_file: PathBuf,
    /// Maximum operations per sink write; zero disables batching.
    pub batch_size: usize,
    /// Seconds between standby status updates on the replication stream.
    pub keepalive_interval_secs: u64,
    /// Where to persist the acknowledged WAL position. Unset disables
    /// checkpointing and every run resumes from the reflected position.
    pub checkpoint_file: Option<PathBuf>,
    /// Address that serves Prometheus data.
    pub metrics_addr: SocketAddr,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// Required: `PG_DATABASE`, `PG_USERNAME`, `PG_PASSWORD`,
    /// `MAPPING_FILE`. Everything else has defaults.
    ///
    /// # Errors
    ///
    /// Returns `Err` if a required variable is missing or a value cannot be
    /// parsed.
    pub fn from_env() -> crate::Result<Self> {
        let postgres = PostgresConfig {
            host: env::var("PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("PG_PORT")
                .unwrap_or_else(|_| "5432".to_string())
                .parse::<u16>()
                .map_err(|_| Error::Config("PG_PORT must be a valid port number".to_string()))?,
            database: env::var("PG_DATABASE")
                .map_err(|_| Error::Config("PG_DATABASE is required".to_string()))?,
            username: env::var("PG_USERNAME")
                .map_err(|_| Error::Config("PG_USERNAME is required".to_string()))?,
            password: env::var("PG_PASSWORD")
                .map_err(|_| Error::Config("PG_PASSWORD is required".to_string()))?,
        };

        let sync = SyncConfig {
            mapping_file: env::var("MAPPING_FILE")
                .map(PathBuf::from)
                .map_err(|_| Error::Config("MAPPING_FILE is required".to_string()))?,
            batch_size: env::var("SYNC_BATCH_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse::<usize>()
                .unwrap_or(100),
            keepalive_interval_secs: env::var("REPLICATION_KEEPALIVE_INTERVAL_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse::<u64>()
                .unwrap_or(10),
            checkpoint_file: env::var("REPLICATION_CHECKPOINT_FILE")
                .ok()
                .map(PathBuf::from),
            metrics_addr: env::var("METRICS_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:9090".to_string())
                .parse::<SocketAddr>()
                .map_err(|_| {
                    Error::Config("METRICS_ADDR must be a valid socket address".to_string())
                })?,
        };

        Ok(Config { postgres, sync })
    }

    /// Constructs the PostgreSQL connection URL for plain sessions. The
    /// replication session appends its own parameter.
    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.postgres.username,
            self.postgres.password,
            self.postgres.host,
            self.postgres.port,
            self.postgres.database
        )
    }
}
