use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid message format: {message}")]
    InvalidMessage { message: String },

    #[error("Sink write failed: {0}")]
    Sink(String),

    #[error("Shutdown requested")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
