//! # spicedb-sync
//!
//! Syncs PostgreSQL rows into [SpiceDB](https://github.com/authzed/spicedb)
//! relationships. A run starts with a *backfill* that sweeps the mapped
//! tables once, then attaches to the database's logical replication stream
//! and continuously turns committed row changes into relationship updates.
//!
//! ## Overview
//!
//! The connector reflects the database schema through its system catalogues,
//! resolves a user-provided table mapping against it, and then follows the
//! `pgoutput` replication stream:
//!
//! ```text
//! backfill:  tables ──(projection queries)──► sink
//! follow:    WAL ──► follower ──► coalescing cache ──► writer ──► sink
//! ```
//!
//! Repeated updates to the same relationship coalesce in the cache, so the
//! writer only observes the latest intent per key. TOUCH operations are
//! idempotent upserts; there is no ordering guarantee across distinct keys.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use spicedb_sync::{sink, Config, Replicator, Result};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::from_env()?;
//!
//!     // replace the dry-run sink with your own RelationshipSink
//!     let replicator = Replicator::new(config, sink::dry_run());
//!     replicator.run(CancellationToken::new()).await
//! }
//! ```
//!
//! ## Mapping format
//!
//! The mapping file is a JSON array describing how rows project into
//! relationships. Multi-column id lists join with underscores:
//!
//! ```json
//! [
//!   {
//!     "name": "article_tag",
//!     "relationships": [
//!       {
//!         "resource_type": "article",
//!         "subject_type": "tag",
//!         "relation": "tags",
//!         "resource_id_cols": ["article_id"],
//!         "subject_id_cols": ["tag_id"]
//!       }
//!     ]
//!   }
//! ]
//! ```
//!
//! Run with `--print-mapping` to derive a starting mapping from the
//! database's foreign keys.
//!
//! ## PostgreSQL setup
//!
//! Logical replication must be enabled in `postgresql.conf`:
//!
//! ```ini
//! wal_level = logical
//! max_replication_slots = 4
//! max_wal_senders = 4
//! ```
//!
//! The connector manages its own publication (`spicedb_sync`, covering all
//! tables) and a temporary, randomly suffixed replication slot, so
//! concurrent runs can share a database and nothing is left behind when the
//! session ends.
//!
//! ## Architecture
//!
//! - [`replicator`] - orchestrates backfill, follower, and writer loop
//! - [`postgres`] - replication connection, schema reflection, wire decoding
//! - [`follow`] - the WAL follower state machine
//! - [`cache`] - coalescing operation cache between follower and writer
//! - [`import`] - the backfill importer
//! - [`sink`] - the `RelationshipSink` trait and its wrappers
//! - [`mapping`] - table-to-relationship mapping configuration
//! - [`checkpoint`] - optional durable WAL-position checkpointing
//! - [`config`] - environment-variable configuration
//! - [`error`] - error types and handling

/// Coalescing operation cache between the follower and the writer loop.
pub mod cache;

/// Durable WAL-position checkpointing.
pub mod checkpoint;

/// Configuration structures and environment variable parsing.
pub mod config;

/// Error types and result handling.
pub mod error;

/// WAL follower state machine.
pub mod follow;

/// Backfill importer.
pub mod import;

/// Table-to-relationship mapping configuration.
pub mod mapping;

/// PostgreSQL replication connection, schema reflection, and wire decoding.
pub mod postgres;

/// Relationship and operation types.
pub mod relationship;

/// Orchestrator for the full sync run.
pub mod replicator;

/// Relationship sinks and wrappers.
pub mod sink;

pub use config::Config;
pub use error::{Error, Result};
pub use relationship::{Operation, OperationType, Relationship};
pub use replicator::Replicator;
pub use sink::RelationshipSink;
