//! Destinations for relationship updates.
//!
//! The writer loop and the backfill importer only ever talk to a
//! [`RelationshipSink`]; the SpiceDB client itself lives outside this crate
//! and is plugged in by the embedding application.

use async_trait::async_trait;
use tracing::info;

use crate::relationship::Operation;
use crate::Result;

/// Anything that can apply a batch of relationship updates.
///
/// TOUCH operations must be idempotent upserts: the writer retries failed
/// batches and provides no cross-key ordering.
#[async_trait]
pub trait RelationshipSink: Send + Sync {
    async fn write(&self, updates: &[Operation]) -> Result<()>;
}

/// Splits writes into batches of at most `batch_size` operations.
///
/// A `batch_size` of zero disables batching and returns the inner sink
/// unchanged.
pub fn batching(inner: Box<dyn RelationshipSink>, batch_size: usize) -> Box<dyn RelationshipSink> {
    if batch_size == 0 {
        return inner;
    }
    Box::new(BatchingSink { inner, batch_size })
}

struct BatchingSink {
    inner: Box<dyn RelationshipSink>,
    batch_size: usize,
}

#[async_trait]
impl RelationshipSink for BatchingSink {
    async fn write(&self, updates: &[Operation]) -> Result<()> {
        let mut start = 0;
        while start < updates.len() {
            let end = usize::min(start + self.batch_size, updates.len());
            self.inner.write(&updates[start..end]).await?;
            start = end;
        }
        Ok(())
    }
}

/// Logs each operation after delegating to the wrapped sink.
pub struct LoggingSink {
    inner: Box<dyn RelationshipSink>,
}

impl LoggingSink {
    pub fn new(inner: Box<dyn RelationshipSink>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl RelationshipSink for LoggingSink {
    async fn write(&self, updates: &[Operation]) -> Result<()> {
        let result = self.inner.write(updates).await;
        for update in updates {
            info!(rel = %update.rel, operation = %update.op, "relationship update");
        }
        result
    }
}

/// Accepts and discards every write.
pub struct DiscardingSink;

#[async_trait]
impl RelationshipSink for DiscardingSink {
    async fn write(&self, _updates: &[Operation]) -> Result<()> {
        Ok(())
    }
}

/// A sink that logs what would be written without writing anything.
pub fn dry_run() -> Box<dyn RelationshipSink> {
    Box::new(LoggingSink::new(Box::new(DiscardingSink)))
}
