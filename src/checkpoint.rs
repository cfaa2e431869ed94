//! Durable WAL-position checkpointing.
//!
//! The acknowledged LSN otherwise lives only in memory, so a restarted run
//! resumes from whatever position schema reflection captures. When a
//! checkpoint file is configured the follower persists its position on every
//! standby status update and the next run resumes from there instead.
//!
//! Writes are atomic (temp file, sync, rename) so a crash can never leave a
//! torn checkpoint behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::postgres::lsn::Lsn;
use crate::Result;

/// A point in the replication stream that has been fully handed to the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The last acknowledged WAL position.
    pub lsn: Lsn,
    /// When this checkpoint was taken.
    pub timestamp: DateTime<Utc>,
    /// Row changes translated since startup.
    pub change_count: u64,
}

impl Checkpoint {
    pub fn new(lsn: Lsn, change_count: u64) -> Self {
        Self {
            lsn,
            timestamp: Utc::now(),
            change_count,
        }
    }
}

/// Loads and saves checkpoints at a fixed path.
pub struct CheckpointManager {
    file_path: PathBuf,
}

impl CheckpointManager {
    pub fn new(checkpoint_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: checkpoint_path.as_ref().to_path_buf(),
        }
    }

    /// Loads the checkpoint if one exists. `None` means a fresh start.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        if !self.file_path.exists() {
            debug!("no checkpoint file found at {:?}", self.file_path);
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.file_path).await?;
        let checkpoint: Checkpoint = serde_json::from_str(&contents)?;
        info!(
            lsn = %checkpoint.lsn,
            timestamp = %checkpoint.timestamp,
            "loaded checkpoint"
        );
        Ok(Some(checkpoint))
    }

    /// Saves the checkpoint atomically.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!(lsn = %checkpoint.lsn, "saving checkpoint");

        let temp_path = self.file_path.with_extension("tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;
        Ok(())
    }

    /// Deletes the checkpoint so the next run starts from the reflected
    /// schema position.
    pub async fn delete(&self) -> Result<()> {
        if self.file_path.exists() {
            fs::remove_file(&self.file_path).await?;
            info!("deleted checkpoint file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_checkpoint_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("checkpoint.json");

        let manager = CheckpointManager::new(&checkpoint_path);

        // initially no checkpoint
        assert!(manager.load().await.unwrap().is_none());

        let checkpoint = Checkpoint::new(Lsn(0x1634FA0), 100);
        manager.save(&checkpoint).await.unwrap();

        let loaded = manager.load().await.unwrap().unwrap();
        assert_eq!(loaded.lsn, Lsn(0x1634FA0));
        assert_eq!(loaded.change_count, 100);
    }

    #[tokio::test]
    async fn test_checkpoint_overwrite_is_atomic() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("checkpoint.json");

        let manager = CheckpointManager::new(&checkpoint_path);

        manager.save(&Checkpoint::new(Lsn(0x1111), 50)).await.unwrap();
        manager.save(&Checkpoint::new(Lsn(0x3333), 150)).await.unwrap();

        let loaded = manager.load().await.unwrap().unwrap();
        assert_eq!(loaded.lsn, Lsn(0x3333));
        assert_eq!(loaded.change_count, 150);
    }

    #[tokio::test]
    async fn test_checkpoint_delete() {
        let temp_dir = TempDir::new().unwrap();
        let checkpoint_path = temp_dir.path().join("checkpoint.json");

        let manager = CheckpointManager::new(&checkpoint_path);
        manager.save(&Checkpoint::new(Lsn(7), 1)).await.unwrap();
        manager.delete().await.unwrap();

        assert!(manager.load().await.unwrap().is_none());
    }
}
