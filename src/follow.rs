//! WAL follower: turns committed row changes into cache operations.
//!
//! Lifecycle: recreate the publication, create a temporary slot, stream from
//! the given WAL position, and keep the server's standby position advancing
//! with periodic status updates. INSERT and DELETE messages are translated
//! through the internal mapping into relationship touches and deletes; the
//! remaining logical message types carry nothing the mapping needs and are
//! ignored.

use rand::RngCore;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::cache::Cache;
use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::mapping::{InternalRowMapping, InternalTableMapping};
use crate::postgres::connection::{ReplicationConnection, ReplicationStream};
use crate::postgres::decoder::{LogicalMessage, ReplicationFrame, TupleData, XLogData};
use crate::postgres::lsn::Lsn;
use crate::relationship::Relationship;
use crate::{Error, Result};

const PUBLICATION: &str = "spicedb_sync";
const SLOT_PREFIX: &str = "spicedb_sync_slot";
const STANDBY_TIMEOUT: Duration = Duration::from_secs(10);

/// Follows the replication stream and writes changes into the cache.
///
/// The follower owns its replication session for its whole lifetime; the
/// stream is not safe to share. Changes should be consumed from the cache to
/// process them concurrently.
pub struct WalFollower {
    conn: ReplicationConnection,
    mapping: HashMap<u32, Vec<InternalRowMapping>>,
    cache: Arc<Cache>,
    checkpoints: Option<CheckpointManager>,
    standby_timeout: Duration,
    acked: Lsn,
    changes_seen: u64,
}

impl WalFollower {
    pub fn new(
        conn: ReplicationConnection,
        mapping: Vec<InternalTableMapping>,
        cache: Arc<Cache>,
    ) -> Self {
        let mapping = mapping
            .into_iter()
            .map(|m| (m.table_id, m.row_mappings))
            .collect();
        Self {
            conn,
            mapping,
            cache,
            checkpoints: None,
            standby_timeout: STANDBY_TIMEOUT,
            acked: Lsn::default(),
            changes_seen: 0,
        }
    }

    /// Persists the acknowledged WAL position whenever standby feedback is
    /// sent, so a later run can resume close to where this one stopped.
    pub fn with_checkpoints(mut self, checkpoints: Option<CheckpointManager>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn with_standby_timeout(mut self, timeout: Duration) -> Self {
        self.standby_timeout = timeout;
        self
    }

    /// Streams WAL changes into the cache starting at `start` until `cancel`
    /// fires or a fatal error occurs. Receive timeouts are not errors.
    pub async fn follow(&mut self, cancel: CancellationToken, start: Lsn) -> Result<()> {
        warn!("replication does not fully support deleting relationships, do not use for production");

        self.conn.recreate_publication(PUBLICATION).await?;

        let slot = new_slot_name(SLOT_PREFIX);
        self.conn.create_replication_slot(&slot).await?;
        let mut stream = self
            .conn
            .start_replication(&slot, start, PUBLICATION)
            .await?;

        self.acked = start;
        let result = self.stream_changes(&cancel, &mut stream).await;
        drop(stream);

        info!(slot = %slot, "dropping replication slot");
        // runs after cancellation, bounded so shutdown cannot hang; the
        // server drops temporary slots with the session anyway
        match tokio::time::timeout(
            Duration::from_secs(5),
            self.conn.drop_replication_slot(&slot),
        )
        .await
        {
            Ok(Ok(())) => info!(slot = %slot, "replication slot dropped"),
            Ok(Err(e)) => warn!(slot = %slot, "failed to drop replication slot: {e}"),
            Err(_) => warn!(slot = %slot, "timed out dropping replication slot"),
        }
        result
    }

    async fn stream_changes(
        &mut self,
        cancel: &CancellationToken,
        stream: &mut ReplicationStream,
    ) -> Result<()> {
        let mut next_deadline = Instant::now() + self.standby_timeout;
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            if Instant::now() >= next_deadline {
                stream.send_status_update(self.acked).await?;
                trace!(lsn = %self.acked, "sent standby status update");
                metrics::gauge!("spicedb_sync_acknowledged_lsn").set(self.acked.0 as f64);
                self.save_checkpoint().await;
                next_deadline = Instant::now() + self.standby_timeout;
            }

            let remaining = next_deadline.saturating_duration_since(Instant::now());
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                frame = stream.recv(remaining) => frame?,
            };

            match frame {
                // receive timeout: loop around and send standby feedback
                None => continue,
                Some(ReplicationFrame::PrimaryKeepalive(keepalive)) => {
                    trace!(
                        wal_end = %keepalive.wal_end,
                        reply = keepalive.reply_requested,
                        "received keepalive"
                    );
                    if keepalive.reply_requested {
                        // zero the deadline so the next iteration replies
                        next_deadline = Instant::now();
                    }
                }
                Some(ReplicationFrame::XLogData(xlog)) => self.apply_wal(xlog)?,
            }
        }
    }

    /// Decodes one XLogData frame, pushes any resulting operations into the
    /// cache, and advances the acknowledged position.
    fn apply_wal(&mut self, xlog: XLogData) -> Result<()> {
        let advanced = next_ack(self.acked, &xlog);
        let message = LogicalMessage::parse(xlog.data)?;

        match message {
            LogicalMessage::Insert(insert) => {
                for rel in
                    relationships_for(&self.mapping, insert.relation_id, &insert.tuple.0)?
                {
                    self.changes_seen += 1;
                    metrics::counter!("spicedb_sync_wal_changes_total", "op" => "insert")
                        .increment(1);
                    self.cache.touch(rel);
                }
            }
            LogicalMessage::Delete(delete) => {
                // the old tuple may carry only replica-identity columns, so
                // deletes are best effort
                warn!("DELETE is not fully supported by the connector");
                if let Some(tuple) = &delete.old_tuple {
                    for rel in relationships_for(&self.mapping, delete.relation_id, &tuple.0)? {
                        self.changes_seen += 1;
                        metrics::counter!("spicedb_sync_wal_changes_total", "op" => "delete")
                            .increment(1);
                        self.cache.delete(rel);
                    }
                }
            }
            // BEGIN, COMMIT, RELATION, UPDATE, TRUNCATE, TYPE, and ORIGIN
            // carry nothing the mapping needs
            _ => {}
        }

        self.acked = advanced;
        Ok(())
    }

    async fn save_checkpoint(&self) {
        if let Some(checkpoints) = &self.checkpoints {
            let checkpoint = Checkpoint::new(self.acked, self.changes_seen);
            if let Err(e) = checkpoints.save(&checkpoint).await {
                warn!(lsn = %self.acked, "failed to save checkpoint: {e}");
            }
        }
    }
}

/// The acknowledged position after processing `xlog`: the frame's start plus
/// its payload length, never moving backwards.
fn next_ack(current: Lsn, xlog: &XLogData) -> Lsn {
    current.max(xlog.wal_start.advance(xlog.data.len() as u64))
}

/// Translates a row tuple into relationships, one per row mapping configured
/// for the relation. Column ordinals on the protocol are 1-based.
fn relationships_for(
    mapping: &HashMap<u32, Vec<InternalRowMapping>>,
    relation_id: u32,
    columns: &[TupleData],
) -> Result<Vec<Relationship>> {
    let Some(row_mappings) = mapping.get(&relation_id) else {
        trace!(relation_id, "no mapping for relation");
        return Ok(Vec::new());
    };

    let mut rels = Vec::with_capacity(row_mappings.len());
    for rm in row_mappings {
        rels.push(Relationship {
            resource_type: rm.resource_type.clone(),
            resource_id: join_columns(columns, &rm.resource_id_cols)?,
            relation: rm.relation.clone(),
            subject_type: rm.subject_type.clone(),
            subject_id: join_columns(columns, &rm.subject_id_cols)?,
        });
    }
    Ok(rels)
}

fn join_columns(columns: &[TupleData], ordinals: &[usize]) -> Result<String> {
    let mut parts = Vec::with_capacity(ordinals.len());
    for &ordinal in ordinals {
        let column = ordinal
            .checked_sub(1)
            .and_then(|index| columns.get(index))
            .ok_or_else(|| Error::InvalidMessage {
                message: format!(
                    "column ordinal {ordinal} out of range for tuple of {} columns",
                    columns.len()
                ),
            })?;
        parts.push(column.text().into_owned());
    }
    Ok(parts.join("_"))
}

/// Random slot names let concurrent runs coexist on one database.
fn new_slot_name(prefix: &str) -> String {
    let mut token = [0u8; 5];
    rand::rngs::OsRng.fill_bytes(&mut token);
    let mut name = format!("{prefix}_");
    for byte in token {
        let _ = write!(name, "{byte:02x}");
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn text(value: &str) -> TupleData {
        TupleData::Text(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn contacts_mapping() -> HashMap<u32, Vec<InternalRowMapping>> {
        HashMap::from([(
            16401,
            vec![InternalRowMapping {
                resource_type: "contacts".to_string(),
                subject_type: "customers".to_string(),
                relation: "fk_customer".to_string(),
                resource_id_cols: vec![1],
                subject_id_cols: vec![2, 3],
            }],
        )])
    }

    #[test]
    fn test_composite_subject_id_joined_with_underscores() {
        let mapping = contacts_mapping();
        let tuple = vec![text("10"), text("2"), text("SmallFry")];

        let rels = relationships_for(&mapping, 16401, &tuple).unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(
            rels[0].to_string(),
            "contacts:10#fk_customer@customers:2_SmallFry"
        );
    }

    #[test]
    fn test_null_columns_read_as_empty() {
        let mapping = contacts_mapping();
        let tuple = vec![text("10"), TupleData::Null, text("SmallFry")];

        let rels = relationships_for(&mapping, 16401, &tuple).unwrap();
        assert_eq!(rels[0].subject_id, "_SmallFry");
    }

    #[test]
    fn test_unmapped_relation_produces_nothing() {
        let mapping = contacts_mapping();
        let tuple = vec![text("10")];

        let rels = relationships_for(&mapping, 99, &tuple).unwrap();
        assert!(rels.is_empty());
    }

    #[test]
    fn test_out_of_range_ordinal_is_an_error() {
        let mapping = contacts_mapping();
        let tuple = vec![text("10"), text("2")];

        let err = relationships_for(&mapping, 16401, &tuple).unwrap_err();
        assert!(matches!(err, Error::InvalidMessage { .. }));
    }

    #[test]
    fn test_multiple_row_mappings_for_one_relation() {
        let mapping = HashMap::from([(
            7,
            vec![
                InternalRowMapping {
                    resource_type: "article".to_string(),
                    subject_type: "tag".to_string(),
                    relation: "tags".to_string(),
                    resource_id_cols: vec![1],
                    subject_id_cols: vec![2],
                },
                InternalRowMapping {
                    resource_type: "tag".to_string(),
                    subject_type: "article".to_string(),
                    relation: "articles".to_string(),
                    resource_id_cols: vec![2],
                    subject_id_cols: vec![1],
                },
            ],
        )]);
        let tuple = vec![text("1"), text("2")];

        let rels = relationships_for(&mapping, 7, &tuple).unwrap();
        assert_eq!(rels.len(), 2);
        assert_eq!(rels[0].to_string(), "article:1#tags@tag:2");
        assert_eq!(rels[1].to_string(), "tag:2#articles@article:1");
    }

    #[test]
    fn test_ack_advances_by_payload_length() {
        let xlog = XLogData {
            wal_start: Lsn(100),
            server_wal_end: Lsn(100),
            timestamp: 0,
            data: Bytes::from(vec![0u8; 42]),
        };
        assert_eq!(next_ack(Lsn(0), &xlog), Lsn(142));
    }

    #[test]
    fn test_ack_never_regresses() {
        let xlog = XLogData {
            wal_start: Lsn(100),
            server_wal_end: Lsn(100),
            timestamp: 0,
            data: Bytes::from(vec![0u8; 42]),
        };
        assert_eq!(next_ack(Lsn(500), &xlog), Lsn(500));
    }

    #[test]
    fn test_slot_names_are_unique() {
        let a = new_slot_name(SLOT_PREFIX);
        let b = new_slot_name(SLOT_PREFIX);
        assert!(a.starts_with("spicedb_sync_slot_"));
        assert_eq!(a.len(), SLOT_PREFIX.len() + 1 + 10);
        assert_ne!(a, b);
    }
}
