//! Orchestrates a full sync run: backfill, schema reflection, the follower
//! task, and the writer loop draining the cache into the sink.

use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::cache::Cache;
use crate::checkpoint::CheckpointManager;
use crate::config::Config;
use crate::follow::WalFollower;
use crate::import::Importer;
use crate::mapping::{self, TableMapping};
use crate::postgres::connection::ReplicationConnection;
use crate::postgres::schema;
use crate::sink::RelationshipSink;
use crate::{Error, Result};

pub struct Replicator {
    config: Config,
    sink: Arc<dyn RelationshipSink>,
}

impl Replicator {
    pub fn new(config: Config, sink: Box<dyn RelationshipSink>) -> Self {
        Self {
            config,
            sink: sink.into(),
        }
    }

    /// Runs the full connector: a backfill sweep followed by continuous WAL
    /// sync, until `cancel` fires or a fatal error surfaces.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mappings = mapping::load(&self.config.sync.mapping_file).await?;
        self.backfill_mappings(&mappings).await?;
        self.follow(cancel, &mappings).await
    }

    /// Runs only the initial table sweep.
    pub async fn backfill(&self) -> Result<()> {
        let mappings = mapping::load(&self.config.sync.mapping_file).await?;
        self.backfill_mappings(&mappings).await
    }

    /// Reflects the schema and derives a provisional mapping from its
    /// foreign keys.
    pub async fn provisional_mapping(&self) -> Result<Vec<TableMapping>> {
        let conn = ReplicationConnection::connect(&self.config.postgres_url()).await?;
        info!("syncing schema");
        let schema = schema::reflect(&conn, &[]).await?;
        conn.close();
        Ok(schema.to_table_mapping())
    }

    async fn backfill_mappings(&self, mappings: &[TableMapping]) -> Result<()> {
        info!("connecting to postgres");
        let (client, connection) =
            tokio_postgres::connect(&self.config.postgres_url(), NoTls).await?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("postgres connection error: {e}");
            }
        });

        let importer = Importer::new(&client, self.sink.as_ref(), mappings);
        let result = importer.import().await;

        drop(client);
        connection_task.abort();
        result
    }

    async fn follow(&self, cancel: CancellationToken, mappings: &[TableMapping]) -> Result<()> {
        let conn = ReplicationConnection::connect(&self.config.postgres_url()).await?;

        info!("syncing schema");
        let schema = schema::reflect(&conn, &[]).await?;
        for table in &schema.tables {
            debug!(
                xlog_pos = %schema.xlog_pos,
                table = %table.name,
                oid = table.id,
                "reflected table"
            );
        }
        let internal = schema.resolve(mappings)?;

        let checkpoints = self
            .config
            .sync
            .checkpoint_file
            .as_ref()
            .map(CheckpointManager::new);
        let mut start = schema.xlog_pos;
        if let Some(manager) = &checkpoints {
            if let Some(checkpoint) = manager.load().await? {
                info!(lsn = %checkpoint.lsn, "resuming from checkpoint");
                start = checkpoint.lsn;
            }
        }

        let cache = Arc::new(Cache::new(cancel.child_token()));
        let mut follower = WalFollower::new(conn, internal, Arc::clone(&cache))
            .with_checkpoints(checkpoints)
            .with_standby_timeout(Duration::from_secs(
                self.config.sync.keepalive_interval_secs,
            ));

        let follower_cancel = cancel.clone();
        let follower_task = tokio::spawn(async move {
            let result = follower.follow(follower_cancel.clone(), start).await;
            if let Err(e) = &result {
                error!("follower stopped: {e}");
            }
            // wake the writer so a follower failure shuts the run down
            follower_cancel.cancel();
            result
        });

        self.write_loop(&cache).await;

        match follower_task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Protocol(format!("follower task failed: {e}"))),
        }
    }

    /// Drains the cache one operation at a time; failed writes are requeued
    /// rather than dropped.
    async fn write_loop(&self, cache: &Cache) {
        while let Some(operation) = cache.next().await {
            trace!(rel = %operation.rel, op = %operation.op, "writing");
            let batch = [operation];
            match self.sink.write(&batch).await {
                Ok(()) => {
                    let [operation] = batch;
                    metrics::counter!(
                        "spicedb_sync_relationship_updates_total",
                        "op" => operation.op.to_string()
                    )
                    .increment(1);
                }
                Err(e) => {
                    let [operation] = batch;
                    metrics::counter!("spicedb_sync_requeued_updates_total").increment(1);
                    warn!(
                        rel = %operation.rel,
                        op = %operation.op,
                        "requeueing after sink failure: {e}"
                    );
                    cache.requeue(operation.op, operation.rel);
                }
            }
        }
    }
}
