//! Replication-mode PostgreSQL connection handling.
//!
//! A replication session is opened with the `replication=database` startup
//! parameter and only speaks the simple query protocol; the extended protocol
//! is rejected by the server for these sessions. Streaming itself runs over
//! the CopyBoth sub-protocol entered by `START_REPLICATION`.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio_postgres::{CopyBothDuplex, NoTls, SimpleQueryMessage, SimpleQueryRow};
use tracing::{debug, error, info, warn};

use super::decoder::{encode_standby_status_update, ReplicationFrame};
use super::lsn::Lsn;
use crate::{Error, Result};

/// An exclusively owned replication session.
///
/// The underlying socket must stay pinned to its owner for the lifetime of
/// the stream; it is never returned to a pool between frames.
pub struct ReplicationConnection {
    client: tokio_postgres::Client,
    connection_task: tokio::task::JoinHandle<()>,
    conninfo: String,
}

impl ReplicationConnection {
    /// Connects to postgres in logical replication mode. The
    /// `replication=database` parameter is appended if the conninfo does not
    /// already carry one.
    pub async fn connect(conninfo: &str) -> Result<Self> {
        let conninfo = if conninfo.contains("replication=") {
            conninfo.to_string()
        } else if conninfo.contains('?') {
            format!("{conninfo}&replication=database")
        } else {
            format!("{conninfo}?replication=database")
        };
        let config = conninfo.parse::<tokio_postgres::Config>()?;

        let (client, connection) = config.connect(NoTls).await?;
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("replication connection error: {e}");
            }
        });

        info!("connected to postgres in replication mode");
        Ok(Self {
            client,
            connection_task,
            conninfo,
        })
    }

    /// Whether this session was opened with the replication flag.
    pub fn is_replication(&self) -> bool {
        self.conninfo.contains("replication=")
    }

    /// Runs a simple-protocol query and collects its data rows.
    pub async fn simple_query(&self, query: &str) -> Result<Vec<SimpleQueryRow>> {
        let messages = self.client.simple_query(query).await?;
        Ok(messages
            .into_iter()
            .filter_map(|message| match message {
                SimpleQueryMessage::Row(row) => Some(row),
                _ => None,
            })
            .collect())
    }

    /// Runs `IDENTIFY_SYSTEM` and returns the server's replication identity,
    /// including the current WAL position.
    pub async fn identify_system(&self) -> Result<SystemInfo> {
        debug!("sending IDENTIFY_SYSTEM");
        let rows = self.simple_query("IDENTIFY_SYSTEM").await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::Protocol("IDENTIFY_SYSTEM returned no rows".to_string()))?;

        let xlog_pos = row
            .get("xlogpos")
            .ok_or_else(|| Error::Protocol("IDENTIFY_SYSTEM returned no xlogpos".to_string()))?
            .parse::<Lsn>()?;
        let info = SystemInfo {
            system_id: row.get("systemid").unwrap_or("unknown").to_string(),
            timeline: row
                .get("timeline")
                .and_then(|t| t.parse().ok())
                .unwrap_or(1),
            xlog_pos,
            dbname: row.get("dbname").map(str::to_string),
        };
        debug!(?info, "identified system");
        Ok(info)
    }

    /// Drops and recreates `publication` covering all tables.
    pub async fn recreate_publication(&self, publication: &str) -> Result<()> {
        // the publication may not exist yet; the drop is best-effort
        if let Err(e) = self
            .client
            .simple_query(&format!("DROP PUBLICATION {publication};"))
            .await
        {
            debug!(publication, "dropping publication: {e}");
        }
        self.client
            .simple_query(&format!("CREATE PUBLICATION {publication} FOR ALL TABLES;"))
            .await?;
        info!(publication, "publication created for all tables");
        Ok(())
    }

    /// Creates a temporary logical slot using the pgoutput plugin. Temporary
    /// slots are dropped by the server when the session ends.
    pub async fn create_replication_slot(&self, slot: &str) -> Result<()> {
        let query = format!("CREATE_REPLICATION_SLOT {slot} TEMPORARY LOGICAL pgoutput");
        let rows = self.simple_query(&query).await?;
        let consistent_point = rows
            .first()
            .and_then(|row| row.get("consistent_point"))
            .unwrap_or("unknown");
        info!(slot, consistent_point, "created temporary replication slot");
        Ok(())
    }

    /// Drops a replication slot without waiting for it to become inactive.
    pub async fn drop_replication_slot(&self, slot: &str) -> Result<()> {
        match self
            .client
            .simple_query(&format!("DROP_REPLICATION_SLOT {slot}"))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("does not exist") => {
                warn!(slot, "replication slot does not exist");
                Ok(())
            }
            Err(e) => Err(Error::Postgres(e)),
        }
    }

    /// Starts streaming from `start` and enters CopyBoth mode.
    pub async fn start_replication(
        &self,
        slot: &str,
        start: Lsn,
        publication: &str,
    ) -> Result<ReplicationStream> {
        let options = format!("proto_version '1', publication_names '{publication}'");
        let query = format!("START_REPLICATION SLOT {slot} LOGICAL {start} ({options})");
        info!(slot, lsn = %start, "starting replication");

        let duplex = self.client.copy_both_simple::<Bytes>(&query).await?;
        Ok(ReplicationStream {
            inner: Box::pin(duplex),
        })
    }

    /// Tears the session down.
    pub fn close(self) {
        // dropping the client terminates the session; the background task
        // ends with it
        drop(self.client);
        self.connection_task.abort();
    }
}

/// Output of `IDENTIFY_SYSTEM`.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlog_pos: Lsn,
    pub dbname: Option<String>,
}

/// An active CopyBoth stream carrying replication frames.
pub struct ReplicationStream {
    inner: Pin<Box<CopyBothDuplex<Bytes>>>,
}

impl ReplicationStream {
    /// Waits up to `timeout` for the next frame from the server.
    ///
    /// `Ok(None)` means the deadline passed without a frame, which is not an
    /// error; the stream ending is.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Option<ReplicationFrame>> {
        match tokio::time::timeout(timeout, self.inner.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(Error::Protocol(
                "replication stream ended unexpectedly".to_string(),
            )),
            Ok(Some(Ok(data))) => ReplicationFrame::parse(data).map(Some),
            Ok(Some(Err(e))) => Err(Error::Postgres(e)),
        }
    }

    /// Reports `lsn` to the server as written, flushed, and applied.
    pub async fn send_status_update(&mut self, lsn: Lsn) -> Result<()> {
        let frame = encode_standby_status_update(lsn, false);
        self.inner.send(frame).await?;
        Ok(())
    }
}
