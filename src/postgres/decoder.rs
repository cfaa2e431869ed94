//! Binary decoding for the logical replication stream.
//!
//! Two layers are handled here: the replication frames carried in CopyData
//! payloads (`'k'` primary keepalive and `'w'` XLogData), and the pgoutput
//! logical messages wrapped inside XLogData (`proto_version '1'`).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::borrow::Cow;
use std::time::{Duration, SystemTime};

use super::lsn::Lsn;
use crate::{Error, Result};

const PRIMARY_KEEPALIVE_BYTE: u8 = b'k';
const XLOG_DATA_BYTE: u8 = b'w';
const STANDBY_STATUS_UPDATE_BYTE: u8 = b'r';

/// A frame received from the server while streaming.
#[derive(Debug)]
pub enum ReplicationFrame {
    PrimaryKeepalive(PrimaryKeepalive),
    XLogData(XLogData),
}

/// Periodic server heartbeat; `reply_requested` demands immediate standby
/// feedback.
#[derive(Debug, Clone, Copy)]
pub struct PrimaryKeepalive {
    pub wal_end: Lsn,
    pub timestamp: i64,
    pub reply_requested: bool,
}

/// A chunk of WAL carrying one logical message.
#[derive(Debug)]
pub struct XLogData {
    pub wal_start: Lsn,
    pub server_wal_end: Lsn,
    pub timestamp: i64,
    pub data: Bytes,
}

impl ReplicationFrame {
    /// Parses a CopyData payload received during replication.
    pub fn parse(mut data: Bytes) -> Result<ReplicationFrame> {
        if data.is_empty() {
            return Err(invalid("empty replication frame"));
        }
        let tag = data.get_u8();
        match tag {
            PRIMARY_KEEPALIVE_BYTE => {
                need(&data, 17, "keepalive")?;
                let wal_end = Lsn(data.get_u64());
                let timestamp = data.get_i64();
                let reply_requested = data.get_u8() != 0;
                Ok(ReplicationFrame::PrimaryKeepalive(PrimaryKeepalive {
                    wal_end,
                    timestamp,
                    reply_requested,
                }))
            }
            XLOG_DATA_BYTE => {
                need(&data, 24, "XLogData header")?;
                let wal_start = Lsn(data.get_u64());
                let server_wal_end = Lsn(data.get_u64());
                let timestamp = data.get_i64();
                Ok(ReplicationFrame::XLogData(XLogData {
                    wal_start,
                    server_wal_end,
                    timestamp,
                    data,
                }))
            }
            tag => Err(invalid(format!(
                "unknown replication frame tag: {}",
                tag as char
            ))),
        }
    }
}

/// Encodes a standby status update reporting `lsn` as the written, flushed,
/// and applied position.
pub fn encode_standby_status_update(lsn: Lsn, reply_requested: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(STANDBY_STATUS_UPDATE_BYTE);
    buf.put_u64(lsn.0);
    buf.put_u64(lsn.0);
    buf.put_u64(lsn.0);
    buf.put_i64(pg_epoch_micros());
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}

/// Microseconds since the postgres epoch (2000-01-01 00:00:00 UTC).
fn pg_epoch_micros() -> i64 {
    let pg_epoch = SystemTime::UNIX_EPOCH + Duration::from_secs(946_684_800);
    match SystemTime::now().duration_since(pg_epoch) {
        Ok(elapsed) => elapsed.as_micros() as i64,
        Err(_) => 0,
    }
}

/// A logical message decoded from an XLogData payload.
#[derive(Debug)]
pub enum LogicalMessage {
    Begin(BeginBody),
    Commit(CommitBody),
    Origin,
    Relation(RelationBody),
    Type,
    Insert(InsertBody),
    Update(UpdateBody),
    Delete(DeleteBody),
    Truncate(TruncateBody),
}

#[derive(Debug)]
pub struct BeginBody {
    pub final_lsn: Lsn,
    pub timestamp: i64,
    pub xid: u32,
}

#[derive(Debug)]
pub struct CommitBody {
    pub flags: u8,
    pub commit_lsn: Lsn,
    pub end_lsn: Lsn,
    pub timestamp: i64,
}

#[derive(Debug)]
pub struct RelationBody {
    pub id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: u8,
    pub columns: Vec<RelationColumn>,
}

#[derive(Debug)]
pub struct RelationColumn {
    pub flags: u8,
    pub name: String,
    pub type_id: u32,
    pub type_modifier: i32,
}

#[derive(Debug)]
pub struct InsertBody {
    pub relation_id: u32,
    pub tuple: Tuple,
}

#[derive(Debug)]
pub struct UpdateBody {
    pub relation_id: u32,
    pub old_tuple: Option<Tuple>,
    pub new_tuple: Tuple,
}

#[derive(Debug)]
pub struct DeleteBody {
    pub relation_id: u32,
    pub old_tuple: Option<Tuple>,
}

#[derive(Debug)]
pub struct TruncateBody {
    pub relation_ids: Vec<u32>,
    pub options: u8,
}

/// The column-wise payload of a row-change message.
#[derive(Debug, Clone)]
pub struct Tuple(pub Vec<TupleData>);

/// A single column within a tuple.
#[derive(Debug, Clone)]
pub enum TupleData {
    Null,
    /// TOASTed and unchanged; the stream does not carry the value.
    Toast,
    Text(Bytes),
}

impl TupleData {
    /// The column value as text. Absent values (NULL, unchanged TOAST) read
    /// as the empty string.
    pub fn text(&self) -> Cow<'_, str> {
        match self {
            TupleData::Null | TupleData::Toast => Cow::Borrowed(""),
            TupleData::Text(data) => String::from_utf8_lossy(data),
        }
    }
}

impl LogicalMessage {
    /// Parses one pgoutput message.
    pub fn parse(mut data: Bytes) -> Result<LogicalMessage> {
        if data.is_empty() {
            return Err(invalid("empty logical message"));
        }
        let tag = data.get_u8();
        match tag {
            b'B' => {
                need(&data, 20, "BEGIN")?;
                Ok(LogicalMessage::Begin(BeginBody {
                    final_lsn: Lsn(data.get_u64()),
                    timestamp: data.get_i64(),
                    xid: data.get_u32(),
                }))
            }
            b'C' => {
                need(&data, 25, "COMMIT")?;
                Ok(LogicalMessage::Commit(CommitBody {
                    flags: data.get_u8(),
                    commit_lsn: Lsn(data.get_u64()),
                    end_lsn: Lsn(data.get_u64()),
                    timestamp: data.get_i64(),
                }))
            }
            b'O' => Ok(LogicalMessage::Origin),
            b'Y' => Ok(LogicalMessage::Type),
            b'R' => parse_relation(&mut data).map(LogicalMessage::Relation),
            b'I' => parse_insert(&mut data).map(LogicalMessage::Insert),
            b'U' => parse_update(&mut data).map(LogicalMessage::Update),
            b'D' => parse_delete(&mut data).map(LogicalMessage::Delete),
            b'T' => parse_truncate(&mut data).map(LogicalMessage::Truncate),
            tag => Err(invalid(format!(
                "unknown logical message type: {}",
                tag as char
            ))),
        }
    }
}

fn parse_relation(data: &mut Bytes) -> Result<RelationBody> {
    need(data, 4, "RELATION")?;
    let id = data.get_u32();
    let namespace = read_cstring(data)?;
    let name = read_cstring(data)?;
    need(data, 3, "RELATION")?;
    let replica_identity = data.get_u8();
    let num_columns = data.get_u16();

    let mut columns = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
        need(data, 1, "RELATION column")?;
        let flags = data.get_u8();
        let col_name = read_cstring(data)?;
        need(data, 8, "RELATION column")?;
        let type_id = data.get_u32();
        let type_modifier = data.get_i32();
        columns.push(RelationColumn {
            flags,
            name: col_name,
            type_id,
            type_modifier,
        });
    }

    Ok(RelationBody {
        id,
        namespace,
        name,
        replica_identity,
        columns,
    })
}

fn parse_insert(data: &mut Bytes) -> Result<InsertBody> {
    need(data, 5, "INSERT")?;
    let relation_id = data.get_u32();
    let tuple_type = data.get_u8();
    if tuple_type != b'N' {
        return Err(invalid(format!(
            "unexpected tuple type in INSERT: {}",
            tuple_type as char
        )));
    }
    let tuple = parse_tuple(data)?;
    Ok(InsertBody { relation_id, tuple })
}

fn parse_update(data: &mut Bytes) -> Result<UpdateBody> {
    need(data, 5, "UPDATE")?;
    let relation_id = data.get_u32();
    let tuple_type = data.get_u8();

    let (old_tuple, new_tuple) = match tuple_type {
        b'K' | b'O' => {
            let old = parse_tuple(data)?;
            need(data, 1, "UPDATE")?;
            let next = data.get_u8();
            if next != b'N' {
                return Err(invalid(format!(
                    "expected new tuple after old in UPDATE, got: {}",
                    next as char
                )));
            }
            (Some(old), parse_tuple(data)?)
        }
        b'N' => (None, parse_tuple(data)?),
        tag => {
            return Err(invalid(format!(
                "unexpected tuple type in UPDATE: {}",
                tag as char
            )))
        }
    };

    Ok(UpdateBody {
        relation_id,
        old_tuple,
        new_tuple,
    })
}

fn parse_delete(data: &mut Bytes) -> Result<DeleteBody> {
    need(data, 5, "DELETE")?;
    let relation_id = data.get_u32();
    let tuple_type = data.get_u8();
    // the old tuple carries key columns ('K') or the full row ('O'),
    // depending on the table's REPLICA IDENTITY
    let old_tuple = match tuple_type {
        b'K' | b'O' => Some(parse_tuple(data)?),
        tag => {
            return Err(invalid(format!(
                "unexpected tuple type in DELETE: {}",
                tag as char
            )))
        }
    };
    Ok(DeleteBody {
        relation_id,
        old_tuple,
    })
}

fn parse_truncate(data: &mut Bytes) -> Result<TruncateBody> {
    need(data, 5, "TRUNCATE")?;
    let num_relations = data.get_u32();
    let options = data.get_u8();
    let mut relation_ids = Vec::with_capacity(num_relations as usize);
    for _ in 0..num_relations {
        need(data, 4, "TRUNCATE")?;
        relation_ids.push(data.get_u32());
    }
    Ok(TruncateBody {
        relation_ids,
        options,
    })
}

fn parse_tuple(data: &mut Bytes) -> Result<Tuple> {
    need(data, 2, "tuple")?;
    let num_columns = data.get_u16();
    let mut columns = Vec::with_capacity(num_columns as usize);

    for _ in 0..num_columns {
        need(data, 1, "tuple column")?;
        let kind = data.get_u8();
        let column = match kind {
            b'n' => TupleData::Null,
            b'u' => TupleData::Toast,
            b't' => {
                need(data, 4, "tuple column")?;
                let len = data.get_u32() as usize;
                need(data, len, "tuple column value")?;
                TupleData::Text(data.copy_to_bytes(len))
            }
            kind => {
                return Err(invalid(format!(
                    "unknown tuple column kind: {}",
                    kind as char
                )))
            }
        };
        columns.push(column);
    }

    Ok(Tuple(columns))
}

fn read_cstring(data: &mut Bytes) -> Result<String> {
    let end = data
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| invalid("unterminated string"))?;
    let raw = data.copy_to_bytes(end);
    data.advance(1);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn need(data: &Bytes, len: usize, context: &str) -> Result<()> {
    if data.remaining() < len {
        return Err(invalid(format!("truncated {context} message")));
    }
    Ok(())
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidMessage {
        message: message.into(),
    }
}
