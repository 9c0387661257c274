use bytes::{Buf, Bytes};
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct RelationInfo {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub replica_identity: u8,
    pub columns: Vec<ColumnInfo>,
}

impl RelationInfo {
    /// `schema.table`, the name used in commit hashes.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub type_id: u32,
    pub type_modifier: i32,
    pub is_key: bool,
}

/// One column of a row image as sent by pgoutput.
#[derive(Debug, Clone, PartialEq)]
pub enum TupleColumn {
    Null,
    /// Unchanged TOASTed value. The value was not sent and is not null.
    Toast,
    Text(Bytes),
    Binary(Bytes),
}

impl TupleColumn {
    pub fn tag(&self) -> u8 {
        match self {
            TupleColumn::Null => b'n',
            TupleColumn::Toast => b'u',
            TupleColumn::Text(_) => b't',
            TupleColumn::Binary(_) => b'b',
        }
    }

    pub fn data(&self) -> Option<&Bytes> {
        match self {
            TupleColumn::Text(d) | TupleColumn::Binary(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TupleData {
    pub columns: Vec<TupleColumn>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogicalMessage {
    Begin {
        final_lsn: u64,
        commit_ts: i64,
        xid: u32,
    },
    Commit {
        flags: u8,
        commit_lsn: u64,
        end_lsn: u64,
        commit_ts: i64,
    },
    Origin {
        commit_lsn: u64,
        name: String,
    },
    Relation(RelationInfo),
    Type {
        xid: Option<u32>,
        type_id: u32,
        namespace: String,
        name: String,
    },
    Insert {
        xid: Option<u32>,
        rel_id: u32,
        tuple: TupleData,
    },
    Update {
        xid: Option<u32>,
        rel_id: u32,
        /// `K` or `O` when an old image was sent, otherwise 0.
        old_tuple_type: u8,
        old_tuple: Option<TupleData>,
        new_tuple: TupleData,
    },
    Delete {
        xid: Option<u32>,
        rel_id: u32,
        old_tuple_type: u8,
        old_tuple: TupleData,
    },
    Truncate {
        xid: Option<u32>,
        options: u8,
        rel_ids: Vec<u32>,
    },
    Message {
        xid: Option<u32>,
        transactional: bool,
        lsn: u64,
        prefix: String,
        content: Bytes,
    },
    StreamStart {
        xid: u32,
        first_segment: bool,
    },
    StreamStop,
    StreamCommit {
        xid: u32,
        flags: u8,
        commit_lsn: u64,
        end_lsn: u64,
        commit_ts: i64,
    },
    StreamAbort {
        xid: u32,
        sub_xid: u32,
    },
    BeginPrepare {
        prepare_lsn: u64,
        end_lsn: u64,
        prepare_ts: i64,
        xid: u32,
        gid: String,
    },
    Prepare(PrepareInfo),
    CommitPrepared {
        flags: u8,
        commit_lsn: u64,
        end_lsn: u64,
        commit_ts: i64,
        xid: u32,
        gid: String,
    },
    RollbackPrepared {
        flags: u8,
        prepare_end_lsn: u64,
        rollback_end_lsn: u64,
        prepare_ts: i64,
        rollback_ts: i64,
        xid: u32,
        gid: String,
    },
    StreamPrepare(PrepareInfo),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrepareInfo {
    pub flags: u8,
    pub prepare_lsn: u64,
    pub end_lsn: u64,
    pub prepare_ts: i64,
    pub xid: u32,
    pub gid: String,
}

/// Decodes `pgoutput` protocol version 3 messages.
///
/// Relation metadata is learned from `Relation` messages and is only valid
/// for the replication session that produced it.
#[derive(Debug, Default)]
pub struct PgOutputDecoder {
    relations: HashMap<u32, RelationInfo>,
    in_stream: bool,
}

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn relation(&self, rel_id: u32) -> Option<&RelationInfo> {
        self.relations.get(&rel_id)
    }

    pub fn in_stream(&self) -> bool {
        self.in_stream
    }

    /// Decodes the payload of one XLogData message.
    pub fn decode(&mut self, data: &[u8]) -> Result<LogicalMessage> {
        let mut r = Reader::new(data);
        let msg_type = r.u8("message type")?;

        let msg = match msg_type {
            b'B' => self.decode_begin(&mut r)?,
            b'C' => self.decode_commit(&mut r)?,
            b'O' => LogicalMessage::Origin {
                commit_lsn: r.u64("origin lsn")?,
                name: r.cstr("origin name")?,
            },
            b'R' => self.decode_relation(&mut r)?,
            b'Y' => LogicalMessage::Type {
                xid: self.stream_xid(&mut r)?,
                type_id: r.u32("type oid")?,
                namespace: r.cstr("type namespace")?,
                name: r.cstr("type name")?,
            },
            b'I' => self.decode_insert(&mut r)?,
            b'U' => self.decode_update(&mut r)?,
            b'D' => self.decode_delete(&mut r)?,
            b'T' => self.decode_truncate(&mut r)?,
            b'M' => self.decode_message(&mut r)?,
            b'S' => {
                let xid = r.u32("stream xid")?;
                let first_segment = r.u8("stream first segment")? == 1;
                self.in_stream = true;
                LogicalMessage::StreamStart { xid, first_segment }
            }
            b'E' => {
                self.in_stream = false;
                LogicalMessage::StreamStop
            }
            b'c' => LogicalMessage::StreamCommit {
                xid: r.u32("stream commit xid")?,
                flags: r.u8("stream commit flags")?,
                commit_lsn: r.u64("stream commit lsn")?,
                end_lsn: r.u64("stream end lsn")?,
                commit_ts: r.i64("stream commit timestamp")?,
            },
            b'A' => LogicalMessage::StreamAbort {
                xid: r.u32("stream abort xid")?,
                sub_xid: r.u32("stream abort subxid")?,
            },
            b'b' => LogicalMessage::BeginPrepare {
                prepare_lsn: r.u64("begin prepare lsn")?,
                end_lsn: r.u64("begin prepare end lsn")?,
                prepare_ts: r.i64("begin prepare timestamp")?,
                xid: r.u32("begin prepare xid")?,
                gid: r.cstr("begin prepare gid")?,
            },
            b'P' => LogicalMessage::Prepare(decode_prepare(&mut r)?),
            b'K' => LogicalMessage::CommitPrepared {
                flags: r.u8("commit prepared flags")?,
                commit_lsn: r.u64("commit prepared lsn")?,
                end_lsn: r.u64("commit prepared end lsn")?,
                commit_ts: r.i64("commit prepared timestamp")?,
                xid: r.u32("commit prepared xid")?,
                gid: r.cstr("commit prepared gid")?,
            },
            b'r' => LogicalMessage::RollbackPrepared {
                flags: r.u8("rollback prepared flags")?,
                prepare_end_lsn: r.u64("rollback prepared end lsn")?,
                rollback_end_lsn: r.u64("rollback end lsn")?,
                prepare_ts: r.i64("rollback prepare timestamp")?,
                rollback_ts: r.i64("rollback timestamp")?,
                xid: r.u32("rollback prepared xid")?,
                gid: r.cstr("rollback prepared gid")?,
            },
            b'p' => LogicalMessage::StreamPrepare(decode_prepare(&mut r)?),
            other => {
                return Err(Error::invalid_message(format!(
                    "Unknown pgoutput message type: {:?}",
                    other as char
                )))
            }
        };

        if r.has_remaining() {
            debug!(
                "{} trailing bytes after pgoutput message {:?}",
                r.remaining(),
                msg_type as char
            );
        }
        Ok(msg)
    }

    fn stream_xid(&self, r: &mut Reader<'_>) -> Result<Option<u32>> {
        if self.in_stream {
            Ok(Some(r.u32("stream xid")?))
        } else {
            Ok(None)
        }
    }

    fn decode_begin(&mut self, r: &mut Reader<'_>) -> Result<LogicalMessage> {
        let final_lsn = r.u64("begin final lsn")?;
        let commit_ts = r.i64("begin timestamp")?;
        let xid = r.u32("begin xid")?;

        trace!("BEGIN: lsn={}, xid={}", format_lsn(final_lsn), xid);
        Ok(LogicalMessage::Begin {
            final_lsn,
            commit_ts,
            xid,
        })
    }

    fn decode_commit(&mut self, r: &mut Reader<'_>) -> Result<LogicalMessage> {
        let flags = r.u8("commit flags")?;
        let commit_lsn = r.u64("commit lsn")?;
        let end_lsn = r.u64("commit end lsn")?;
        let commit_ts = r.i64("commit timestamp")?;

        trace!("COMMIT: lsn={}", format_lsn(end_lsn));
        Ok(LogicalMessage::Commit {
            flags,
            commit_lsn,
            end_lsn,
            commit_ts,
        })
    }

    fn decode_relation(&mut self, r: &mut Reader<'_>) -> Result<LogicalMessage> {
        let _xid = self.stream_xid(r)?;
        let id = r.u32("relation id")?;
        let schema = r.cstr("relation namespace")?;
        let table = r.cstr("relation name")?;
        let replica_identity = r.u8("replica identity")?;
        let num_columns = r.u16("relation column count")?;

        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            let flags = r.u8("column flags")?;
            columns.push(ColumnInfo {
                name: r.cstr("column name")?,
                type_id: r.u32("column type")?,
                type_modifier: r.i32("column type modifier")?,
                is_key: (flags & 1) != 0,
            });
        }

        let relation = RelationInfo {
            id,
            schema,
            table,
            replica_identity,
            columns,
        };

        debug!("RELATION: {}={}.{}", id, relation.schema, relation.table);
        self.relations.insert(id, relation.clone());

        Ok(LogicalMessage::Relation(relation))
    }

    fn decode_insert(&mut self, r: &mut Reader<'_>) -> Result<LogicalMessage> {
        let xid = self.stream_xid(r)?;
        let rel_id = r.u32("insert relation id")?;
        let tuple_type = r.u8("insert tuple type")?;

        if tuple_type != b'N' {
            return Err(Error::invalid_message(format!(
                "Unexpected tuple type in INSERT: {}",
                tuple_type
            )));
        }

        let tuple = decode_tuple_data(r)?;
        Ok(LogicalMessage::Insert { xid, rel_id, tuple })
    }

    fn decode_update(&mut self, r: &mut Reader<'_>) -> Result<LogicalMessage> {
        let xid = self.stream_xid(r)?;
        let rel_id = r.u32("update relation id")?;

        let mut old_tuple_type = 0;
        let mut old_tuple = None;

        let mut tuple_type = r.u8("update tuple type")?;
        if tuple_type == b'K' || tuple_type == b'O' {
            old_tuple_type = tuple_type;
            old_tuple = Some(decode_tuple_data(r)?);
            tuple_type = r.u8("update new tuple type")?;
        }

        if tuple_type != b'N' {
            return Err(Error::invalid_message(format!(
                "Unexpected tuple type in UPDATE: {}",
                tuple_type
            )));
        }
        let new_tuple = decode_tuple_data(r)?;

        Ok(LogicalMessage::Update {
            xid,
            rel_id,
            old_tuple_type,
            old_tuple,
            new_tuple,
        })
    }

    fn decode_delete(&mut self, r: &mut Reader<'_>) -> Result<LogicalMessage> {
        let xid = self.stream_xid(r)?;
        let rel_id = r.u32("delete relation id")?;
        let old_tuple_type = r.u8("delete tuple type")?;

        if old_tuple_type != b'O' && old_tuple_type != b'K' {
            return Err(Error::invalid_message(format!(
                "Unexpected tuple type in DELETE: {}",
                old_tuple_type
            )));
        }

        let old_tuple = decode_tuple_data(r)?;
        Ok(LogicalMessage::Delete {
            xid,
            rel_id,
            old_tuple_type,
            old_tuple,
        })
    }

    fn decode_truncate(&mut self, r: &mut Reader<'_>) -> Result<LogicalMessage> {
        let xid = self.stream_xid(r)?;
        let num_relations = r.u32("truncate relation count")?;
        let options = r.u8("truncate options")?;

        let mut rel_ids = Vec::with_capacity(num_relations.min(1024) as usize);
        for _ in 0..num_relations {
            rel_ids.push(r.u32("truncate relation id")?);
        }

        Ok(LogicalMessage::Truncate {
            xid,
            options,
            rel_ids,
        })
    }

    fn decode_message(&mut self, r: &mut Reader<'_>) -> Result<LogicalMessage> {
        let xid = self.stream_xid(r)?;
        let flags = r.u8("message flags")?;
        let lsn = r.u64("message lsn")?;
        let prefix = r.cstr("message prefix")?;
        let len = r.u32("message length")? as usize;
        let content = Bytes::copy_from_slice(r.bytes(len, "message content")?);

        Ok(LogicalMessage::Message {
            xid,
            transactional: flags & 1 != 0,
            lsn,
            prefix,
            content,
        })
    }
}

fn decode_prepare(r: &mut Reader<'_>) -> Result<PrepareInfo> {
    Ok(PrepareInfo {
        flags: r.u8("prepare flags")?,
        prepare_lsn: r.u64("prepare lsn")?,
        end_lsn: r.u64("prepare end lsn")?,
        prepare_ts: r.i64("prepare timestamp")?,
        xid: r.u32("prepare xid")?,
        gid: r.cstr("prepare gid")?,
    })
}

fn decode_tuple_data(r: &mut Reader<'_>) -> Result<TupleData> {
    let num_columns = r.u16("tuple column count")?;
    let mut columns = Vec::with_capacity(num_columns as usize);

    for _ in 0..num_columns {
        let col_type = r.u8("tuple column type")?;
        let column = match col_type {
            b'n' => TupleColumn::Null,
            b'u' => TupleColumn::Toast,
            b't' | b'b' => {
                let len = r.u32("tuple value length")? as usize;
                let value = Bytes::copy_from_slice(r.bytes(len, "tuple value")?);
                if col_type == b't' {
                    TupleColumn::Text(value)
                } else {
                    TupleColumn::Binary(value)
                }
            }
            _ => {
                return Err(Error::invalid_message(format!(
                    "Unknown column type: {}",
                    col_type
                )))
            }
        };
        columns.push(column);
    }

    Ok(TupleData { columns })
}

pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFFFFFF)
}

/// Bounds-checked big-endian reads over a message payload.
struct Reader<'a> {
    cursor: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { cursor: data }
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.cursor.remaining() < n {
            return Err(Error::invalid_message(format!(
                "Truncated message reading {}: need {} bytes, have {}",
                what,
                n,
                self.cursor.remaining()
            )));
        }
        Ok(())
    }

    fn has_remaining(&self) -> bool {
        self.cursor.has_remaining()
    }

    fn remaining(&self) -> usize {
        self.cursor.remaining()
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        self.need(1, what)?;
        Ok(self.cursor.get_u8())
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        self.need(2, what)?;
        Ok(self.cursor.get_u16())
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        self.need(4, what)?;
        Ok(self.cursor.get_u32())
    }

    fn i32(&mut self, what: &str) -> Result<i32> {
        self.need(4, what)?;
        Ok(self.cursor.get_i32())
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        self.need(8, what)?;
        Ok(self.cursor.get_u64())
    }

    fn i64(&mut self, what: &str) -> Result<i64> {
        self.need(8, what)?;
        Ok(self.cursor.get_i64())
    }

    fn bytes(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        self.need(n, what)?;
        let (head, tail) = self.cursor.split_at(n);
        self.cursor = tail;
        Ok(head)
    }

    fn cstr(&mut self, what: &str) -> Result<String> {
        let end = self
            .cursor
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::invalid_message(format!("Unterminated string reading {}", what)))?;
        let s = String::from_utf8_lossy(&self.cursor[..end]).into_owned();
        self.cursor = &self.cursor[end + 1..];
        Ok(s)
    }
}
