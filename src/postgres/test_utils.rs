use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use crate::sequence::{INTERNAL_SCHEMA, SENTRY_TABLE};

/// Builds `pgoutput` v3 message payloads, as carried inside XLogData.
pub struct MockMessageBuilder {
    lsn: u64,
    timestamp: i64,
    relations: HashMap<u32, MockRelation>,
}

#[derive(Debug, Clone)]
pub struct MockRelation {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<MockColumn>,
}

#[derive(Debug, Clone)]
pub struct MockColumn {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

/// One column of a tuple in a mock message.
#[derive(Debug, Clone)]
pub enum MockValue {
    Null,
    Toast,
    Text(String),
    Binary(Vec<u8>),
}

impl From<Option<&str>> for MockValue {
    fn from(value: Option<&str>) -> Self {
        match value {
            Some(v) => MockValue::Text(v.to_string()),
            None => MockValue::Null,
        }
    }
}

impl From<&str> for MockValue {
    fn from(value: &str) -> Self {
        MockValue::Text(value.to_string())
    }
}

/// Relation ID used for the sentry table in mock streams.
pub const SENTRY_REL_ID: u32 = 9000;

impl Default for MockMessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMessageBuilder {
    pub fn new() -> Self {
        Self {
            lsn: 0x1000,
            timestamp: 750_000_000_000_000,
            relations: HashMap::new(),
        }
    }

    pub fn with_lsn(mut self, lsn: u64) -> Self {
        self.lsn = lsn;
        self
    }

    pub fn add_relation(mut self, id: u32, schema: &str, table: &str, columns: Vec<(&str, u32, bool)>) -> Self {
        let columns = columns
            .into_iter()
            .map(|(name, type_id, is_key)| MockColumn {
                name: name.to_string(),
                type_id,
                is_key,
            })
            .collect();
        self.relations.insert(
            id,
            MockRelation {
                id,
                schema: schema.to_string(),
                table: table.to_string(),
                columns,
            },
        );
        self
    }

    /// Adds the sentry table under [`SENTRY_REL_ID`].
    pub fn with_sentry(self) -> Self {
        self.add_relation(
            SENTRY_REL_ID,
            INTERNAL_SCHEMA,
            SENTRY_TABLE,
            vec![("seq", type_oids::INT8, false)],
        )
    }

    pub fn lsn(&self) -> u64 {
        self.lsn
    }

    /// Wraps a payload in an XLogData ('w') frame.
    pub fn xlog_data(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(self.lsn);
        buf.put_u64(self.lsn + 0x100);
        buf.put_i64(self.timestamp);
        buf.put_slice(payload);
        buf.freeze()
    }

    pub fn begin_message(&self, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(self.lsn);
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        buf.freeze()
    }

    pub fn commit_message(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(self.lsn);
        buf.put_u64(self.lsn + 0x100);
        buf.put_i64(self.timestamp);
        buf.freeze()
    }

    pub fn relation_message(&self, rel_id: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(rel_id);
        let relation = match self.relations.get(&rel_id) {
            Some(relation) => relation,
            None => panic!("relation {} not registered, use add_relation() first", rel_id),
        };
        put_cstr(&mut buf, &relation.schema);
        put_cstr(&mut buf, &relation.table);
        buf.put_u8(b'd');
        buf.put_u16(relation.columns.len() as u16);
        for column in &relation.columns {
            buf.put_u8(u8::from(column.is_key));
            put_cstr(&mut buf, &column.name);
            buf.put_u32(column.type_id);
            buf.put_i32(-1);
        }
        buf.freeze()
    }

    pub fn insert_message(&self, rel_id: u32, values: Vec<(&str, Option<&str>)>) -> Bytes {
        self.insert_values(rel_id, values.into_iter().map(|(_, v)| v.into()).collect())
    }

    pub fn insert_values(&self, rel_id: u32, values: Vec<MockValue>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(rel_id);
        buf.put_u8(b'N');
        put_tuple(&mut buf, &values);
        buf.freeze()
    }

    /// An update with an optional old image sent as a full row ('O').
    pub fn update_message(
        &self,
        rel_id: u32,
        old_values: Option<Vec<(&str, Option<&str>)>>,
        new_values: Vec<(&str, Option<&str>)>,
    ) -> Bytes {
        let old = old_values.map(|old| (b'O', old.into_iter().map(|(_, v)| v.into()).collect()));
        self.update_values(rel_id, old, new_values.into_iter().map(|(_, v)| v.into()).collect())
    }

    pub fn update_values(&self, rel_id: u32, old: Option<(u8, Vec<MockValue>)>, new: Vec<MockValue>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(rel_id);
        if let Some((tag, old)) = old {
            buf.put_u8(tag);
            put_tuple(&mut buf, &old);
        }
        buf.put_u8(b'N');
        put_tuple(&mut buf, &new);
        buf.freeze()
    }

    pub fn delete_message(&self, rel_id: u32, old_values: Vec<(&str, Option<&str>)>) -> Bytes {
        self.delete_values(rel_id, b'O', old_values.into_iter().map(|(_, v)| v.into()).collect())
    }

    pub fn delete_values(&self, rel_id: u32, tag: u8, old: Vec<MockValue>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(rel_id);
        buf.put_u8(tag);
        put_tuple(&mut buf, &old);
        buf.freeze()
    }

    pub fn truncate_message(&self, options: u8, rel_ids: Vec<u32>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        buf.put_u32(rel_ids.len() as u32);
        buf.put_u8(options);
        for rel_id in rel_ids {
            buf.put_u32(rel_id);
        }
        buf.freeze()
    }

    /// The sentry row going from `seq - 1` to `seq`.
    pub fn sentry_update(&self, seq: i64) -> Bytes {
        let old = (seq - 1).to_string();
        let new = seq.to_string();
        self.update_message(
            SENTRY_REL_ID,
            Some(vec![("seq", Some(old.as_str()))]),
            vec![("seq", Some(new.as_str()))],
        )
    }

    pub fn begin_prepare_message(&self, xid: u32, gid: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'b');
        buf.put_u64(self.lsn);
        buf.put_u64(self.lsn + 0x100);
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        put_cstr(&mut buf, gid);
        buf.freeze()
    }

    pub fn prepare_message(&self, xid: u32, gid: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'P');
        self.put_prepare_body(&mut buf, xid, gid);
        buf.freeze()
    }

    pub fn commit_prepared_message(&self, xid: u32, gid: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'K');
        buf.put_u8(0);
        buf.put_u64(self.lsn);
        buf.put_u64(self.lsn + 0x100);
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        put_cstr(&mut buf, gid);
        buf.freeze()
    }

    pub fn rollback_prepared_message(&self, xid: u32, gid: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'r');
        buf.put_u8(0);
        buf.put_u64(self.lsn);
        buf.put_u64(self.lsn + 0x100);
        buf.put_i64(self.timestamp);
        buf.put_i64(self.timestamp + 1);
        buf.put_u32(xid);
        put_cstr(&mut buf, gid);
        buf.freeze()
    }

    pub fn stream_start_message(&self, xid: u32, first_segment: bool) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'S');
        buf.put_u32(xid);
        buf.put_u8(u8::from(first_segment));
        buf.freeze()
    }

    pub fn stream_stop_message(&self) -> Bytes {
        Bytes::from_static(b"E")
    }

    pub fn logical_message(&self, transactional: bool, prefix: &str, content: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'M');
        buf.put_u8(u8::from(transactional));
        buf.put_u64(self.lsn);
        put_cstr(&mut buf, prefix);
        buf.put_u32(content.len() as u32);
        buf.put_slice(content);
        buf.freeze()
    }

    pub fn origin_message(&self, name: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'O');
        buf.put_u64(self.lsn);
        put_cstr(&mut buf, name);
        buf.freeze()
    }

    fn put_prepare_body(&self, buf: &mut BytesMut, xid: u32, gid: &str) {
        buf.put_u8(0);
        buf.put_u64(self.lsn);
        buf.put_u64(self.lsn + 0x100);
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        put_cstr(buf, gid);
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, values: &[MockValue]) {
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            MockValue::Null => buf.put_u8(b'n'),
            MockValue::Toast => buf.put_u8(b'u'),
            MockValue::Text(text) => {
                buf.put_u8(b't');
                buf.put_u32(text.len() as u32);
                buf.put_slice(text.as_bytes());
            }
            MockValue::Binary(data) => {
                buf.put_u8(b'b');
                buf.put_u32(data.len() as u32);
                buf.put_slice(data);
            }
        }
    }
}

/// Type OIDs used in mock relations.
pub mod type_oids {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const INT8: u32 = 20;
    pub const TEXT: u32 = 25;
    pub const JSONB: u32 = 3802;
    pub const UUID: u32 = 2950;
    pub const NUMERIC: u32 = 1700;
    pub const INT8_ARRAY: u32 = 1016;
    pub const TEXT_ARRAY: u32 = 1009;
    /// Stand-ins for the database-assigned uint256 domain OIDs.
    pub const UINT256: u32 = 16_385;
    pub const UINT256_ARRAY: u32 = 16_384;
}

/// Type map with the mock uint256 OIDs.
pub fn test_oids() -> crate::postgres::types::OidTypes {
    crate::postgres::types::OidTypes::new(type_oids::UINT256, type_oids::UINT256_ARRAY)
}
