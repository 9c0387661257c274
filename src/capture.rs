//! Turns the decoded WAL stream into one commit hash, and optionally one
//! changeset, per transaction.
//!
//! The bytes fed to the hash are consensus critical: two nodes applying the
//! same statements must produce identical hashes. Nothing that varies between
//! deployments (relation OIDs, LSNs, timestamps) may be hashed.

use bytes::BufMut;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use crate::changeset::ChangesetWriter;
use crate::postgres::decoder::{format_lsn, LogicalMessage, PgOutputDecoder, RelationInfo, TupleColumn, TupleData};
use crate::postgres::types::OidTypes;
use crate::sequence::is_sentry;
use crate::{Error, Result};

/// Decides whether changes to a schema are hashed and captured.
pub type SchemaFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A filter accepting schemas that start with `prefix`.
pub fn prefix_schema_filter(prefix: impl Into<String>) -> SchemaFilter {
    let prefix = prefix.into();
    Arc::new(move |schema: &str| schema.starts_with(&prefix))
}

/// SHA-256 of empty input, the hash of a transaction with no tracked changes.
pub const EMPTY_HASH: [u8; 32] = [
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
];

/// Identifies a tracked commit: its sequence number and the hash of its changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommitId {
    pub seq: i64,
    pub hash: [u8; 32],
}

impl CommitId {
    /// `seq` as big-endian bytes followed by the hash.
    pub fn to_bytes(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..].copy_from_slice(&self.hash);
        out
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seq, hex::encode(self.hash))
    }
}

/// A finished transaction from the WAL stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedTx {
    /// Sequence from the sentry update, `None` for an untracked commit.
    pub seq: Option<i64>,
    pub hash: [u8; 32],
    pub changeset: Option<Vec<u8>>,
    pub end_lsn: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalStats {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub truncates: u64,
}

/// Stateful consumer of pgoutput messages for one replication session.
pub struct TxCapture {
    decoder: PgOutputDecoder,
    hasher: Sha256,
    seq: Option<i64>,
    stats: WalStats,
    filter: SchemaFilter,
    oids: Arc<OidTypes>,
    writer: Option<ChangesetWriter>,
}

impl TxCapture {
    pub fn new(filter: SchemaFilter, oids: Arc<OidTypes>, capture_changesets: bool) -> Self {
        Self {
            decoder: PgOutputDecoder::new(),
            hasher: Sha256::new(),
            seq: None,
            stats: WalStats::default(),
            filter,
            oids,
            writer: capture_changesets.then(ChangesetWriter::new),
        }
    }

    /// Processes one XLogData payload. Returns the finished transaction when
    /// the payload ends one (`Commit` or `Prepare`).
    pub fn process(&mut self, wal_data: &[u8]) -> Result<Option<FinishedTx>> {
        let msg = self.decoder.decode(wal_data)?;

        match msg {
            LogicalMessage::Relation(rel) => {
                trace!(relation = %rel.qualified_name(), id = rel.id, "relation");
            }
            LogicalMessage::Begin { final_lsn, xid, .. } => {
                trace!(lsn = %format_lsn(final_lsn), xid, "begin");
            }
            LogicalMessage::Commit {
                commit_lsn, end_lsn, ..
            } => {
                trace!(lsn = %format_lsn(commit_lsn), "commit");
                return self.finish(end_lsn).map(Some);
            }
            LogicalMessage::Insert { rel_id, tuple, .. } => self.on_insert(rel_id, &tuple)?,
            LogicalMessage::Update {
                rel_id,
                old_tuple_type,
                old_tuple,
                new_tuple,
                ..
            } => self.on_update(rel_id, old_tuple_type, old_tuple.as_ref(), &new_tuple)?,
            LogicalMessage::Delete {
                rel_id,
                old_tuple_type,
                old_tuple,
                ..
            } => self.on_delete(rel_id, old_tuple_type, &old_tuple)?,
            LogicalMessage::Truncate { options, rel_ids, .. } => self.on_truncate(options, &rel_ids),
            LogicalMessage::Type { type_id, namespace, name, .. } => {
                debug!("type message: {}.{} ({})", namespace, name, type_id);
            }
            LogicalMessage::Origin { commit_lsn, name } => {
                debug!("origin message: {} {}", name, format_lsn(commit_lsn));
            }
            LogicalMessage::Message {
                prefix,
                content,
                transactional,
                ..
            } => {
                debug!(
                    "logical decoding message: {:?} ({} bytes, transactional {})",
                    prefix,
                    content.len(),
                    transactional
                );
            }
            LogicalMessage::BeginPrepare { xid, gid, prepare_lsn, .. } => {
                debug!("begin prepare {:?} xid {} at {}", gid, xid, format_lsn(prepare_lsn));
            }
            LogicalMessage::Prepare(info) => {
                debug!("prepare {:?} xid {} at {}", info.gid, info.xid, format_lsn(info.prepare_lsn));
                // The commit or rollback comes later as its own message. This
                // is the end of the change stream for the transaction.
                return self.finish(info.end_lsn).map(Some);
            }
            LogicalMessage::CommitPrepared { gid, commit_lsn, .. } => {
                debug!("commit prepared {:?} at {}", gid, format_lsn(commit_lsn));
            }
            LogicalMessage::RollbackPrepared { gid, rollback_end_lsn, .. } => {
                debug!("rollback prepared {:?} at {}", gid, format_lsn(rollback_end_lsn));
                self.discard();
            }
            LogicalMessage::StreamStart { xid, first_segment } => {
                warn!("stream start: xid {}, first segment {}", xid, first_segment);
            }
            LogicalMessage::StreamStop => warn!("stream stop"),
            LogicalMessage::StreamCommit { xid, .. } => warn!("stream commit: xid {}", xid),
            LogicalMessage::StreamAbort { xid, sub_xid } => {
                warn!("stream abort: xid {}, subxid {}", xid, sub_xid)
            }
            LogicalMessage::StreamPrepare(info) => warn!("stream prepare {:?}", info.gid),
        }

        Ok(None)
    }

    fn relation(&self, rel_id: u32, op: &str) -> Result<&RelationInfo> {
        self.decoder
            .relation(rel_id)
            .ok_or_else(|| Error::invalid_message(format!("{}: unknown relation ID {}", op, rel_id)))
    }

    fn on_insert(&mut self, rel_id: u32, tuple: &TupleData) -> Result<()> {
        let rel = self.relation(rel_id, "insert")?.clone();
        if !(self.filter)(&rel.schema) {
            return Ok(());
        }

        if let Some(writer) = self.writer.as_mut() {
            writer.write_insert(&rel, tuple, &self.oids)?;
        }
        self.hasher.update(encode_insert(&rel.qualified_name(), tuple));

        debug!("INSERT into {}: {}", rel.qualified_name(), LazyValues { tuple, rel: &rel });
        self.stats.inserts += 1;
        Ok(())
    }

    fn on_update(
        &mut self,
        rel_id: u32,
        old_tuple_type: u8,
        old: Option<&TupleData>,
        new: &TupleData,
    ) -> Result<()> {
        let rel = self.relation(rel_id, "update")?.clone();

        // The sequence is captured before the schema filter is applied.
        if is_sentry(&rel.schema, &rel.table) {
            if let Some(seq) = sentry_seq(new) {
                if let Some(prev) = self.seq {
                    return Err(Error::Invariant(format!(
                        "sequence already set to {} in this transaction, saw {}",
                        prev, seq
                    )));
                }
                self.seq = Some(seq);
            }
        }

        if !(self.filter)(&rel.schema) {
            return Ok(());
        }

        if let Some(writer) = self.writer.as_mut() {
            writer.write_update(&rel, old, new, &self.oids)?;
        }
        self.hasher
            .update(encode_update(&rel.qualified_name(), old_tuple_type, old, new));

        debug!(
            "UPDATE {}: {} => {}",
            rel.qualified_name(),
            OptionalValues(old.map(|tuple| LazyValues { tuple, rel: &rel })),
            LazyValues { tuple: new, rel: &rel }
        );
        self.stats.updates += 1;
        Ok(())
    }

    fn on_delete(&mut self, rel_id: u32, old_tuple_type: u8, old: &TupleData) -> Result<()> {
        let rel = self.relation(rel_id, "delete")?.clone();
        if !(self.filter)(&rel.schema) {
            return Ok(());
        }

        if let Some(writer) = self.writer.as_mut() {
            writer.write_delete(&rel, old, &self.oids)?;
        }
        self.hasher
            .update(encode_delete(&rel.qualified_name(), old_tuple_type, old));

        debug!("DELETE from {}: {}", rel.qualified_name(), LazyValues { tuple: old, rel: &rel });
        self.stats.deletes += 1;
        Ok(())
    }

    fn on_truncate(&mut self, options: u8, rel_ids: &[u32]) {
        let mut names = Vec::new();
        for rel_id in rel_ids {
            match self.decoder.relation(*rel_id) {
                Some(rel) if (self.filter)(&rel.schema) => names.push(rel.qualified_name()),
                Some(_) => {}
                None => warn!("unknown truncated relation ID {}", rel_id),
            }
        }
        if names.is_empty() {
            debug!("no relevant relations in truncate message");
            return;
        }

        self.hasher.update(encode_truncate(options, &names));
        self.stats.truncates += 1;
    }

    fn finish(&mut self, end_lsn: u64) -> Result<FinishedTx> {
        let hash: [u8; 32] = self.hasher.finalize_reset().into();
        let seq = self.seq.take();
        let changeset = match self.writer.as_mut() {
            Some(writer) => Some(writer.commit()?),
            None => None,
        };
        let stats = std::mem::take(&mut self.stats);

        match seq {
            None => {
                debug!(
                    "Commit hash {} (unsequenced / untracked) LSN {}",
                    hex::encode(hash),
                    format_lsn(end_lsn)
                );
            }
            Some(seq) if hash == EMPTY_HASH => {
                debug!(seq, "Commit hash {} LSN {}", hex::encode(hash), format_lsn(end_lsn));
            }
            Some(seq) => {
                info!(seq, "Commit hash {} LSN {}", hex::encode(hash), format_lsn(end_lsn));
            }
        }
        debug!(
            inserts = stats.inserts,
            updates = stats.updates,
            deletes = stats.deletes,
            truncates = stats.truncates,
            "wal commit stats"
        );

        Ok(FinishedTx {
            seq,
            hash,
            changeset,
            end_lsn,
        })
    }

    fn discard(&mut self) {
        self.hasher.reset();
        self.seq = None;
        self.stats = WalStats::default();
        if let Some(writer) = self.writer.as_mut() {
            writer.fail();
        }
    }
}

/// Reads the sequence from a sentry row image. Malformed images are logged
/// and ignored.
fn sentry_seq(tuple: &TupleData) -> Option<i64> {
    if tuple.columns.len() != 1 {
        warn!("not one column in sentry table update ({})", tuple.columns.len());
        return None;
    }
    let parsed = match &tuple.columns[0] {
        TupleColumn::Text(data) => std::str::from_utf8(data).ok().and_then(|s| s.parse().ok()),
        _ => None,
    };
    if parsed.is_none() {
        warn!("invalid sequence number in sentry table update: {:?}", tuple.columns[0]);
    }
    parsed
}

// The encodings below define the commit hash. Changing them changes every
// hash and breaks agreement with nodes running older code.

/// `u16` BE column count, then per column its tag byte and, for text and
/// binary values, a `u32` BE length and the bytes. An absent tuple is `0x00`.
pub fn encode_tuple(tuple: Option<&TupleData>) -> Vec<u8> {
    let tuple = match tuple {
        Some(t) => t,
        None => return vec![0],
    };
    let mut data = Vec::new();
    data.put_u16(tuple.columns.len() as u16);
    for col in &tuple.columns {
        data.put_u8(col.tag());
        if let Some(bytes) = col.data() {
            data.put_u32(bytes.len() as u32);
            data.extend_from_slice(bytes);
        }
    }
    data
}

pub fn encode_insert(rel_name: &str, tuple: &TupleData) -> Vec<u8> {
    let mut data = rel_name.as_bytes().to_vec();
    data.extend(encode_tuple(Some(tuple)));
    data
}

pub fn encode_update(rel_name: &str, old_tuple_type: u8, old: Option<&TupleData>, new: &TupleData) -> Vec<u8> {
    let mut data = rel_name.as_bytes().to_vec();
    data.push(old_tuple_type);
    data.extend(encode_tuple(old));
    data.extend(encode_tuple(Some(new)));
    data
}

pub fn encode_delete(rel_name: &str, old_tuple_type: u8, old: &TupleData) -> Vec<u8> {
    let mut data = rel_name.as_bytes().to_vec();
    data.push(old_tuple_type);
    data.extend(encode_tuple(Some(old)));
    data
}

pub fn encode_truncate(options: u8, rel_names: &[String]) -> Vec<u8> {
    let mut data = vec![options];
    for name in rel_names {
        data.extend_from_slice(name.as_bytes());
    }
    data
}

/// Renders tuple values only when the log line is actually emitted.
struct LazyValues<'a> {
    tuple: &'a TupleData,
    rel: &'a RelationInfo,
}

impl fmt::Display for LazyValues<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (col, def)) in self.tuple.columns.iter().zip(&self.rel.columns).enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match col {
                TupleColumn::Null => write!(f, "{}: NULL", def.name)?,
                TupleColumn::Toast => write!(f, "{}: <toast>", def.name)?,
                TupleColumn::Text(d) => write!(f, "{}: {:?}", def.name, String::from_utf8_lossy(d))?,
                TupleColumn::Binary(d) => write!(f, "{}: \\x{}", def.name, hex::encode(d))?,
            }
        }
        f.write_str("}")
    }
}

struct OptionalValues<'a>(Option<LazyValues<'a>>);

impl fmt::Display for OptionalValues<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(v) => v.fmt(f),
            None => f.write_str("<nil>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::deserialize_changeset;
    use crate::postgres::test_utils::{test_oids, type_oids, MockMessageBuilder, MockValue};
    use crate::postgres::types::{ScalarType, Value};
    use bytes::Bytes;

    const BLAH: u32 = 1;
    const OTHER: u32 = 2;

    fn builder() -> MockMessageBuilder {
        MockMessageBuilder::new()
            .with_sentry()
            .add_relation(
                BLAH,
                "ds_test",
                "blah",
                vec![
                    ("id", type_oids::INT8_ARRAY, true),
                    ("stuff", type_oids::TEXT, false),
                    ("val", type_oids::INT8, false),
                ],
            )
            .add_relation(OTHER, "public", "other", vec![("doc", type_oids::JSONB, false)])
    }

    fn capture(changesets: bool) -> TxCapture {
        TxCapture::new(prefix_schema_filter("ds_"), Arc::new(test_oids()), changesets)
    }

    /// Feeds relation messages for every registered table, then `msgs`,
    /// collecting the finished transactions.
    fn run(capture: &mut TxCapture, builder: &MockMessageBuilder, msgs: Vec<Bytes>) -> Result<Vec<FinishedTx>> {
        let mut finished = Vec::new();
        let relations = vec![
            builder.relation_message(crate::postgres::test_utils::SENTRY_REL_ID),
            builder.relation_message(BLAH),
            builder.relation_message(OTHER),
        ];
        for msg in relations.into_iter().chain(msgs) {
            if let Some(tx) = capture.process(&msg)? {
                finished.push(tx);
            }
        }
        Ok(finished)
    }

    fn text_tuple(values: &[Option<&str>]) -> TupleData {
        TupleData {
            columns: values
                .iter()
                .map(|v| match v {
                    Some(s) => TupleColumn::Text(Bytes::copy_from_slice(s.as_bytes())),
                    None => TupleColumn::Null,
                })
                .collect(),
        }
    }

    fn sha(parts: &[Vec<u8>]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().into()
    }

    #[test]
    fn test_tracked_transaction_hash_and_changeset() {
        let b = builder();
        let mut cap = capture(true);

        let msgs = vec![
            b.begin_message(700),
            b.insert_message(BLAH, vec![("id", Some("{11}")), ("stuff", Some("woot")), ("val", Some("42"))]),
            b.update_message(
                BLAH,
                Some(vec![("id", Some("{12}")), ("stuff", Some("a")), ("val", Some("1"))]),
                vec![("id", Some("{13}")), ("stuff", Some("b")), ("val", Some("1"))],
            ),
            b.delete_message(BLAH, vec![("id", Some("{11}")), ("stuff", Some("woot")), ("val", Some("42"))]),
            b.sentry_update(1),
            b.commit_message(),
        ];
        let finished = run(&mut cap, &b, msgs).unwrap();
        assert_eq!(finished.len(), 1);
        let tx = &finished[0];
        assert_eq!(tx.seq, Some(1));
        assert_eq!(tx.end_lsn, b.lsn() + 0x100);

        let row = text_tuple(&[Some("{11}"), Some("woot"), Some("42")]);
        let expected = sha(&[
            encode_insert("ds_test.blah", &row),
            encode_update(
                "ds_test.blah",
                b'O',
                Some(&text_tuple(&[Some("{12}"), Some("a"), Some("1")])),
                &text_tuple(&[Some("{13}"), Some("b"), Some("1")]),
            ),
            encode_delete("ds_test.blah", b'O', &row),
        ]);
        assert_eq!(tx.hash, expected);

        let group = deserialize_changeset(tx.changeset.as_ref().unwrap()).unwrap();
        assert_eq!(group.changesets.len(), 1);
        let cs = &group.changesets[0];
        assert_eq!((cs.schema.as_str(), cs.table.as_str()), ("ds_test", "blah"));
        assert_eq!(cs.inserts.len(), 1);
        assert_eq!(cs.updates.len(), 1);
        assert_eq!(cs.deletes.len(), 1);
        assert_eq!(
            cs.decode_tuple(&cs.inserts[0]).unwrap(),
            vec![
                Some(Value::Array(ScalarType::Int, vec![Value::Int(11)])),
                Some(Value::Text("woot".into())),
                Some(Value::Int(42)),
            ]
        );
        assert_eq!(
            cs.decode_tuple(&cs.updates[0].1).unwrap()[1],
            Some(Value::Text("b".into()))
        );
    }

    #[test]
    fn test_wide_numeric_values_are_captured() {
        const AMOUNTS: u32 = 3;
        let b = builder().add_relation(AMOUNTS, "ds_test", "amounts", vec![("amount", type_oids::NUMERIC, false)]);
        let mut cap = capture(true);

        let wide = "12345678901234567890123456789.5";
        let tiny = "0.00000000000000000000000000001";
        let msgs = vec![
            b.relation_message(AMOUNTS),
            b.begin_message(9),
            b.insert_message(AMOUNTS, vec![("amount", Some(wide))]),
            b.insert_message(AMOUNTS, vec![("amount", Some(tiny))]),
            b.sentry_update(2),
            b.commit_message(),
        ];
        let finished = run(&mut cap, &b, msgs).unwrap();
        assert_eq!(finished[0].seq, Some(2));

        let group = deserialize_changeset(finished[0].changeset.as_ref().unwrap()).unwrap();
        let cs = &group.changesets[0];
        let decoded: Vec<String> = cs
            .inserts
            .iter()
            .map(|t| cs.decode_tuple(t).unwrap()[0].as_ref().unwrap().to_string())
            .collect();
        assert_eq!(decoded, vec![wide.to_string(), tiny.to_string()]);
    }

    #[test]
    fn test_hash_is_deterministic_across_sessions() {
        let msgs = |b: &MockMessageBuilder| {
            vec![
                b.begin_message(1),
                b.insert_message(BLAH, vec![("id", Some("{1}")), ("stuff", None), ("val", Some("7"))]),
                b.sentry_update(5),
                b.commit_message(),
            ]
        };
        // Different LSNs and xids must not change the hash.
        let b1 = builder();
        let b2 = builder().with_lsn(0x9_0000);
        let h1 = run(&mut capture(true), &b1, msgs(&b1)).unwrap()[0].hash;
        let h2 = run(&mut capture(false), &b2, msgs(&b2)).unwrap()[0].hash;
        assert_eq!(h1, h2);

        let b3 = builder();
        let changed = vec![
            b3.begin_message(1),
            b3.insert_message(BLAH, vec![("id", Some("{1}")), ("stuff", None), ("val", Some("8"))]),
            b3.sentry_update(5),
            b3.commit_message(),
        ];
        let h3 = run(&mut capture(true), &b3, changed).unwrap()[0].hash;
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_filtered_schema_contributes_nothing() {
        let b = builder();
        let mut cap = capture(false);
        let msgs = vec![
            b.begin_message(1),
            b.insert_values(OTHER, vec![MockValue::from("{\"a\":1}")]),
            b.sentry_update(3),
            b.commit_message(),
        ];
        let tx = run(&mut cap, &b, msgs).unwrap().remove(0);
        assert_eq!(tx.seq, Some(3));
        assert_eq!(tx.hash, EMPTY_HASH);
        assert!(tx.changeset.is_none());
    }

    #[test]
    fn test_filtered_changes_produce_empty_changeset() {
        let b = builder();
        let mut cap = capture(true);
        let msgs = vec![b.begin_message(1), b.sentry_update(1), b.commit_message()];
        let tx = run(&mut cap, &b, msgs).unwrap().remove(0);
        assert_eq!(tx.hash, EMPTY_HASH);
        let group = deserialize_changeset(&tx.changeset.unwrap()).unwrap();
        assert!(group.changesets.is_empty());
    }

    #[test]
    fn test_untracked_commit_has_no_sequence() {
        let b = builder();
        let mut cap = capture(true);
        let msgs = vec![
            b.begin_message(1),
            b.insert_message(BLAH, vec![("id", Some("{1}")), ("stuff", Some("x")), ("val", Some("1"))]),
            b.commit_message(),
            b.begin_message(2),
            b.sentry_update(9),
            b.commit_message(),
        ];
        let finished = run(&mut cap, &b, msgs).unwrap();
        assert_eq!(finished.len(), 2);
        assert_eq!(finished[0].seq, None);
        assert_ne!(finished[0].hash, EMPTY_HASH);
        // State is reset between transactions.
        assert_eq!(finished[1].seq, Some(9));
        assert_eq!(finished[1].hash, EMPTY_HASH);
    }

    #[test]
    fn test_sequence_set_twice_is_invariant_violation() {
        let b = builder();
        let mut cap = capture(false);
        let msgs = vec![b.begin_message(1), b.sentry_update(1), b.sentry_update(2)];
        assert!(matches!(run(&mut cap, &b, msgs), Err(Error::Invariant(_))));
    }

    #[test]
    fn test_malformed_sentry_value_is_ignored() {
        let b = builder();
        let mut cap = capture(false);
        let msgs = vec![
            b.begin_message(1),
            b.update_values(crate::postgres::test_utils::SENTRY_REL_ID, None, vec![MockValue::Toast]),
            b.commit_message(),
        ];
        assert_eq!(run(&mut cap, &b, msgs).unwrap()[0].seq, None);
    }

    #[test]
    fn test_truncate_is_hashed_by_name() {
        let b = builder();
        let mut cap = capture(true);
        let msgs = vec![
            b.begin_message(1),
            b.truncate_message(0, vec![BLAH, OTHER, 4242]),
            b.sentry_update(2),
            b.commit_message(),
        ];
        let tx = run(&mut cap, &b, msgs).unwrap().remove(0);
        assert_eq!(tx.hash, sha(&[encode_truncate(0, &["ds_test.blah".to_string()])]));
    }

    #[test]
    fn test_prepare_finishes_and_rollback_discards() {
        let b = builder();
        let mut cap = capture(true);
        let msgs = vec![
            b.begin_prepare_message(10, "g1"),
            b.insert_message(BLAH, vec![("id", Some("{1}")), ("stuff", Some("x")), ("val", Some("1"))]),
            b.sentry_update(4),
            b.prepare_message(10, "g1"),
            b.commit_prepared_message(10, "g1"),
        ];
        let finished = run(&mut cap, &b, msgs).unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].seq, Some(4));

        // Partial state from a rolled back transaction never leaks into the next one.
        let msgs = vec![
            b.begin_prepare_message(11, "g2"),
            b.insert_message(BLAH, vec![("id", Some("{2}")), ("stuff", Some("y")), ("val", Some("2"))]),
            b.sentry_update(5),
            b.rollback_prepared_message(11, "g2"),
            b.begin_message(12),
            b.sentry_update(5),
            b.commit_message(),
        ];
        let finished = run(&mut cap, &b, msgs).unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].seq, Some(5));
        assert_eq!(finished[0].hash, EMPTY_HASH);
        let group = deserialize_changeset(finished[0].changeset.as_ref().unwrap()).unwrap();
        assert!(group.changesets.is_empty());
    }

    #[test]
    fn test_unknown_relation_is_an_error() {
        let b = builder();
        let mut cap = capture(false);
        let msgs = vec![b.begin_message(1), b.insert_values(77, vec![MockValue::Null])];
        assert!(matches!(run(&mut cap, &b, msgs), Err(Error::InvalidMessage { .. })));
    }

    #[test]
    fn test_unsupported_type_fails_changeset_capture() {
        let b = MockMessageBuilder::new().add_relation(3, "ds_x", "docs", vec![("doc", type_oids::JSONB, false)]);
        let insert = b.insert_values(3, vec![MockValue::from("{}")]);

        let mut cap = capture(true);
        cap.process(&b.relation_message(3)).unwrap();
        assert!(matches!(cap.process(&insert), Err(Error::UnsupportedType(3802))));

        // Hashing alone works on raw WAL bytes and needs no codec.
        let mut cap = capture(false);
        cap.process(&b.relation_message(3)).unwrap();
        assert!(cap.process(&insert).unwrap().is_none());
    }

    #[test]
    fn test_toast_columns_are_kept_distinct_from_null() {
        let toast = TupleData {
            columns: vec![TupleColumn::Toast],
        };
        let null = TupleData {
            columns: vec![TupleColumn::Null],
        };
        assert_eq!(encode_tuple(Some(&toast)), vec![0, 1, b'u']);
        assert_eq!(encode_tuple(Some(&null)), vec![0, 1, b'n']);
        assert_eq!(encode_tuple(None), vec![0]);
        assert_eq!(
            encode_tuple(Some(&text_tuple(&[Some("ab")]))),
            vec![0, 1, b't', 0, 0, 0, 2, b'a', b'b']
        );
    }

    #[test]
    fn test_commit_id_bytes_and_display() {
        let id = CommitId { seq: 258, hash: EMPTY_HASH };
        let bytes = id.to_bytes();
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(&bytes[8..], &EMPTY_HASH);
        assert!(id.to_string().starts_with("258:e3b0c442"));
        assert_eq!(EMPTY_HASH, sha(&[]));
    }
}
