//! Replayable changesets: a binary description of the rows a transaction
//! inserted, updated and deleted in the tracked schemas.
//!
//! A changeset is a sequence of tagged records:
//!
//! | tag    | record                                |
//! |--------|---------------------------------------|
//! | `0x01` | insert: one tuple                     |
//! | `0x02` | update: old tuple then new tuple      |
//! | `0x03` | delete: one tuple                     |
//! | `0x04` | metadata: every relation referenced   |
//!
//! Each tuple and the metadata block are prefixed by their length as a
//! little-endian `u32`. The metadata record is always last. Tuples refer to
//! their relation by its index in the metadata block.

use bytes::{Buf, BufMut};
use std::collections::HashMap;
use tracing::trace;

use crate::postgres::decoder::{self, RelationInfo, TupleData};
use crate::postgres::types::{DataType, OidTypes, ScalarType, Value};
use crate::{Error, Result};

pub const INSERT_TAG: u8 = 0x01;
pub const UPDATE_TAG: u8 = 0x02;
pub const DELETE_TAG: u8 = 0x03;
pub const METADATA_TAG: u8 = 0x04;

/// A column value within a changeset tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleColumn {
    Null,
    /// Unchanged TOAST value. Carries no data and is not null.
    Toast,
    /// The value in the column type's changeset encoding.
    Serialized(Vec<u8>),
}

impl TupleColumn {
    pub fn value_type(&self) -> u8 {
        match self {
            TupleColumn::Null => 0,
            TupleColumn::Toast => 1,
            TupleColumn::Serialized(_) => 2,
        }
    }
}

/// One row image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    pub relation_idx: u32,
    pub columns: Vec<TupleColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub schema: String,
    pub name: String,
    pub columns: Vec<Column>,
}

/// The changes made to one relation in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changeset {
    pub schema: String,
    pub table: String,
    pub columns: Vec<Column>,
    pub inserts: Vec<Tuple>,
    /// Old and new images. The old image has no columns when postgres did
    /// not send one, in which case the row is identified by the new image's
    /// key columns.
    pub updates: Vec<(Tuple, Tuple)>,
    pub deletes: Vec<Tuple>,
}

impl Changeset {
    /// Decodes a tuple's columns into typed values. Null and TOAST columns
    /// both decode to `None`.
    pub fn decode_tuple(&self, tuple: &Tuple) -> Result<Vec<Option<Value>>> {
        if !tuple.columns.is_empty() && tuple.columns.len() != self.columns.len() {
            return Err(Error::Changeset(format!(
                "tuple has {} columns, {}.{} has {}",
                tuple.columns.len(),
                self.schema,
                self.table,
                self.columns.len()
            )));
        }
        tuple
            .columns
            .iter()
            .zip(&self.columns)
            .map(|(col, def)| match col {
                TupleColumn::Null | TupleColumn::Toast => Ok(None),
                TupleColumn::Serialized(data) => def.data_type.deserialize_changeset(data).map(Some),
            })
            .collect()
    }
}

/// All changesets of one transaction, in order of first reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangesetGroup {
    pub changesets: Vec<Changeset>,
}

impl ChangesetGroup {
    /// Parses a serialized changeset.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        deserialize_changeset(data)
    }

    /// Re-encodes the group in the changeset format. Records are grouped by
    /// relation rather than in their original order.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut metadata = Vec::with_capacity(self.changesets.len());
        for cs in &self.changesets {
            for t in &cs.inserts {
                buf.put_u8(INSERT_TAG);
                put_tuple(&mut buf, t)?;
            }
            for (old, new) in &cs.updates {
                buf.put_u8(UPDATE_TAG);
                put_tuple(&mut buf, old)?;
                put_tuple(&mut buf, new)?;
            }
            for t in &cs.deletes {
                buf.put_u8(DELETE_TAG);
                put_tuple(&mut buf, t)?;
            }
            metadata.push(Relation {
                schema: cs.schema.clone(),
                name: cs.table.clone(),
                columns: cs.columns.clone(),
            });
        }
        buf.put_u8(METADATA_TAG);
        put_metadata(&mut buf, &metadata)?;
        Ok(buf)
    }
}

/// Reads a changeset produced by [`ChangesetWriter`].
pub fn deserialize_changeset(mut data: &[u8]) -> Result<ChangesetGroup> {
    if data.is_empty() {
        return Err(Error::Changeset("empty changeset".to_string()));
    }

    let mut inserts = Vec::new();
    let mut updates = Vec::new();
    let mut deletes = Vec::new();
    let mut metadata = None;

    while data.has_remaining() {
        if metadata.is_some() {
            return Err(Error::Changeset(format!(
                "{} bytes after the metadata record",
                data.remaining()
            )));
        }
        let tag = data.get_u8();
        match tag {
            INSERT_TAG => inserts.push(read_tuple(&mut data)?),
            UPDATE_TAG => {
                let old = read_tuple(&mut data)?;
                let new = read_tuple(&mut data)?;
                updates.push((old, new));
            }
            DELETE_TAG => deletes.push(read_tuple(&mut data)?),
            METADATA_TAG => metadata = Some(read_metadata(&mut data)?),
            other => {
                return Err(Error::Changeset(format!("unknown changeset record tag {:#04x}", other)))
            }
        }
    }

    let relations =
        metadata.ok_or_else(|| Error::Changeset("changeset has no metadata record".to_string()))?;

    let mut changesets: Vec<Changeset> = relations
        .into_iter()
        .map(|rel| Changeset {
            schema: rel.schema,
            table: rel.name,
            columns: rel.columns,
            inserts: Vec::new(),
            updates: Vec::new(),
            deletes: Vec::new(),
        })
        .collect();

    let count = changesets.len();
    let slot = |idx: u32| -> Result<usize> {
        let i = idx as usize;
        if i >= count {
            return Err(Error::Changeset(format!(
                "tuple references relation {} but metadata has {}",
                idx, count
            )));
        }
        Ok(i)
    };

    for t in inserts {
        let i = slot(t.relation_idx)?;
        changesets[i].inserts.push(t);
    }
    for (old, new) in updates {
        let i = slot(new.relation_idx)?;
        if old.relation_idx != new.relation_idx {
            return Err(Error::Changeset(format!(
                "update old tuple relation {} differs from new tuple relation {}",
                old.relation_idx, new.relation_idx
            )));
        }
        changesets[i].updates.push((old, new));
    }
    for t in deletes {
        let i = slot(t.relation_idx)?;
        changesets[i].deletes.push(t);
    }

    Ok(ChangesetGroup { changesets })
}

/// Serializes decoded WAL row changes for one transaction at a time.
#[derive(Debug, Default)]
pub struct ChangesetWriter {
    buf: Vec<u8>,
    relations: Vec<Relation>,
    relation_idx: HashMap<(String, String), u32>,
}

impl ChangesetWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if nothing has been written since the last commit or failure.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty() && self.relations.is_empty()
    }

    fn register(&mut self, rel: &RelationInfo, oids: &OidTypes) -> Result<u32> {
        let key = (rel.schema.clone(), rel.table.clone());
        if let Some(idx) = self.relation_idx.get(&key) {
            return Ok(*idx);
        }

        let columns = rel
            .columns
            .iter()
            .map(|c| {
                Ok(Column {
                    name: c.name.clone(),
                    data_type: oids.require(c.type_id)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let idx = self.relations.len() as u32;
        self.relations.push(Relation {
            schema: rel.schema.clone(),
            name: rel.table.clone(),
            columns,
        });
        self.relation_idx.insert(key, idx);
        trace!(relation = %rel.qualified_name(), idx, "registered changeset relation");
        Ok(idx)
    }

    pub fn write_insert(&mut self, rel: &RelationInfo, tuple: &TupleData, oids: &OidTypes) -> Result<()> {
        let idx = self.register(rel, oids)?;
        let tup = convert_tuple(idx, tuple, rel, oids)?;
        self.buf.put_u8(INSERT_TAG);
        put_tuple(&mut self.buf, &tup)
    }

    pub fn write_update(
        &mut self,
        rel: &RelationInfo,
        old: Option<&TupleData>,
        new: &TupleData,
        oids: &OidTypes,
    ) -> Result<()> {
        let idx = self.register(rel, oids)?;
        let old_tup = match old {
            Some(old) => convert_tuple(idx, old, rel, oids)?,
            None => Tuple {
                relation_idx: idx,
                columns: Vec::new(),
            },
        };
        let new_tup = convert_tuple(idx, new, rel, oids)?;
        self.buf.put_u8(UPDATE_TAG);
        put_tuple(&mut self.buf, &old_tup)?;
        put_tuple(&mut self.buf, &new_tup)
    }

    pub fn write_delete(&mut self, rel: &RelationInfo, old: &TupleData, oids: &OidTypes) -> Result<()> {
        let idx = self.register(rel, oids)?;
        let tup = convert_tuple(idx, old, rel, oids)?;
        self.buf.put_u8(DELETE_TAG);
        put_tuple(&mut self.buf, &tup)
    }

    /// Appends the metadata record and returns the finished changeset,
    /// leaving the writer empty for the next transaction.
    pub fn commit(&mut self) -> Result<Vec<u8>> {
        let mut out = std::mem::take(&mut self.buf);
        out.put_u8(METADATA_TAG);
        let relations = std::mem::take(&mut self.relations);
        self.relation_idx.clear();
        put_metadata(&mut out, &relations)?;
        Ok(out)
    }

    /// Discards everything written for the current transaction.
    pub fn fail(&mut self) {
        self.buf.clear();
        self.relations.clear();
        self.relation_idx.clear();
    }
}

fn convert_tuple(idx: u32, tuple: &TupleData, rel: &RelationInfo, oids: &OidTypes) -> Result<Tuple> {
    if tuple.columns.len() != rel.columns.len() {
        return Err(Error::invalid_message(format!(
            "Column count mismatch for {}: {} vs {}",
            rel.qualified_name(),
            tuple.columns.len(),
            rel.columns.len()
        )));
    }

    let mut columns = Vec::with_capacity(tuple.columns.len());
    for (col, def) in tuple.columns.iter().zip(&rel.columns) {
        let converted = match col {
            decoder::TupleColumn::Null => TupleColumn::Null,
            decoder::TupleColumn::Toast => TupleColumn::Toast,
            decoder::TupleColumn::Text(data) => {
                let data_type = oids.require(def.type_id)?;
                let text = std::str::from_utf8(data).map_err(|e| {
                    Error::Codec(format!("column {} is not valid utf-8: {}", def.name, e))
                })?;
                TupleColumn::Serialized(data_type.serialize_changeset(text)?)
            }
            decoder::TupleColumn::Binary(_) => {
                return Err(Error::invalid_message(format!(
                    "Binary tuple data for column {} is not supported",
                    def.name
                )))
            }
        };
        columns.push(converted);
    }

    Ok(Tuple {
        relation_idx: idx,
        columns,
    })
}

fn length_u32(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Changeset(format!("{} too large ({} bytes)", what, len)))
}

fn length_u16(len: usize, what: &str) -> Result<u16> {
    u16::try_from(len).map_err(|_| Error::Changeset(format!("{} too large ({})", what, len)))
}

fn put_tuple(buf: &mut Vec<u8>, tuple: &Tuple) -> Result<()> {
    let mut body = Vec::new();
    body.put_u32(tuple.relation_idx);
    body.put_u16(length_u16(tuple.columns.len(), "tuple column count")?);
    for col in &tuple.columns {
        body.put_u8(col.value_type());
        if let TupleColumn::Serialized(data) = col {
            body.put_u32(length_u32(data.len(), "column value")?);
            body.extend_from_slice(data);
        }
    }
    buf.put_u32_le(length_u32(body.len(), "tuple")?);
    buf.extend_from_slice(&body);
    Ok(())
}

fn put_str16(buf: &mut Vec<u8>, s: &str, what: &str) -> Result<()> {
    buf.put_u16(length_u16(s.len(), what)?);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_metadata(buf: &mut Vec<u8>, relations: &[Relation]) -> Result<()> {
    let mut body = Vec::new();
    body.put_u32(length_u32(relations.len(), "relation count")?);
    for rel in relations {
        put_str16(&mut body, &rel.schema, "schema name")?;
        put_str16(&mut body, &rel.name, "table name")?;
        body.put_u16(length_u16(rel.columns.len(), "column count")?);
        for col in &rel.columns {
            put_str16(&mut body, &col.name, "column name")?;
            body.put_u8(col.data_type.scalar.tag());
            body.put_u8(col.data_type.is_array as u8);
        }
    }
    buf.put_u32_le(length_u32(body.len(), "metadata")?);
    buf.extend_from_slice(&body);
    Ok(())
}

fn truncated(what: &str) -> Error {
    Error::Changeset(format!("truncated changeset reading {}", what))
}

/// Splits off a `u32` little-endian length-prefixed payload.
fn read_payload<'a>(data: &mut &'a [u8], what: &str) -> Result<&'a [u8]> {
    if data.remaining() < 4 {
        return Err(truncated(what));
    }
    let len = data.get_u32_le() as usize;
    if data.remaining() < len {
        return Err(truncated(what));
    }
    let (payload, rest) = data.split_at(len);
    *data = rest;
    Ok(payload)
}

fn read_tuple(data: &mut &[u8]) -> Result<Tuple> {
    let mut body = read_payload(data, "tuple")?;
    if body.remaining() < 6 {
        return Err(truncated("tuple header"));
    }
    let relation_idx = body.get_u32();
    let num_columns = body.get_u16();

    let mut columns = Vec::with_capacity(num_columns as usize);
    for _ in 0..num_columns {
        if !body.has_remaining() {
            return Err(truncated("tuple column"));
        }
        let col = match body.get_u8() {
            0 => TupleColumn::Null,
            1 => TupleColumn::Toast,
            2 => {
                if body.remaining() < 4 {
                    return Err(truncated("column length"));
                }
                let len = body.get_u32() as usize;
                if body.remaining() < len {
                    return Err(truncated("column value"));
                }
                let value = body[..len].to_vec();
                body.advance(len);
                TupleColumn::Serialized(value)
            }
            other => return Err(Error::Changeset(format!("unknown column value type {}", other))),
        };
        columns.push(col);
    }
    if body.has_remaining() {
        return Err(Error::Changeset(format!("{} unexpected bytes in tuple", body.remaining())));
    }

    Ok(Tuple {
        relation_idx,
        columns,
    })
}

fn read_str16(body: &mut &[u8], what: &str) -> Result<String> {
    if body.remaining() < 2 {
        return Err(truncated(what));
    }
    let len = body.get_u16() as usize;
    if body.remaining() < len {
        return Err(truncated(what));
    }
    let s = String::from_utf8(body[..len].to_vec())
        .map_err(|e| Error::Changeset(format!("invalid {}: {}", what, e)))?;
    body.advance(len);
    Ok(s)
}

fn read_metadata(data: &mut &[u8]) -> Result<Vec<Relation>> {
    let mut body = read_payload(data, "metadata")?;
    if body.remaining() < 4 {
        return Err(truncated("relation count"));
    }
    let num_relations = body.get_u32();

    let mut relations = Vec::new();
    for _ in 0..num_relations {
        let schema = read_str16(&mut body, "schema name")?;
        let name = read_str16(&mut body, "table name")?;
        if body.remaining() < 2 {
            return Err(truncated("column count"));
        }
        let num_columns = body.get_u16();
        let mut columns = Vec::with_capacity(num_columns as usize);
        for _ in 0..num_columns {
            let col_name = read_str16(&mut body, "column name")?;
            if body.remaining() < 2 {
                return Err(truncated("column type"));
            }
            let tag = body.get_u8();
            let scalar = ScalarType::from_tag(tag)
                .ok_or_else(|| Error::Changeset(format!("unknown column type tag {}", tag)))?;
            let data_type = match body.get_u8() {
                0 => DataType::scalar(scalar),
                1 => DataType::array(scalar),
                other => return Err(Error::Changeset(format!("invalid array flag {}", other))),
            };
            columns.push(Column {
                name: col_name,
                data_type,
            });
        }
        relations.push(Relation {
            schema,
            name,
            columns,
        });
    }
    if body.has_remaining() {
        return Err(Error::Changeset(format!("{} unexpected bytes in metadata", body.remaining())));
    }

    Ok(relations)
}
