//! The closed set of data types that can be stored, queried and captured in
//! changesets, and their conversions to and from postgres.

use bytes::BytesMut;
use fallible_iterator::FallibleIterator;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};
use uuid::Uuid;

use super::array::{frame_elements, parse_array_literal, unframe_elements, LengthWidth};
use super::numeric::{is_numeric, Numeric};
use super::uint256::{Uint256, UINT256_DOMAIN};
use crate::{Error, Result};

/// Scalar element types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Text,
    Int,
    Bool,
    Blob,
    Uuid,
    Decimal,
    Uint256,
}

impl ScalarType {
    pub const ALL: [ScalarType; 7] = [
        ScalarType::Text,
        ScalarType::Int,
        ScalarType::Bool,
        ScalarType::Blob,
        ScalarType::Uuid,
        ScalarType::Decimal,
        ScalarType::Uint256,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ScalarType::Text => "text",
            ScalarType::Int => "int",
            ScalarType::Bool => "bool",
            ScalarType::Blob => "blob",
            ScalarType::Uuid => "uuid",
            ScalarType::Decimal => "decimal",
            ScalarType::Uint256 => "uint256",
        }
    }

    /// Stable tag used in changeset metadata.
    pub fn tag(self) -> u8 {
        match self {
            ScalarType::Text => 1,
            ScalarType::Int => 2,
            ScalarType::Bool => 3,
            ScalarType::Blob => 4,
            ScalarType::Uuid => 5,
            ScalarType::Decimal => 6,
            ScalarType::Uint256 => 7,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        ScalarType::ALL.into_iter().find(|s| s.tag() == tag)
    }

    /// Element length prefix width when an array of this type is serialized.
    pub fn array_length_width(self) -> LengthWidth {
        match self {
            ScalarType::Text | ScalarType::Blob => LengthWidth::U32,
            ScalarType::Int | ScalarType::Bool | ScalarType::Uuid => LengthWidth::U8,
            ScalarType::Decimal | ScalarType::Uint256 => LengthWidth::U16,
        }
    }

    /// Converts the text form postgres emits in WAL tuple data to the
    /// changeset byte form.
    pub fn serialize_changeset(self, value: &str) -> Result<Vec<u8>> {
        match self {
            ScalarType::Text => Ok(value.as_bytes().to_vec()),
            ScalarType::Int => {
                let v: i64 = value
                    .parse()
                    .map_err(|e| Error::Codec(format!("invalid int {:?}: {}", value, e)))?;
                Ok(v.to_le_bytes().to_vec())
            }
            ScalarType::Bool => {
                if value.eq_ignore_ascii_case("t") || value.eq_ignore_ascii_case("true") {
                    Ok(vec![1])
                } else if value.eq_ignore_ascii_case("f") || value.eq_ignore_ascii_case("false") {
                    Ok(vec![0])
                } else {
                    Err(Error::Codec(format!("invalid boolean value: {}", value)))
                }
            }
            ScalarType::Blob => {
                let hex_str = value
                    .strip_prefix("\\x")
                    .ok_or_else(|| Error::Codec(format!("invalid blob value: {}", value)))?;
                hex::decode(hex_str).map_err(|e| Error::Codec(format!("invalid blob hex: {}", e)))
            }
            ScalarType::Uuid => {
                let u = Uuid::parse_str(value)
                    .map_err(|e| Error::Codec(format!("invalid uuid {:?}: {}", value, e)))?;
                Ok(u.as_bytes().to_vec())
            }
            ScalarType::Decimal => {
                let d: Numeric = value.parse()?;
                Ok(d.to_string().into_bytes())
            }
            ScalarType::Uint256 => {
                let u: Uint256 = value.parse()?;
                Ok(u.to_be_bytes().to_vec())
            }
        }
    }

    /// Inverse of [`ScalarType::serialize_changeset`], producing a typed value.
    pub fn deserialize_changeset(self, data: &[u8]) -> Result<Value> {
        match self {
            ScalarType::Text => String::from_utf8(data.to_vec())
                .map(Value::Text)
                .map_err(|e| Error::Codec(format!("invalid utf-8 text: {}", e))),
            ScalarType::Int => {
                let arr: [u8; 8] = data
                    .try_into()
                    .map_err(|_| Error::Codec(format!("int requires 8 bytes, got {}", data.len())))?;
                Ok(Value::Int(i64::from_le_bytes(arr)))
            }
            ScalarType::Bool => match data {
                [0] => Ok(Value::Bool(false)),
                [1] => Ok(Value::Bool(true)),
                _ => Err(Error::Codec(format!("invalid serialized bool {:?}", data))),
            },
            ScalarType::Blob => Ok(Value::Blob(data.to_vec())),
            ScalarType::Uuid => Uuid::from_slice(data)
                .map(Value::Uuid)
                .map_err(|e| Error::Codec(format!("invalid serialized uuid: {}", e))),
            ScalarType::Decimal => {
                let s = std::str::from_utf8(data)
                    .map_err(|e| Error::Codec(format!("invalid serialized decimal: {}", e)))?;
                s.parse().map(Value::Decimal)
            }
            ScalarType::Uint256 => Uint256::from_be_slice(data).map(Value::Uint256),
        }
    }
}

/// A registered data type: a scalar type or a one-dimensional array of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataType {
    pub scalar: ScalarType,
    pub is_array: bool,
}

impl DataType {
    pub const fn scalar(scalar: ScalarType) -> Self {
        Self {
            scalar,
            is_array: false,
        }
    }

    pub const fn array(scalar: ScalarType) -> Self {
        Self {
            scalar,
            is_array: true,
        }
    }

    pub fn serialize_changeset(&self, value: &str) -> Result<Vec<u8>> {
        if !self.is_array {
            return self.scalar.serialize_changeset(value);
        }
        let mut encoded = Vec::new();
        for elem in parse_array_literal(value)? {
            let elem = elem.ok_or_else(|| {
                Error::Codec(format!("NULL element in {} array is not supported", self.scalar.name()))
            })?;
            encoded.push(self.scalar.serialize_changeset(&elem)?);
        }
        frame_elements(encoded, self.scalar.array_length_width())
    }

    pub fn deserialize_changeset(&self, data: &[u8]) -> Result<Value> {
        if !self.is_array {
            return self.scalar.deserialize_changeset(data);
        }
        let values = unframe_elements(data, self.scalar.array_length_width())?
            .into_iter()
            .map(|elem| self.scalar.deserialize_changeset(elem))
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::Array(self.scalar, values))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_array {
            write!(f, "{}[]", self.scalar.name())
        } else {
            f.write_str(self.scalar.name())
        }
    }
}

mod oid {
    pub const BOOL: u32 = 16;
    pub const BYTEA: u32 = 17;
    pub const INT8: u32 = 20;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const TEXT: u32 = 25;
    pub const BOOL_ARRAY: u32 = 1000;
    pub const BYTEA_ARRAY: u32 = 1001;
    pub const INT2_ARRAY: u32 = 1005;
    pub const INT4_ARRAY: u32 = 1007;
    pub const TEXT_ARRAY: u32 = 1009;
    pub const INT8_ARRAY: u32 = 1016;
    pub const NUMERIC_ARRAY: u32 = 1231;
    pub const NUMERIC: u32 = 1700;
    pub const UUID: u32 = 2950;
    pub const UUID_ARRAY: u32 = 2951;
}

/// Type OID of `void`, returned by functions without a result.
pub const VOID_OID: u32 = 2278;

struct Registration {
    data_type: DataType,
    oid: u32,
    extra_oids: &'static [u32],
}

/// Types whose OIDs are fixed by postgres. `uint256` is registered per pool
/// because its domain OID depends on the database.
const BUILTIN: [Registration; 12] = [
    Registration { data_type: DataType::scalar(ScalarType::Text), oid: oid::TEXT, extra_oids: &[] },
    Registration { data_type: DataType::array(ScalarType::Text), oid: oid::TEXT_ARRAY, extra_oids: &[] },
    Registration { data_type: DataType::scalar(ScalarType::Int), oid: oid::INT8, extra_oids: &[oid::INT2, oid::INT4] },
    Registration {
        data_type: DataType::array(ScalarType::Int),
        oid: oid::INT8_ARRAY,
        extra_oids: &[oid::INT2_ARRAY, oid::INT4_ARRAY],
    },
    Registration { data_type: DataType::scalar(ScalarType::Bool), oid: oid::BOOL, extra_oids: &[] },
    Registration { data_type: DataType::array(ScalarType::Bool), oid: oid::BOOL_ARRAY, extra_oids: &[] },
    Registration { data_type: DataType::scalar(ScalarType::Blob), oid: oid::BYTEA, extra_oids: &[] },
    Registration { data_type: DataType::array(ScalarType::Blob), oid: oid::BYTEA_ARRAY, extra_oids: &[] },
    Registration { data_type: DataType::scalar(ScalarType::Uuid), oid: oid::UUID, extra_oids: &[] },
    Registration { data_type: DataType::array(ScalarType::Uuid), oid: oid::UUID_ARRAY, extra_oids: &[] },
    Registration { data_type: DataType::scalar(ScalarType::Decimal), oid: oid::NUMERIC, extra_oids: &[] },
    Registration { data_type: DataType::array(ScalarType::Decimal), oid: oid::NUMERIC_ARRAY, extra_oids: &[] },
];

/// Maps postgres type OIDs to registered data types for one database.
#[derive(Debug, Clone)]
pub struct OidTypes {
    by_oid: HashMap<u32, DataType>,
    uint256: Type,
    uint256_array: Type,
}

impl OidTypes {
    /// Builds the map given the OIDs of the `uint256` domain and its array type.
    ///
    /// # Panics
    ///
    /// Panics if two registrations claim the same OID. That is a programming
    /// error in the registration table, not a runtime condition.
    pub fn new(uint256_oid: u32, uint256_array_oid: u32) -> Self {
        let mut by_oid = HashMap::new();
        let mut register = |oid: u32, data_type: DataType| {
            if let Some(existing) = by_oid.insert(oid, data_type) {
                panic!("type OID {} registered twice ({} and {})", oid, existing, data_type);
            }
        };

        for reg in BUILTIN.iter() {
            register(reg.oid, reg.data_type);
            for extra in reg.extra_oids {
                register(*extra, reg.data_type);
            }
        }
        register(uint256_oid, DataType::scalar(ScalarType::Uint256));
        register(uint256_array_oid, DataType::array(ScalarType::Uint256));

        let uint256 = Type::new(
            UINT256_DOMAIN.to_string(),
            uint256_oid,
            Kind::Domain(Type::NUMERIC),
            "public".to_string(),
        );
        let uint256_array = Type::new(
            format!("_{}", UINT256_DOMAIN),
            uint256_array_oid,
            Kind::Array(uint256.clone()),
            "public".to_string(),
        );

        Self {
            by_oid,
            uint256,
            uint256_array,
        }
    }

    pub fn get(&self, oid: u32) -> Option<DataType> {
        self.by_oid.get(&oid).copied()
    }

    pub fn require(&self, oid: u32) -> Result<DataType> {
        self.get(oid).ok_or(Error::UnsupportedType(oid))
    }

    /// The postgres type used when a parameter's type is inferred from its value.
    pub fn pg_type(&self, data_type: DataType) -> Type {
        let scalar = match data_type.scalar {
            ScalarType::Text => Type::TEXT,
            ScalarType::Int => Type::INT8,
            ScalarType::Bool => Type::BOOL,
            ScalarType::Blob => Type::BYTEA,
            ScalarType::Uuid => Type::UUID,
            ScalarType::Decimal => Type::NUMERIC,
            ScalarType::Uint256 => {
                return if data_type.is_array {
                    self.uint256_array.clone()
                } else {
                    self.uint256.clone()
                }
            }
        };
        if !data_type.is_array {
            return scalar;
        }
        match data_type.scalar {
            ScalarType::Text => Type::TEXT_ARRAY,
            ScalarType::Int => Type::INT8_ARRAY,
            ScalarType::Bool => Type::BOOL_ARRAY,
            ScalarType::Blob => Type::BYTEA_ARRAY,
            ScalarType::Uuid => Type::UUID_ARRAY,
            _ => Type::NUMERIC_ARRAY,
        }
    }

    pub fn len(&self) -> usize {
        self.by_oid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_oid.is_empty()
    }
}

/// A value passed to or returned from postgres.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Int(i64),
    Bool(bool),
    Blob(Vec<u8>),
    Uuid(Uuid),
    Decimal(Numeric),
    Uint256(Uint256),
    /// A one-dimensional array. Elements are `Null` or of the given scalar type.
    Array(ScalarType, Vec<Value>),
}

impl Value {
    /// The registered type of this value, or `None` for `Null`.
    pub fn data_type(&self) -> Option<DataType> {
        let scalar = match self {
            Value::Null => return None,
            Value::Text(_) => ScalarType::Text,
            Value::Int(_) => ScalarType::Int,
            Value::Bool(_) => ScalarType::Bool,
            Value::Blob(_) => ScalarType::Blob,
            Value::Uuid(_) => ScalarType::Uuid,
            Value::Decimal(_) => ScalarType::Decimal,
            Value::Uint256(_) => ScalarType::Uint256,
            Value::Array(scalar, _) => return Some(DataType::array(*scalar)),
        };
        Some(DataType::scalar(scalar))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<Numeric> for Value {
    fn from(v: Numeric) -> Self {
        Value::Decimal(v)
    }
}

impl From<Uint256> for Value {
    fn from(v: Uint256) -> Self {
        Value::Uint256(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

type BoxError = Box<dyn StdError + Sync + Send>;

fn mismatch(value: &Value, ty: &Type) -> BoxError {
    format!("cannot encode {} as postgres type {}", value, ty).into()
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Text(s) => match *ty {
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => s.to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            Value::Int(v) => match *ty {
                Type::INT8 => v.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::TEXT | Type::VARCHAR => v.to_string().to_sql(ty, out),
                _ if *ty == Type::NUMERIC => Numeric::from(*v).to_sql(ty, out),
                _ if is_numeric(ty) => {
                    let u = u64::try_from(*v)?;
                    Uint256::from_u64(u).to_sql(ty, out)
                }
                _ => Err(mismatch(self, ty)),
            },
            Value::Bool(v) if *ty == Type::BOOL => v.to_sql(ty, out),
            Value::Blob(v) if *ty == Type::BYTEA => v.to_sql(ty, out),
            Value::Uuid(v) if *ty == Type::UUID => v.to_sql(ty, out),
            Value::Uuid(v) if *ty == Type::TEXT => v.to_string().to_sql(ty, out),
            Value::Decimal(v) if is_numeric(ty) => v.to_sql(ty, out),
            Value::Uint256(v) if is_numeric(ty) => v.to_sql(ty, out),
            Value::Uint256(v) if *ty == Type::TEXT => v.to_string().to_sql(ty, out),
            Value::Array(_, elems) => {
                let member = match ty.kind() {
                    Kind::Array(member) => member,
                    _ => return Err(mismatch(self, ty)),
                };
                let dimension = postgres_protocol::types::ArrayDimension {
                    len: i32::try_from(elems.len())?,
                    lower_bound: 1,
                };
                postgres_protocol::types::array_to_sql(
                    Some(dimension),
                    member.oid(),
                    elems.iter(),
                    |elem, buf| match elem.to_sql(member, buf)? {
                        IsNull::No => Ok(postgres_protocol::IsNull::No),
                        IsNull::Yes => Ok(postgres_protocol::IsNull::Yes),
                    },
                    out,
                )?;
                Ok(IsNull::No)
            }
            _ => Err(mismatch(self, ty)),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Conversion is decided per target type in to_sql.
        true
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for Value {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, BoxError> {
        match *ty {
            Type::BOOL => return Ok(Value::Bool(bool::from_sql(ty, raw)?)),
            Type::INT2 => return Ok(Value::Int(i16::from_sql(ty, raw)? as i64)),
            Type::INT4 => return Ok(Value::Int(i32::from_sql(ty, raw)? as i64)),
            Type::INT8 => return Ok(Value::Int(i64::from_sql(ty, raw)?)),
            Type::OID => return Ok(Value::Int(u32::from_sql(ty, raw)? as i64)),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
                return Ok(Value::Text(String::from_sql(ty, raw)?))
            }
            Type::BYTEA => return Ok(Value::Blob(Vec::<u8>::from_sql(ty, raw)?)),
            Type::UUID => return Ok(Value::Uuid(Uuid::from_sql(ty, raw)?)),
            Type::NUMERIC => return Ok(Value::Decimal(Numeric::from_sql(ty, raw)?)),
            _ => {}
        }

        match ty.kind() {
            Kind::Domain(base) if ty.name() == UINT256_DOMAIN && *base == Type::NUMERIC => {
                Ok(Value::Uint256(Uint256::from_sql(ty, raw)?))
            }
            Kind::Domain(base) => Value::from_sql(base, raw),
            Kind::Array(member) => {
                let scalar = scalar_for_type(member).ok_or_else(|| -> BoxError {
                    format!("unsupported array element type {}", member).into()
                })?;
                let array = postgres_protocol::types::array_from_sql(raw)?;
                if array.dimensions().count()? > 1 {
                    return Err("multidimensional arrays are not supported".into());
                }
                let mut values = Vec::new();
                let mut iter = array.values();
                while let Some(elem) = iter.next()? {
                    values.push(Value::from_sql_nullable(member, elem)?);
                }
                Ok(Value::Array(scalar, values))
            }
            _ => Err(format!("unsupported postgres type {} ({})", ty, ty.oid()).into()),
        }
    }

    fn from_sql_null(_ty: &Type) -> std::result::Result<Self, BoxError> {
        Ok(Value::Null)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn scalar_for_type(ty: &Type) -> Option<ScalarType> {
    match *ty {
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => Some(ScalarType::Text),
        Type::INT2 | Type::INT4 | Type::INT8 => Some(ScalarType::Int),
        Type::BOOL => Some(ScalarType::Bool),
        Type::BYTEA => Some(ScalarType::Blob),
        Type::UUID => Some(ScalarType::Uuid),
        Type::NUMERIC => Some(ScalarType::Decimal),
        _ if ty.name() == UINT256_DOMAIN => Some(ScalarType::Uint256),
        _ => match ty.kind() {
            Kind::Domain(base) => scalar_for_type(base),
            _ => None,
        },
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Int(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Blob(b) => write!(f, "\\x{}", hex::encode(b)),
            Value::Uuid(u) => write!(f, "{}", u),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Uint256(u) => write!(f, "{}", u),
            Value::Array(_, elems) => {
                f.write_str("{")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", e)?;
                }
                f.write_str("}")
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use base64::Engine;

        match self {
            Value::Null => serializer.serialize_none(),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Blob(b) => {
                serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(b))
            }
            Value::Uuid(u) => serializer.collect_str(u),
            Value::Decimal(d) => serializer.collect_str(d),
            Value::Uint256(u) => serializer.collect_str(u),
            Value::Array(_, elems) => {
                let mut seq = serializer.serialize_seq(Some(elems.len()))?;
                for e in elems {
                    seq.serialize_element(e)?;
                }
                seq.end()
            }
        }
    }
}
