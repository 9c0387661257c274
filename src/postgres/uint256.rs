//! Unsigned 256-bit integer stored in postgres as the `uint256` domain over `NUMERIC(78)`.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::error::Error as StdError;
use std::fmt;
use std::str::FromStr;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};

use super::numeric::{is_numeric, NBASE, NUMERIC_NAN, NUMERIC_NEG, NUMERIC_POS};
use crate::{Error, Result};

/// Name of the postgres domain backing [`Uint256`].
pub const UINT256_DOMAIN: &str = "uint256";

/// An unsigned 256-bit integer. Limbs are little-endian 64-bit words.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Uint256([u64; 4]);

impl Uint256 {
    pub const ZERO: Uint256 = Uint256([0; 4]);
    pub const MAX: Uint256 = Uint256([u64::MAX; 4]);

    pub fn from_u64(v: u64) -> Self {
        Uint256([v, 0, 0, 0])
    }

    /// Builds a value from 32 big-endian bytes.
    pub fn from_be_bytes(bytes: [u8; 32]) -> Self {
        let mut limbs = [0u64; 4];
        for (i, chunk) in bytes.chunks_exact(8).enumerate() {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            limbs[3 - i] = u64::from_be_bytes(word);
        }
        Uint256(limbs)
    }

    pub fn from_be_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Codec(format!("uint256 requires 32 bytes, got {}", bytes.len())))?;
        Ok(Self::from_be_bytes(arr))
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        for i in 0..4 {
            out[i * 8..(i + 1) * 8].copy_from_slice(&self.0[3 - i].to_be_bytes());
        }
        out
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    /// `self * m + a`, or `None` on overflow.
    fn mul_add_small(&self, m: u64, a: u64) -> Option<Self> {
        let mut out = [0u64; 4];
        let mut carry = a as u128;
        for (i, limb) in self.0.iter().enumerate() {
            let prod = (*limb as u128) * (m as u128) + carry;
            out[i] = prod as u64;
            carry = prod >> 64;
        }
        if carry != 0 {
            return None;
        }
        Some(Uint256(out))
    }

    /// Returns `(self / d, self % d)`.
    fn div_rem_small(&self, d: u64) -> (Self, u64) {
        let mut out = [0u64; 4];
        let mut rem: u128 = 0;
        for i in (0..4).rev() {
            let cur = (rem << 64) | self.0[i] as u128;
            out[i] = (cur / d as u128) as u64;
            rem = cur % d as u128;
        }
        (Uint256(out), rem as u64)
    }

    /// Base-10000 digits, most significant first. Zero has no digits.
    fn nbase_digits(&self) -> Vec<i16> {
        let mut digits = Vec::new();
        let mut cur = *self;
        while !cur.is_zero() {
            let (q, r) = cur.div_rem_small(NBASE);
            digits.push(r as i16);
            cur = q;
        }
        digits.reverse();
        digits
    }
}

impl FromStr for Uint256 {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::Codec("empty uint256 string".to_string()));
        }
        let mut v = Uint256::ZERO;
        for c in s.bytes() {
            if !c.is_ascii_digit() {
                return Err(Error::Codec(format!("invalid uint256 string {:?}", s)));
            }
            v = v
                .mul_add_small(10, (c - b'0') as u64)
                .ok_or_else(|| Error::Codec(format!("uint256 overflow: {}", s)))?;
        }
        Ok(v)
    }
}

impl fmt::Display for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return f.write_str("0");
        }
        let mut digits = Vec::with_capacity(78);
        let mut cur = *self;
        while !cur.is_zero() {
            let (q, r) = cur.div_rem_small(10);
            digits.push(b'0' + r as u8);
            cur = q;
        }
        digits.reverse();
        f.write_str(&String::from_utf8_lossy(&digits))
    }
}

impl fmt::Debug for Uint256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uint256({})", self)
    }
}

impl Serialize for Uint256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Uint256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl ToSql for Uint256 {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        let digits = self.nbase_digits();
        out.put_i16(digits.len() as i16);
        out.put_i16(digits.len().saturating_sub(1) as i16);
        out.put_u16(NUMERIC_POS);
        out.put_u16(0);
        for d in digits {
            out.put_i16(d);
        }
        Ok(IsNull::No)
    }

    fn accepts(ty: &Type) -> bool {
        is_numeric(ty)
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for Uint256 {
    fn from_sql(_ty: &Type, mut raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        if raw.remaining() < 8 {
            return Err("invalid numeric header".into());
        }
        let ndigits = raw.get_i16();
        let weight = raw.get_i16();
        let sign = raw.get_u16();
        let _dscale = raw.get_u16();
        match sign {
            NUMERIC_POS => {}
            NUMERIC_NEG => return Err("negative value is not a uint256".into()),
            NUMERIC_NAN => return Err("NaN is not a uint256".into()),
            _ => return Err(format!("invalid numeric sign {:#x}", sign).into()),
        }
        if ndigits < 0 || raw.remaining() < ndigits as usize * 2 {
            return Err("invalid numeric digit count".into());
        }

        let mut v = Uint256::ZERO;
        let mut integer_digits = 0i32;
        for i in 0..ndigits as i32 {
            let d = raw.get_i16();
            if !(0..NBASE as i16).contains(&d) {
                return Err(format!("invalid numeric digit {}", d).into());
            }
            if i > weight as i32 {
                if d != 0 {
                    return Err("fractional value is not a uint256".into());
                }
                continue;
            }
            v = v.mul_add_small(NBASE, d as u64).ok_or("uint256 overflow")?;
            integer_digits += 1;
        }
        // Trailing zero digits are omitted from the wire form.
        for _ in integer_digits..=weight as i32 {
            if v.is_zero() {
                break;
            }
            v = v.mul_add_small(NBASE, 0).ok_or("uint256 overflow")?;
        }
        Ok(v)
    }

    fn accepts(ty: &Type) -> bool {
        is_numeric(ty)
    }
}
