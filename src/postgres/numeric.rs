//! Arbitrary-precision decimal matching postgres `NUMERIC`, and the binary
//! wire codec shared with [`Uint256`](super::uint256::Uint256).

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::error::Error as StdError;
use std::fmt::{self, Write};
use std::str::FromStr;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};

use crate::{Error, Result};

pub(crate) const NUMERIC_POS: u16 = 0x0000;
pub(crate) const NUMERIC_NEG: u16 = 0x4000;
pub(crate) const NUMERIC_NAN: u16 = 0xC000;
pub(crate) const NBASE: u64 = 10_000;

/// Largest display scale postgres stores.
const MAX_DSCALE: usize = 0x3FFF;

/// True for `NUMERIC` and any domain whose base type is `NUMERIC`.
pub(crate) fn is_numeric(ty: &Type) -> bool {
    *ty == Type::NUMERIC || matches!(ty.kind(), Kind::Domain(base) if *base == Type::NUMERIC)
}

/// A finite decimal number with its scale. `1.50` and `1.5` are distinct
/// values, as postgres keeps the display scale.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Numeric {
    negative: bool,
    /// Integer digits without leading zeros; empty for zero.
    int_digits: String,
    /// Fraction digits; the length is the scale.
    frac_digits: String,
}

impl Numeric {
    fn from_parts(negative: bool, int_digits: &str, frac_digits: String) -> Self {
        let int_digits = int_digits.trim_start_matches('0').to_string();
        let is_zero = int_digits.is_empty() && frac_digits.bytes().all(|b| b == b'0');
        Numeric {
            negative: negative && !is_zero,
            int_digits,
            frac_digits,
        }
    }

    pub fn scale(&self) -> usize {
        self.frac_digits.len()
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    /// Base-10000 digits aligned on the decimal point, with leading and
    /// trailing zero digits removed, and the weight of the first digit.
    fn nbase_digits(&self) -> (Vec<i16>, i32) {
        let int_pad = (4 - self.int_digits.len() % 4) % 4;
        let frac_pad = (4 - self.frac_digits.len() % 4) % 4;
        let mut padded = "0".repeat(int_pad);
        padded.push_str(&self.int_digits);
        let int_groups = padded.len() / 4;
        padded.push_str(&self.frac_digits);
        padded.push_str(&"0".repeat(frac_pad));

        let mut digits: Vec<i16> = padded
            .as_bytes()
            .chunks(4)
            .map(|chunk| chunk.iter().fold(0i16, |acc, b| acc * 10 + (b - b'0') as i16))
            .collect();
        let mut weight = int_groups as i32 - 1;

        let leading = digits.iter().take_while(|&&d| d == 0).count();
        digits.drain(..leading);
        weight -= leading as i32;
        while digits.last() == Some(&0) {
            digits.pop();
        }
        if digits.is_empty() {
            weight = 0;
        }
        (digits, weight)
    }
}

impl From<i64> for Numeric {
    fn from(v: i64) -> Self {
        Numeric::from_parts(v < 0, &v.unsigned_abs().to_string(), String::new())
    }
}

impl FromStr for Numeric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (negative, body) = match s.as_bytes().first() {
            Some(b'-') => (true, &s[1..]),
            Some(b'+') => (false, &s[1..]),
            _ => (false, s),
        };
        let (int, frac) = body.split_once('.').unwrap_or((body, ""));
        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if (int.is_empty() && frac.is_empty()) || !all_digits(int) || !all_digits(frac) {
            return Err(Error::Codec(format!("invalid decimal {:?}", s)));
        }
        if frac.len() > MAX_DSCALE {
            return Err(Error::Codec(format!("decimal scale {} exceeds {}", frac.len(), MAX_DSCALE)));
        }
        Ok(Numeric::from_parts(negative, int, frac.to_string()))
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            f.write_char('-')?;
        }
        if self.int_digits.is_empty() {
            f.write_char('0')?;
        } else {
            f.write_str(&self.int_digits)?;
        }
        if !self.frac_digits.is_empty() {
            write!(f, ".{}", self.frac_digits)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Numeric({})", self)
    }
}

impl Serialize for Numeric {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Numeric {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl ToSql for Numeric {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        let (digits, weight) = self.nbase_digits();
        out.put_i16(i16::try_from(digits.len())?);
        out.put_i16(i16::try_from(weight)?);
        out.put_u16(if self.negative { NUMERIC_NEG } else { NUMERIC_POS });
        out.put_u16(u16::try_from(self.scale())?);
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

impl<'a> FromSql<'a> for Numeric {
    fn from_sql(_ty: &Type, mut raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        if raw.remaining() < 8 {
            return Err("invalid numeric header".into());
        }
        let ndigits = raw.get_i16();
        let weight = raw.get_i16() as i32;
        let sign = raw.get_u16();
        let dscale = raw.get_u16() as usize;
        let negative = match sign {
            NUMERIC_POS => false,
            NUMERIC_NEG => true,
            NUMERIC_NAN => return Err("NaN is not a supported decimal".into()),
            _ => return Err(format!("unsupported numeric sign {:#x}", sign).into()),
        };
        if ndigits < 0 || raw.remaining() < ndigits as usize * 2 {
            return Err("invalid numeric digit count".into());
        }
        let mut digits = Vec::with_capacity(ndigits as usize);
        for _ in 0..ndigits {
            let d = raw.get_i16();
            if !(0..NBASE as i16).contains(&d) {
                return Err(format!("invalid numeric digit {}", d).into());
            }
            digits.push(d);
        }

        // Digit i has weight `weight - i`; absent positions are zero.
        let digit_at = |pos: i32| -> i16 {
            usize::try_from(weight - pos)
                .ok()
                .and_then(|i| digits.get(i).copied())
                .unwrap_or(0)
        };
        let mut int_digits = String::new();
        for pos in (0..=weight).rev() {
            write!(int_digits, "{:04}", digit_at(pos))?;
        }
        let mut frac_digits = String::with_capacity(dscale + 3);
        for pos in 1..=((dscale + 3) / 4) as i32 {
            write!(frac_digits, "{:04}", digit_at(-pos))?;
        }
        frac_digits.truncate(dscale);
        Ok(Numeric::from_parts(negative, &int_digits, frac_digits))
    }

    fn accepts(ty: &Type) -> bool {
        is_numeric(ty)
    }
}
