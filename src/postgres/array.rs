//! Postgres array text literals and the length-prefixed element framing used
//! for arrays in changesets.

use bytes::{Buf, BufMut};

use crate::{Error, Result};

/// Width of the per-element length prefix in a serialized array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthWidth {
    U8,
    U16,
    U32,
}

impl LengthWidth {
    fn max(self) -> usize {
        match self {
            LengthWidth::U8 => u8::MAX as usize,
            LengthWidth::U16 => u16::MAX as usize,
            LengthWidth::U32 => u32::MAX as usize,
        }
    }

    fn size(self) -> usize {
        match self {
            LengthWidth::U8 => 1,
            LengthWidth::U16 => 2,
            LengthWidth::U32 => 4,
        }
    }
}

/// Splits a one-dimensional postgres array literal such as `{1,2,NULL}` or
/// `{"a,b","c\"d"}` into its elements. Unquoted `NULL` yields `None`.
pub fn parse_array_literal(literal: &str) -> Result<Vec<Option<String>>> {
    let inner = literal
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .ok_or_else(|| Error::Codec(format!("invalid array literal: {}", literal)))?;

    let mut elements = Vec::new();
    if inner.trim().is_empty() {
        return Ok(elements);
    }

    let mut chars = inner.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_ascii_whitespace()).is_some() {}

        let mut elem = String::new();
        let mut quoted = false;
        match chars.peek() {
            Some('"') => {
                chars.next();
                quoted = true;
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(c) => elem.push(c),
                            None => return Err(unterminated(literal)),
                        },
                        Some('"') => break,
                        Some(c) => elem.push(c),
                        None => return Err(unterminated(literal)),
                    }
                }
                while chars.next_if(|c| c.is_ascii_whitespace()).is_some() {}
            }
            Some('{') => {
                return Err(Error::Codec(format!(
                    "multidimensional arrays are not supported: {}",
                    literal
                )))
            }
            _ => {
                while let Some(c) = chars.next_if(|c| *c != ',') {
                    if c == '\\' {
                        match chars.next() {
                            Some(e) => elem.push(e),
                            None => return Err(unterminated(literal)),
                        }
                    } else {
                        elem.push(c);
                    }
                }
                let trimmed = elem.trim_end().len();
                elem.truncate(trimmed);
            }
        }

        if !quoted && elem.eq_ignore_ascii_case("NULL") {
            elements.push(None);
        } else {
            elements.push(Some(elem));
        }

        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(c) => {
                return Err(Error::Codec(format!(
                    "unexpected character {:?} in array literal: {}",
                    c, literal
                )))
            }
        }
    }

    Ok(elements)
}

fn unterminated(literal: &str) -> Error {
    Error::Codec(format!("unterminated array literal: {}", literal))
}

/// Serializes already-encoded elements, each prefixed by its length.
pub fn frame_elements<I>(elements: I, width: LengthWidth) -> Result<Vec<u8>>
where
    I: IntoIterator<Item = Vec<u8>>,
{
    let mut buf = Vec::new();
    for elem in elements {
        if elem.len() > width.max() {
            return Err(Error::Codec(format!(
                "array element of {} bytes exceeds the {}-byte length prefix",
                elem.len(),
                width.size()
            )));
        }
        match width {
            LengthWidth::U8 => buf.put_u8(elem.len() as u8),
            LengthWidth::U16 => buf.put_u16(elem.len() as u16),
            LengthWidth::U32 => buf.put_u32(elem.len() as u32),
        }
        buf.extend_from_slice(&elem);
    }
    Ok(buf)
}

/// Inverse of [`frame_elements`].
pub fn unframe_elements(mut data: &[u8], width: LengthWidth) -> Result<Vec<&[u8]>> {
    let mut out = Vec::new();
    while data.has_remaining() {
        if data.remaining() < width.size() {
            return Err(Error::Codec("truncated array element length".to_string()));
        }
        let len = match width {
            LengthWidth::U8 => data.get_u8() as usize,
            LengthWidth::U16 => data.get_u16() as usize,
            LengthWidth::U32 => data.get_u32() as usize,
        };
        if data.remaining() < len {
            return Err(Error::Codec("truncated array element".to_string()));
        }
        out.push(&data[..len]);
        data.advance(len);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(v: &[&str]) -> Vec<Option<String>> {
        v.iter().map(|s| Some(s.to_string())).collect()
    }

    #[test]
    fn test_parse_simple() {
        assert_eq!(parse_array_literal("{1,2,3}").unwrap(), some(&["1", "2", "3"]));
        assert_eq!(parse_array_literal("{}").unwrap(), Vec::<Option<String>>::new());
        assert_eq!(parse_array_literal("{t,f}").unwrap(), some(&["t", "f"]));
    }

    #[test]
    fn test_parse_quoted_and_escaped() {
        let parsed = parse_array_literal(r#"{"a,b","c\"d","e\\f",plain,""}"#).unwrap();
        assert_eq!(parsed, some(&["a,b", "c\"d", "e\\f", "plain", ""]));

        let blobs = parse_array_literal(r#"{"\\x0102","\\xff"}"#).unwrap();
        assert_eq!(blobs, some(&["\\x0102", "\\xff"]));
    }

    #[test]
    fn test_parse_null_elements() {
        let parsed = parse_array_literal(r#"{1,NULL,"NULL"}"#).unwrap();
        assert_eq!(parsed, vec![Some("1".to_string()), None, Some("NULL".to_string())]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_array_literal("1,2").is_err());
        assert!(parse_array_literal("{\"open}").is_err());
        assert!(parse_array_literal("{{1,2},{3,4}}").is_err());
        assert!(parse_array_literal("{\"a\"b}").is_err());
    }

    #[test]
    fn test_framing_widths() {
        let elems = vec![vec![1u8, 2], vec![], vec![3]];
        for width in [LengthWidth::U8, LengthWidth::U16, LengthWidth::U32] {
            let framed = frame_elements(elems.clone(), width).unwrap();
            assert_eq!(framed.len(), 3 + 3 * width.size());
            let back = unframe_elements(&framed, width).unwrap();
            assert_eq!(back, vec![&[1u8, 2][..], &[][..], &[3][..]]);
        }
    }

    #[test]
    fn test_framing_overflow_and_truncation() {
        let big = vec![0u8; 256];
        assert!(frame_elements(vec![big.clone()], LengthWidth::U8).is_err());
        assert!(frame_elements(vec![big], LengthWidth::U16).is_ok());

        assert!(unframe_elements(&[5, 1, 2], LengthWidth::U8).is_err());
        assert!(unframe_elements(&[0], LengthWidth::U16).is_err());
    }
}
