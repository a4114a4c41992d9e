use std::fmt;

use uuid::Uuid;

use crate::common::{CannonError, Result};

/// Type tag bytes of the on-disk encoding. Adding a variant is a format
/// version bump.
pub const TAG_INT: u8 = 0x01;
pub const TAG_FLOAT: u8 = 0x02;
pub const TAG_TEXT: u8 = 0x03;
pub const TAG_UUID: u8 = 0x04;
pub const TAG_MAP: u8 = 0x05;
pub const TAG_LIST: u8 = 0x06;

/// Maximum nesting depth of composite values. Deeper structures are
/// rejected on both encode and decode.
pub const MAX_NESTING_DEPTH: usize = 32;

/// A typed value storable as either key or value.
///
/// Each variant has a one-byte tag followed by a self-delimiting payload:
///
/// | tag  | payload |
/// |------|---------|
/// | 0x01 | 8-byte signed big-endian integer |
/// | 0x02 | 8-byte IEEE-754 big-endian float |
/// | 0x03 | 4-byte length, UTF-8 bytes |
/// | 0x04 | 16 raw UUID bytes |
/// | 0x05 | 4-byte count, count x (encoded text key, encoded value) |
/// | 0x06 | 4-byte count, count x encoded value |
///
/// Maps preserve insertion order, so two maps with the same pairs in a
/// different order encode differently and are distinct keys.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// 64-bit signed integer
    Int(i64),

    /// 64-bit floating point
    Float(f64),

    /// UTF-8 string
    Text(String),

    /// UUID, 16 raw bytes
    Uuid(Uuid),

    /// Ordered mapping of text keys to values
    Map(Vec<(String, Value)>),

    /// Ordered sequence of values
    List(Vec<Value>),
}

impl Value {
    /// Returns the type tag byte for this value.
    pub fn tag(&self) -> u8 {
        match self {
            Value::Int(_) => TAG_INT,
            Value::Float(_) => TAG_FLOAT,
            Value::Text(_) => TAG_TEXT,
            Value::Uuid(_) => TAG_UUID,
            Value::Map(_) => TAG_MAP,
            Value::List(_) => TAG_LIST,
        }
    }

    /// Encodes the value to its tagged byte form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode_into(&mut out, 0)?;
        Ok(out)
    }

    fn encode_into(&self, out: &mut Vec<u8>, depth: usize) -> Result<()> {
        if depth > MAX_NESTING_DEPTH {
            return Err(CannonError::InvalidEncoding(format!(
                "nesting deeper than {} levels",
                MAX_NESTING_DEPTH
            )));
        }
        out.push(self.tag());
        match self {
            Value::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::Float(v) => out.extend_from_slice(&v.to_be_bytes()),
            Value::Text(s) => {
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Uuid(u) => out.extend_from_slice(u.as_bytes()),
            Value::Map(pairs) => {
                out.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
                for (key, value) in pairs {
                    Value::Text(key.clone()).encode_into(out, depth + 1)?;
                    value.encode_into(out, depth + 1)?;
                }
            }
            Value::List(items) => {
                out.extend_from_slice(&(items.len() as u32).to_be_bytes());
                for item in items {
                    item.encode_into(out, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    /// Decodes a value from bytes, requiring the whole buffer to be consumed.
    pub fn decode(data: &[u8]) -> Result<Value> {
        let (value, consumed) = Self::decode_prefix(data, 0)?;
        if consumed != data.len() {
            return Err(CannonError::InvalidEncoding(format!(
                "{} trailing bytes after value",
                data.len() - consumed
            )));
        }
        Ok(value)
    }

    /// Decodes one value from the front of `data`, returning it together
    /// with the number of bytes consumed.
    fn decode_prefix(data: &[u8], depth: usize) -> Result<(Value, usize)> {
        if depth > MAX_NESTING_DEPTH {
            return Err(CannonError::InvalidEncoding(format!(
                "nesting deeper than {} levels",
                MAX_NESTING_DEPTH
            )));
        }
        let tag = *data
            .first()
            .ok_or_else(|| CannonError::InvalidEncoding("empty buffer".to_string()))?;
        let body = &data[1..];
        match tag {
            TAG_INT => {
                let raw = take(body, 8)?;
                let v = i64::from_be_bytes(raw.try_into().unwrap());
                Ok((Value::Int(v), 9))
            }
            TAG_FLOAT => {
                let raw = take(body, 8)?;
                let v = f64::from_be_bytes(raw.try_into().unwrap());
                Ok((Value::Float(v), 9))
            }
            TAG_TEXT => {
                let len = read_u32(body)? as usize;
                let raw = take(&body[4..], len)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|e| CannonError::InvalidEncoding(format!("invalid UTF-8: {e}")))?;
                Ok((Value::Text(s.to_string()), 1 + 4 + len))
            }
            TAG_UUID => {
                let raw = take(body, 16)?;
                let u = Uuid::from_bytes(raw.try_into().unwrap());
                Ok((Value::Uuid(u), 17))
            }
            TAG_MAP => {
                let count = read_u32(body)? as usize;
                let mut offset = 5;
                let mut pairs = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let (key, used) = Self::decode_prefix(&data[offset..], depth + 1)?;
                    let key = match key {
                        Value::Text(s) => s,
                        other => {
                            return Err(CannonError::InvalidEncoding(format!(
                                "map key must be text, found tag {:#04x}",
                                other.tag()
                            )))
                        }
                    };
                    offset += used;
                    let (value, used) = Self::decode_prefix(&data[offset..], depth + 1)?;
                    offset += used;
                    pairs.push((key, value));
                }
                Ok((Value::Map(pairs), offset))
            }
            TAG_LIST => {
                let count = read_u32(body)? as usize;
                let mut offset = 5;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let (value, used) = Self::decode_prefix(&data[offset..], depth + 1)?;
                    offset += used;
                    items.push(value);
                }
                Ok((Value::List(items), offset))
            }
            other => Err(CannonError::InvalidEncoding(format!(
                "unknown type tag {:#04x}",
                other
            ))),
        }
    }
}

fn take(data: &[u8], len: usize) -> Result<&[u8]> {
    data.get(..len).ok_or_else(|| {
        CannonError::InvalidEncoding(format!(
            "payload truncated: need {} bytes, have {}",
            len,
            data.len()
        ))
    })
}

fn read_u32(data: &[u8]) -> Result<u32> {
    let raw = take(data, 4)?;
    Ok(u32::from_be_bytes(raw.try_into().unwrap()))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Uuid(u) => write!(f, "{}", u),
            Value::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "'{}': {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

// Convenience conversions
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

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}
