//! Tagged value schema for command arguments and results.
//!
//! Each value is a tag byte followed by a tag-specific body built from the
//! [`ByteBuffer`] primitives:
//!
//! | tag | kind   | body                                        |
//! |-----|--------|---------------------------------------------|
//! | 0   | null   | (none)                                      |
//! | 1   | bool   | u8, 0 or 1                                  |
//! | 2   | int    | i32 as u32 LE                               |
//! | 3   | string | u32 LE length + UTF-8                       |
//! | 4   | bytes  | u32 LE length + raw bytes                   |
//! | 5   | array  | u32 LE count, then values                   |
//! | 6   | object | u32 LE count, then (key string, value) pairs |

use std::collections::BTreeMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::byte_buffer::ByteBuffer;
use super::error::{ProtocolError, ProtocolResult};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_BYTES: u8 = 4;
const TAG_ARRAY: u8 = 5;
const TAG_OBJECT: u8 = 6;

/// Maximum array/object nesting accepted by the decoder.
const MAX_DEPTH: usize = 128;

/// A value carried in a request or response payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i32),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Build an object from key/value pairs.
    pub fn object<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Object(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Look up a field of an object. Returns `None` for non-objects.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert any serde-serializable type through its JSON data model.
    ///
    /// Numbers must be integers representable as i32.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Self> {
        Value::try_from(serde_json::to_value(value)?)
    }

    /// Convert into any serde-deserializable type through its JSON data model.
    ///
    /// `Bytes` appear as arrays of numbers.
    pub fn into_deserialize<T: DeserializeOwned>(self) -> ProtocolResult<T> {
        Ok(serde_json::from_value(serde_json::Value::from(self))?)
    }

    /// Append this value's encoding to `bb`.
    pub(crate) fn encode(&self, bb: &mut ByteBuffer) -> ProtocolResult<()> {
        match self {
            Value::Null => bb.write8(TAG_NULL),
            Value::Bool(b) => {
                bb.write8(TAG_BOOL);
                bb.write8(u8::from(*b));
            }
            Value::Int(n) => {
                bb.write8(TAG_INT);
                bb.write32(*n as u32);
            }
            Value::String(s) => {
                bb.write8(TAG_STRING);
                bb.write(s.as_bytes())?;
            }
            Value::Bytes(bytes) => {
                bb.write8(TAG_BYTES);
                bb.write(bytes)?;
            }
            Value::Array(items) => {
                bb.write8(TAG_ARRAY);
                bb.write32(count_u32(items.len())?);
                for item in items {
                    item.encode(bb)?;
                }
            }
            Value::Object(map) => {
                bb.write8(TAG_OBJECT);
                bb.write32(count_u32(map.len())?);
                for (key, item) in map {
                    bb.write(key.as_bytes())?;
                    item.encode(bb)?;
                }
            }
        }
        Ok(())
    }

    /// Decode one value at the cursor of `bb`.
    pub(crate) fn decode(bb: &mut ByteBuffer) -> ProtocolResult<Self> {
        Self::decode_at_depth(bb, 0)
    }

    fn decode_at_depth(bb: &mut ByteBuffer, depth: usize) -> ProtocolResult<Self> {
        if depth > MAX_DEPTH {
            return Err(ProtocolError::TooDeep(MAX_DEPTH));
        }
        match bb.read8()? {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => Ok(Value::Bool(bb.read8()? != 0)),
            TAG_INT => Ok(Value::Int(bb.read32()? as i32)),
            TAG_STRING => read_string(bb).map(Value::String),
            TAG_BYTES => Ok(Value::Bytes(bb.read()?.to_vec())),
            TAG_ARRAY => {
                let count = read_count(bb)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(Self::decode_at_depth(bb, depth + 1)?);
                }
                Ok(Value::Array(items))
            }
            TAG_OBJECT => {
                let count = read_count(bb)?;
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let key = read_string(bb)?;
                    let item = Self::decode_at_depth(bb, depth + 1)?;
                    map.insert(key, item);
                }
                Ok(Value::Object(map))
            }
            tag => Err(ProtocolError::InvalidTag(tag)),
        }
    }
}

/// Read a length-prefixed UTF-8 string.
pub(crate) fn read_string(bb: &mut ByteBuffer) -> ProtocolResult<String> {
    let bytes = bb.read()?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Read an element count, rejecting counts that cannot possibly fit in the
/// remaining bytes (every element takes at least one byte).
fn read_count(bb: &mut ByteBuffer) -> ProtocolResult<usize> {
    let offset = bb.position();
    let count = bb.read32()? as usize;
    if count > bb.remaining() {
        return Err(ProtocolError::BufferUnderrun {
            offset,
            needed: count,
            available: bb.remaining(),
        });
    }
    Ok(count)
}

fn count_u32(len: usize) -> ProtocolResult<u32> {
    u32::try_from(len).map_err(|_| ProtocolError::TooLarge(len))
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = ProtocolError;

    fn try_from(json: serde_json::Value) -> ProtocolResult<Self> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .map(Value::Int)
                .ok_or_else(|| {
                    ProtocolError::Conversion(format!("number {n} is not a 32-bit integer"))
                })?,
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<ProtocolResult<_>>()?,
            ),
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| Value::try_from(v).map(|v| (k, v)))
                    .collect::<ProtocolResult<_>>()?,
            ),
        })
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(n) => serde_json::Value::from(n),
            Value::String(s) => serde_json::Value::String(s),
            Value::Bytes(bytes) => {
                serde_json::Value::Array(bytes.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}
