use crate::error::{SsoError, SsoResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed value stored in a [`Dictionary`].
///
/// This is the tagged-sum encoding of session data and method-specific
/// blobs described by the daemon's design notes: a small, closed set of
/// value kinds with a stable binary form, used both for the JSON wire
/// encoding to plugin subprocesses and for the bytes persisted in the
/// Secret DB's method blob table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    String(String),
    Bool(bool),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    StringArray(Vec<String>),
    Dictionary(Dictionary),
}

/// A typed key/value bag, keyed by string, with a stable binary
/// encoding. `BTreeMap` gives us a deterministic iteration order, which
/// in turn gives a deterministic binary encoding without needing to
/// sort at encode time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dictionary(BTreeMap<String, Value>);

const TAG_STRING: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_U32: u8 = 2;
const TAG_I32: u8 = 3;
const TAG_U64: u8 = 4;
const TAG_I64: u8 = 5;
const TAG_STRING_ARRAY: u8 = 6;
const TAG_DICTIONARY: u8 = 7;

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.set(key, Value::String(value.into()));
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, Value::Bool(value));
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.0.get(key) {
            Some(Value::U32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn set_u32(&mut self, key: impl Into<String>, value: u32) {
        self.set(key, Value::U32(value));
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        match self.0.get(key) {
            Some(Value::I32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn set_i32(&mut self, key: impl Into<String>, value: i32) {
        self.set(key, Value::I32(value));
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key) {
            Some(Value::U64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn set_u64(&mut self, key: impl Into<String>, value: u64) {
        self.set(key, Value::U64(value));
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key) {
            Some(Value::I64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn set_i64(&mut self, key: impl Into<String>, value: i64) {
        self.set(key, Value::I64(value));
    }

    pub fn get_string_array(&self, key: &str) -> Option<&[String]> {
        match self.0.get(key) {
            Some(Value::StringArray(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn set_string_array(&mut self, key: impl Into<String>, value: Vec<String>) {
        self.set(key, Value::StringArray(value));
    }

    /// Encode to the stable binary wire form. This is the only
    /// representation persisted for method-specific blobs.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        encode_dictionary(self, &mut out);
        out
    }

    /// Decode a previously-encoded dictionary. Round-trips with
    /// [`Dictionary::encode`] under deep equality.
    pub fn decode(bytes: &[u8]) -> SsoResult<Self> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let dict = decode_dictionary(&mut cursor)?;
        if cursor.pos != cursor.bytes.len() {
            return Err(SsoError::InvalidData(
                "trailing bytes after dictionary".into(),
            ));
        }
        Ok(dict)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> SsoResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(SsoError::InvalidData("truncated dictionary".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> SsoResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> SsoResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_i32(&mut self) -> SsoResult<i32> {
        Ok(self.take_u32()? as i32)
    }

    fn take_u64(&mut self) -> SsoResult<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    fn take_i64(&mut self) -> SsoResult<i64> {
        Ok(self.take_u64()? as i64)
    }

    fn take_string(&mut self) -> SsoResult<String> {
        let len = self.take_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SsoError::InvalidData(format!("invalid utf8 in dictionary string: {e}")))
    }
}

fn encode_string(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::String(s) => {
            out.push(TAG_STRING);
            encode_string(s, out);
        }
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(if *b { 1 } else { 0 });
        }
        Value::U32(v) => {
            out.push(TAG_U32);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::I32(v) => {
            out.push(TAG_I32);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::U64(v) => {
            out.push(TAG_U64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::I64(v) => {
            out.push(TAG_I64);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::StringArray(items) => {
            out.push(TAG_STRING_ARRAY);
            out.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_string(item, out);
            }
        }
        Value::Dictionary(dict) => {
            out.push(TAG_DICTIONARY);
            encode_dictionary(dict, out);
        }
    }
}

fn encode_dictionary(dict: &Dictionary, out: &mut Vec<u8>) {
    out.extend_from_slice(&(dict.0.len() as u32).to_le_bytes());
    for (key, value) in dict.0.iter() {
        encode_string(key, out);
        encode_value(value, out);
    }
}

fn decode_value(cursor: &mut Cursor) -> SsoResult<Value> {
    let tag = cursor.take_u8()?;
    Ok(match tag {
        TAG_STRING => Value::String(cursor.take_string()?),
        TAG_BOOL => Value::Bool(cursor.take_u8()? != 0),
        TAG_U32 => Value::U32(cursor.take_u32()?),
        TAG_I32 => Value::I32(cursor.take_i32()?),
        TAG_U64 => Value::U64(cursor.take_u64()?),
        TAG_I64 => Value::I64(cursor.take_i64()?),
        TAG_STRING_ARRAY => {
            let count = cursor.take_u32()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(cursor.take_string()?);
            }
            Value::StringArray(items)
        }
        TAG_DICTIONARY => Value::Dictionary(decode_dictionary(cursor)?),
        other => return Err(SsoError::InvalidData(format!("unknown value tag {other}"))),
    })
}

fn decode_dictionary(cursor: &mut Cursor) -> SsoResult<Dictionary> {
    let count = cursor.take_u32()? as usize;
    let mut dict = Dictionary::new();
    for _ in 0..count {
        let key = cursor.take_string()?;
        let value = decode_value(cursor)?;
        dict.set(key, value);
    }
    Ok(dict)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_scalars() {
        let mut d = Dictionary::new();
        d.set_string("username", "u");
        d.set_bool("store_secret", true);
        d.set_u32("id", 42);
        d.set_i32("type", -7);
        d.set_u64("big", u64::MAX);
        d.set_i64("neg", i64::MIN);
        d.set_string_array("realms", vec!["a".into(), "b".into()]);

        let encoded = d.encode();
        let decoded = Dictionary::decode(&encoded).unwrap();
        assert_eq!(d, decoded);
    }

    #[test]
    fn round_trip_nested_dictionary() {
        let mut inner = Dictionary::new();
        inner.set_string("nonce", "abc");

        let mut outer = Dictionary::new();
        outer.set("session", Value::Dictionary(inner));
        outer.set_string("method", "digest");

        let encoded = outer.encode();
        let decoded = Dictionary::decode(&encoded).unwrap();
        assert_eq!(outer, decoded);
    }

    #[test]
    fn round_trip_empty() {
        let d = Dictionary::new();
        let encoded = d.encode();
        let decoded = Dictionary::decode(&encoded).unwrap();
        assert_eq!(d, decoded);
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let d = Dictionary::new();
        let mut encoded = d.encode();
        encoded.push(0xff);
        assert!(Dictionary::decode(&encoded).is_err());
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let mut d = Dictionary::new();
        d.set_string("k", "value");
        let encoded = d.encode();
        let truncated = &encoded[..encoded.len() - 2];
        assert!(Dictionary::decode(truncated).is_err());
    }
}
