//! MMDB Data Section Encoding and Decoding
//!
//! Implements the MaxMind DB data type specification: the dynamic `Value`
//! tree decoded records are made of, an encoder with whole-record
//! deduplication for building output data sections, and a decoder that
//! resolves wire pointers so callers only ever see self-contained values.
//!
//! # Format
//!
//! Values are encoded as control byte(s) followed by data. The control
//! byte carries the type in its top 3 bits and a size in the low 5 bits;
//! type 0 marks an extended type whose real type id follows in the next
//! byte. Sizes 29..31 spill into 1..3 extension bytes.
//!
//! See: https://maxmind.github.io/MaxMind-DB/

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use rustc_hash::FxHashMap;

use crate::mmdb::MmdbError;

/// Pointer chains longer than this indicate a corrupt or malicious file.
const MAX_DECODE_DEPTH: usize = 512;

/// A decoded MMDB record value
///
/// Interior nodes are maps keyed by strings or arrays; leaves are
/// scalars. Wire pointers are resolved during decode and never appear
/// here. Equality is structural.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// UTF-8 string
    String(String),
    /// IEEE 754 double precision float
    Double(f64),
    /// Raw byte array
    Bytes(Vec<u8>),
    /// Unsigned 16-bit integer
    Uint16(u16),
    /// Unsigned 32-bit integer
    Uint32(u32),
    /// Key-value map (string keys only per MMDB spec)
    Map(HashMap<String, Value>),
    /// Signed 32-bit integer
    Int32(i32),
    /// Unsigned 64-bit integer
    Uint64(u64),
    /// Unsigned 128-bit integer
    Uint128(u128),
    /// Array of values
    Array(Vec<Value>),
    /// Boolean value
    Bool(bool),
    /// IEEE 754 single precision float
    Float(f32),
}

impl Value {
    /// Short type label for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Double(_) => "double",
            Value::Bytes(_) => "bytes",
            Value::Uint16(_) => "uint16",
            Value::Uint32(_) => "uint32",
            Value::Map(_) => "map",
            Value::Int32(_) => "int32",
            Value::Uint64(_) => "uint64",
            Value::Uint128(_) => "uint128",
            Value::Array(_) => "array",
            Value::Bool(_) => "bool",
            Value::Float(_) => "float",
        }
    }

    /// The map contents, if this value is a map
    pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Render as a serde_json value (map keys sorted for stable output)
    ///
    /// Uint128 values outside the u64 range and raw bytes become strings
    /// (bytes as lowercase hex); non-finite floats become null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Double(d) => serde_json::Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Float(f) => serde_json::Number::from_f64(*f as f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Bytes(b) => serde_json::Value::String(hex_string(b)),
            Value::Uint16(n) => serde_json::Value::Number((*n).into()),
            Value::Uint32(n) => serde_json::Value::Number((*n).into()),
            Value::Int32(n) => serde_json::Value::Number((*n).into()),
            Value::Uint64(n) => serde_json::Value::Number((*n).into()),
            Value::Uint128(n) => {
                if let Ok(small) = u64::try_from(*n) {
                    serde_json::Value::Number(small.into())
                } else {
                    serde_json::Value::String(n.to_string())
                }
            }
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(m) => {
                let mut keys: Vec<&String> = m.keys().collect();
                keys.sort();
                let mut obj = serde_json::Map::with_capacity(m.len());
                for key in keys {
                    obj.insert(key.clone(), m[key].to_json());
                }
                serde_json::Value::Object(obj)
            }
        }
    }
}

/// Lowercase hex rendering of a byte slice
pub fn hex_string(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

// Wire type ids per the MMDB spec. Extended types (>= 8) are encoded as
// type 0 plus a follow-up byte holding the id minus 7.
const TYPE_POINTER: u8 = 1;
const TYPE_STRING: u8 = 2;
const TYPE_DOUBLE: u8 = 3;
const TYPE_BYTES: u8 = 4;
const TYPE_UINT16: u8 = 5;
const TYPE_UINT32: u8 = 6;
const TYPE_MAP: u8 = 7;
const TYPE_INT32: u8 = 8;
const TYPE_UINT64: u8 = 9;
const TYPE_UINT128: u8 = 10;
const TYPE_ARRAY: u8 = 11;
const TYPE_BOOL: u8 = 14;
const TYPE_FLOAT: u8 = 15;

/// Data section encoder
///
/// Builds a data section by encoding values and tracking offsets.
/// Identical values get the same offset, which is how MMDB files keep
/// repeated records cheap.
#[derive(Debug)]
pub struct DataEncoder {
    buffer: Vec<u8>,
    /// Map from serialized value to offset (for deduplication)
    dedup_map: HashMap<Vec<u8>, u32>,
}

impl DataEncoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            dedup_map: HashMap::new(),
        }
    }

    /// Encode a value and return its offset in the data section
    ///
    /// If the value was previously encoded, returns the existing offset.
    pub fn encode(&mut self, value: &Value) -> u32 {
        let mut temp = Vec::new();
        encode_to_buffer(value, &mut temp);

        if let Some(&offset) = self.dedup_map.get(&temp) {
            return offset;
        }

        let offset = self.buffer.len() as u32;
        self.buffer.extend_from_slice(&temp);
        self.dedup_map.insert(temp, offset);
        offset
    }

    /// Current encoded size in bytes
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// The encoded data section so far
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the encoder and return the data section
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for DataEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a standalone value (no deduplication), e.g. a metadata map
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut buffer = Vec::new();
    encode_to_buffer(value, &mut buffer);
    buffer
}

fn encode_to_buffer(value: &Value, buffer: &mut Vec<u8>) {
    match value {
        Value::String(s) => {
            encode_control(TYPE_STRING, s.len(), buffer);
            buffer.extend_from_slice(s.as_bytes());
        }
        Value::Double(d) => {
            encode_control(TYPE_DOUBLE, 8, buffer);
            buffer.extend_from_slice(&d.to_be_bytes());
        }
        Value::Bytes(b) => {
            encode_control(TYPE_BYTES, b.len(), buffer);
            buffer.extend_from_slice(b);
        }
        Value::Uint16(n) => encode_uint(TYPE_UINT16, &n.to_be_bytes(), buffer),
        Value::Uint32(n) => encode_uint(TYPE_UINT32, &n.to_be_bytes(), buffer),
        Value::Map(m) => {
            encode_control(TYPE_MAP, m.len(), buffer);
            // Sorted keys keep the encoding deterministic, which the
            // deduplication map depends on.
            let mut pairs: Vec<_> = m.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            for (key, value) in pairs {
                encode_control(TYPE_STRING, key.len(), buffer);
                buffer.extend_from_slice(key.as_bytes());
                encode_to_buffer(value, buffer);
            }
        }
        Value::Int32(n) => {
            // Always 4 bytes so negative values keep their sign bits.
            encode_control(TYPE_INT32, 4, buffer);
            buffer.extend_from_slice(&n.to_be_bytes());
        }
        Value::Uint64(n) => encode_uint(TYPE_UINT64, &n.to_be_bytes(), buffer),
        Value::Uint128(n) => encode_uint(TYPE_UINT128, &n.to_be_bytes(), buffer),
        Value::Array(items) => {
            encode_control(TYPE_ARRAY, items.len(), buffer);
            for item in items {
                encode_to_buffer(item, buffer);
            }
        }
        Value::Bool(b) => encode_control(TYPE_BOOL, usize::from(*b), buffer),
        Value::Float(f) => {
            encode_control(TYPE_FLOAT, 4, buffer);
            buffer.extend_from_slice(&f.to_be_bytes());
        }
    }
}

/// Encode an unsigned integer with its leading zero bytes stripped
fn encode_uint(type_id: u8, be_bytes: &[u8], buffer: &mut Vec<u8>) {
    let start = be_bytes
        .iter()
        .position(|&b| b != 0)
        .unwrap_or(be_bytes.len());
    let payload = &be_bytes[start..];
    encode_control(type_id, payload.len(), buffer);
    buffer.extend_from_slice(payload);
}

/// Write the control byte, extended-type byte, and size extension bytes
fn encode_control(type_id: u8, size: usize, buffer: &mut Vec<u8>) {
    let marker: u8;
    let mut ext = [0u8; 3];
    let ext_len: usize;
    if size < 29 {
        marker = size as u8;
        ext_len = 0;
    } else if size < 285 {
        marker = 29;
        ext[0] = (size - 29) as u8;
        ext_len = 1;
    } else if size < 65_821 {
        marker = 30;
        let adjusted = (size - 285) as u16;
        ext[..2].copy_from_slice(&adjusted.to_be_bytes());
        ext_len = 2;
    } else {
        marker = 31;
        let adjusted = (size - 65_821) as u32;
        ext[..3].copy_from_slice(&adjusted.to_be_bytes()[1..]);
        ext_len = 3;
    }

    if type_id < 8 {
        buffer.push((type_id << 5) | marker);
    } else {
        // Extended type: control byte carries only the size, the real
        // type id minus 7 follows.
        buffer.push(marker);
        buffer.push(type_id - 7);
    }
    buffer.extend_from_slice(&ext[..ext_len]);
}

/// Data section decoder
///
/// Decodes values from an encoded data section. Pointers are followed
/// transparently, with a depth guard against corrupt pointer cycles.
pub struct DataDecoder<'a> {
    buffer: &'a [u8],
}

impl<'a> DataDecoder<'a> {
    /// Create a decoder for a data section
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }

    /// Decode the value at the given data-section offset
    pub fn decode(&self, offset: u32) -> Result<Value, MmdbError> {
        let mut cursor = offset as usize;
        self.decode_at(&mut cursor, 0)
    }

    fn decode_at(&self, cursor: &mut usize, depth: usize) -> Result<Value, MmdbError> {
        if depth > MAX_DECODE_DEPTH {
            return Err(MmdbError::DecodeError(
                "maximum decode depth exceeded".to_string(),
            ));
        }

        let ctrl = self.read_byte(cursor)?;
        let mut type_id = ctrl >> 5;

        if type_id == TYPE_POINTER {
            let target = self.decode_pointer(cursor, ctrl)?;
            let mut pointer_cursor = target as usize;
            return self.decode_at(&mut pointer_cursor, depth + 1);
        }

        if type_id == 0 {
            let ext = self.read_byte(cursor)?;
            type_id = ext
                .checked_add(7)
                .ok_or_else(|| MmdbError::DecodeError("invalid extended type".to_string()))?;
        }

        let size = self.decode_size(cursor, ctrl & 0x1F)?;

        match type_id {
            TYPE_STRING => self.decode_string(cursor, size),
            TYPE_DOUBLE => {
                if size != 8 {
                    return Err(MmdbError::DecodeError(format!(
                        "double must be 8 bytes, found {}",
                        size
                    )));
                }
                let bytes = self.read_slice(cursor, 8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Ok(Value::Double(f64::from_be_bytes(buf)))
            }
            TYPE_BYTES => {
                let bytes = self.read_slice(cursor, size)?;
                Ok(Value::Bytes(bytes.to_vec()))
            }
            TYPE_UINT16 => Ok(Value::Uint16(self.decode_uint(cursor, size, 2)? as u16)),
            TYPE_UINT32 => Ok(Value::Uint32(self.decode_uint(cursor, size, 4)? as u32)),
            TYPE_MAP => self.decode_map(cursor, size, depth),
            TYPE_INT32 => {
                // Stored big-endian in `size` bytes; shorter encodings are
                // zero-extended and therefore non-negative.
                let raw = self.decode_uint(cursor, size, 4)? as u32;
                Ok(Value::Int32(raw as i32))
            }
            TYPE_UINT64 => Ok(Value::Uint64(self.decode_uint(cursor, size, 8)? as u64)),
            TYPE_UINT128 => Ok(Value::Uint128(self.decode_uint(cursor, size, 16)?)),
            TYPE_ARRAY => self.decode_array(cursor, size, depth),
            TYPE_BOOL => match size {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                _ => Err(MmdbError::DecodeError(format!(
                    "boolean size must be 0 or 1, found {}",
                    size
                ))),
            },
            TYPE_FLOAT => {
                if size != 4 {
                    return Err(MmdbError::DecodeError(format!(
                        "float must be 4 bytes, found {}",
                        size
                    )));
                }
                let bytes = self.read_slice(cursor, 4)?;
                let mut buf = [0u8; 4];
                buf.copy_from_slice(bytes);
                Ok(Value::Float(f32::from_be_bytes(buf)))
            }
            other => Err(MmdbError::DecodeError(format!(
                "unknown data type {}",
                other
            ))),
        }
    }

    /// Decode a pointer target offset
    ///
    /// Control bits 3-4 select the pointer width; the low 3 control bits
    /// contribute the top of the value for widths 0-2.
    fn decode_pointer(&self, cursor: &mut usize, ctrl: u8) -> Result<u32, MmdbError> {
        let width = (ctrl >> 3) & 0x3;
        let value_bits = (ctrl & 0x7) as u32;
        let target = match width {
            0 => {
                let b0 = self.read_byte(cursor)? as u32;
                (value_bits << 8) | b0
            }
            1 => {
                let bytes = self.read_slice(cursor, 2)?;
                0x800 + ((value_bits << 16) | ((bytes[0] as u32) << 8) | bytes[1] as u32)
            }
            2 => {
                let bytes = self.read_slice(cursor, 3)?;
                0x80_800
                    + ((value_bits << 24)
                        | ((bytes[0] as u32) << 16)
                        | ((bytes[1] as u32) << 8)
                        | bytes[2] as u32)
            }
            _ => {
                let bytes = self.read_slice(cursor, 4)?;
                let mut buf = [0u8; 4];
                buf.copy_from_slice(bytes);
                u32::from_be_bytes(buf)
            }
        };
        Ok(target)
    }

    fn decode_size(&self, cursor: &mut usize, marker: u8) -> Result<usize, MmdbError> {
        match marker {
            0..=28 => Ok(marker as usize),
            29 => Ok(29 + self.read_byte(cursor)? as usize),
            30 => {
                let bytes = self.read_slice(cursor, 2)?;
                Ok(285 + (((bytes[0] as usize) << 8) | bytes[1] as usize))
            }
            _ => {
                let bytes = self.read_slice(cursor, 3)?;
                Ok(65_821
                    + (((bytes[0] as usize) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize))
            }
        }
    }

    fn decode_string(&self, cursor: &mut usize, size: usize) -> Result<Value, MmdbError> {
        let bytes = self.read_slice(cursor, size)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| MmdbError::DecodeError("invalid UTF-8 in string".to_string()))?;
        Ok(Value::String(s.to_string()))
    }

    fn decode_uint(&self, cursor: &mut usize, size: usize, max_bytes: usize) -> Result<u128, MmdbError> {
        if size > max_bytes {
            return Err(MmdbError::DecodeError(format!(
                "integer of {} bytes exceeds maximum {}",
                size, max_bytes
            )));
        }
        let bytes = self.read_slice(cursor, size)?;
        let mut value = 0u128;
        for &b in bytes {
            value = (value << 8) | b as u128;
        }
        Ok(value)
    }

    fn decode_map(&self, cursor: &mut usize, count: usize, depth: usize) -> Result<Value, MmdbError> {
        let mut map = HashMap::with_capacity(count);
        for _ in 0..count {
            let key = match self.decode_at(cursor, depth + 1)? {
                Value::String(s) => s,
                other => {
                    return Err(MmdbError::DecodeError(format!(
                        "map key must be a string, found {}",
                        other.type_name()
                    )))
                }
            };
            let value = self.decode_at(cursor, depth + 1)?;
            map.insert(key, value);
        }
        Ok(Value::Map(map))
    }

    fn decode_array(&self, cursor: &mut usize, count: usize, depth: usize) -> Result<Value, MmdbError> {
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.decode_at(cursor, depth + 1)?);
        }
        Ok(Value::Array(items))
    }

    fn read_byte(&self, cursor: &mut usize) -> Result<u8, MmdbError> {
        let b = self
            .buffer
            .get(*cursor)
            .copied()
            .ok_or_else(|| MmdbError::DecodeError("data truncated".to_string()))?;
        *cursor += 1;
        Ok(b)
    }

    fn read_slice(&self, cursor: &mut usize, len: usize) -> Result<&'a [u8], MmdbError> {
        let end = cursor
            .checked_add(len)
            .filter(|&end| end <= self.buffer.len())
            .ok_or_else(|| MmdbError::DecodeError("data truncated".to_string()))?;
        let slice = &self.buffer[*cursor..end];
        *cursor = end;
        Ok(slice)
    }
}

/// Reusable per-reader record decoder
///
/// Memoizes decoded records by data-section offset so a record referenced
/// by many networks is decoded at most once per merge. The driver owns one
/// of these per reader; it must not be shared across concurrent merges.
#[derive(Debug)]
pub struct RecordDecoder {
    cache: FxHashMap<u32, Value>,
}

impl RecordDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self {
            cache: FxHashMap::default(),
        }
    }

    /// Decode the record at `offset`, reusing a cached copy when present
    pub fn decode(&mut self, section: &[u8], offset: u32) -> Result<&Value, MmdbError> {
        match self.cache.entry(offset) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(slot) => {
                let value = DataDecoder::new(section).decode(offset)?;
                Ok(slot.insert(value))
            }
        }
    }

    /// A previously decoded record, if any
    pub fn get(&self, offset: u32) -> Option<&Value> {
        self.cache.get(&offset)
    }

    /// Drop all cached records
    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for RecordDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> Value {
        let mut country = HashMap::new();
        country.insert("iso_code".to_string(), Value::String("US".to_string()));
        country.insert("geoname_id".to_string(), Value::Uint32(6_252_001));
        let mut root = HashMap::new();
        root.insert("country".to_string(), Value::Map(country));
        root.insert("latitude".to_string(), Value::Double(37.751));
        root.insert("is_anycast".to_string(), Value::Bool(true));
        root.insert(
            "subdivisions".to_string(),
            Value::Array(vec![Value::String("CA".to_string())]),
        );
        Value::Map(root)
    }

    #[test]
    fn test_encode_decode_record() {
        let record = sample_record();
        let mut encoder = DataEncoder::new();
        let offset = encoder.encode(&record);
        let bytes = encoder.into_bytes();

        let decoded = DataDecoder::new(&bytes).decode(offset).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_encode_deduplicates() {
        let record = sample_record();
        let mut encoder = DataEncoder::new();
        let a = encoder.encode(&record);
        let size_after_first = encoder.size();
        let b = encoder.encode(&record);
        assert_eq!(a, b);
        assert_eq!(encoder.size(), size_after_first);
    }

    #[test]
    fn test_uint_minimal_encoding() {
        let mut encoder = DataEncoder::new();
        let offset = encoder.encode(&Value::Uint32(1));
        let bytes = encoder.into_bytes();
        // Control byte (type 6, size 1) plus one payload byte.
        assert_eq!(&bytes[offset as usize..], &[0xC1, 0x01]);

        let decoded = DataDecoder::new(&bytes).decode(offset).unwrap();
        assert_eq!(decoded, Value::Uint32(1));
    }

    #[test]
    fn test_uint_zero_encodes_empty() {
        let bytes = encode_value(&Value::Uint64(0));
        // Extended type: size 0 control byte, then type id 9 - 7.
        assert_eq!(bytes, vec![0x00, 0x02]);
        let decoded = DataDecoder::new(&bytes).decode(0).unwrap();
        assert_eq!(decoded, Value::Uint64(0));
    }

    #[test]
    fn test_bool_round_trip() {
        for value in [true, false] {
            let bytes = encode_value(&Value::Bool(value));
            let decoded = DataDecoder::new(&bytes).decode(0).unwrap();
            assert_eq!(decoded, Value::Bool(value));
        }
    }

    #[test]
    fn test_negative_int32() {
        let bytes = encode_value(&Value::Int32(-42));
        let decoded = DataDecoder::new(&bytes).decode(0).unwrap();
        assert_eq!(decoded, Value::Int32(-42));
    }

    #[test]
    fn test_long_string_size_extension() {
        let s = "x".repeat(300);
        let bytes = encode_value(&Value::String(s.clone()));
        let decoded = DataDecoder::new(&bytes).decode(0).unwrap();
        assert_eq!(decoded, Value::String(s));
    }

    #[test]
    fn test_pointer_is_followed() {
        // Encode a string, then hand-write an 11-bit pointer to it.
        let mut bytes = encode_value(&Value::String("hi".to_string()));
        let pointer_offset = bytes.len() as u32;
        bytes.push(0x20); // type 1, width 0, value bits 0
        bytes.push(0x00); // target offset 0

        let decoded = DataDecoder::new(&bytes).decode(pointer_offset).unwrap();
        assert_eq!(decoded, Value::String("hi".to_string()));
    }

    #[test]
    fn test_pointer_cycle_is_rejected() {
        // A pointer that targets itself must not loop forever.
        let bytes = vec![0x20, 0x00, 0x00];
        // Offset 0 points at offset 0.
        let err = DataDecoder::new(&bytes).decode(0).unwrap_err();
        assert!(err.to_string().contains("depth"));
    }

    #[test]
    fn test_truncated_data_errors() {
        let mut bytes = encode_value(&Value::String("hello".to_string()));
        bytes.truncate(3);
        assert!(DataDecoder::new(&bytes).decode(0).is_err());
    }

    #[test]
    fn test_record_decoder_caches() {
        let record = sample_record();
        let mut encoder = DataEncoder::new();
        let offset = encoder.encode(&record);
        let bytes = encoder.into_bytes();

        let mut decoder = RecordDecoder::new();
        assert!(decoder.get(offset).is_none());
        let first = decoder.decode(&bytes, offset).unwrap().clone();
        assert_eq!(first, record);
        assert_eq!(decoder.get(offset), Some(&record));

        decoder.clear();
        assert!(decoder.get(offset).is_none());
    }

    #[test]
    fn test_to_json_sorts_keys() {
        let record = sample_record();
        let json = record.to_json();
        let text = serde_json::to_string(&json).unwrap();
        assert!(text.starts_with("{\"country\""));
        assert!(text.contains("\"iso_code\":\"US\""));
    }
}
