//! MMDB Binary Format Parsing
//!
//! Parses the MMDB container with minimal heap allocation: locate the
//! metadata marker, decode the metadata map, and extract the handful of
//! fields traversal needs. Everything else stays in the mapped file and
//! is decoded on demand.

use std::collections::HashMap;

use super::types::{IpVersion, MmdbError, RecordSize, METADATA_MARKER};
use crate::data_section::{DataDecoder, Value};

/// MMDB file header
///
/// Contains only the fields needed to traverse the search tree and find
/// the data section.
#[derive(Debug, Clone, Copy)]
pub struct MmdbHeader {
    /// Number of nodes in the search tree
    pub node_count: u32,
    /// Record size in bits (24, 28, or 32)
    pub record_size: RecordSize,
    /// IP version (4 or 6)
    pub ip_version: IpVersion,
    /// Size of the search tree in bytes
    pub tree_size: usize,
}

impl MmdbHeader {
    /// Parse an MMDB file and extract the traversal header
    pub fn from_file(data: &[u8]) -> Result<Self, MmdbError> {
        let metadata = Metadata::from_file(data)?;
        Ok(MmdbHeader {
            node_count: metadata.node_count,
            record_size: metadata.record_size,
            ip_version: metadata.ip_version,
            tree_size: metadata.node_count as usize * metadata.record_size.node_bytes(),
        })
    }
}

/// Parsed MMDB metadata
///
/// The descriptive fields are optional in the wire format and default to
/// empty when absent.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Number of nodes in the search tree
    pub node_count: u32,
    /// Record size in bits
    pub record_size: RecordSize,
    /// IP version of the search tree
    pub ip_version: IpVersion,
    /// Database type name, e.g. "GeoLite2-City"
    pub database_type: String,
    /// Description per language code
    pub description: HashMap<String, String>,
    /// Locale codes the database carries
    pub languages: Vec<String>,
    /// Unix timestamp of the build
    pub build_epoch: u64,
}

impl Metadata {
    /// Parse the metadata map from an MMDB file
    pub fn from_file(data: &[u8]) -> Result<Self, MmdbError> {
        let marker_offset = find_metadata_marker(data)?;
        let metadata_bytes = &data[marker_offset + METADATA_MARKER.len()..];

        let value = DataDecoder::new(metadata_bytes)
            .decode(0)
            .map_err(|e| MmdbError::InvalidMetadata(format!("failed to decode metadata: {}", e)))?;
        let map = match value {
            Value::Map(map) => map,
            other => {
                return Err(MmdbError::InvalidMetadata(format!(
                    "metadata is not a map, found {}",
                    other.type_name()
                )))
            }
        };

        let node_count = extract_uint(&map, "node_count")? as u32;
        let record_size = RecordSize::from_bits(extract_uint(&map, "record_size")? as u16)?;
        let ip_version = match extract_uint(&map, "ip_version")? {
            4 => IpVersion::V4,
            6 => IpVersion::V6,
            other => {
                return Err(MmdbError::InvalidMetadata(format!(
                    "unsupported ip_version {}",
                    other
                )))
            }
        };

        let database_type = match map.get("database_type") {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        };
        let description = match map.get("description") {
            Some(Value::Map(langs)) => langs
                .iter()
                .filter_map(|(lang, text)| match text {
                    Value::String(s) => Some((lang.clone(), s.clone())),
                    _ => None,
                })
                .collect(),
            _ => HashMap::new(),
        };
        let languages = match map.get("languages") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s.clone()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        let build_epoch = extract_uint(&map, "build_epoch").unwrap_or(0);

        Ok(Metadata {
            node_count,
            record_size,
            ip_version,
            database_type,
            description,
            languages,
            build_epoch,
        })
    }
}

/// Find the metadata marker in an MMDB file
///
/// The marker appears within the last 128KB of the file; when it occurs
/// more than once the last occurrence wins, matching libmaxminddb.
pub fn find_metadata_marker(data: &[u8]) -> Result<usize, MmdbError> {
    const SEARCH_SIZE: usize = 128 * 1024;

    if data.len() < METADATA_MARKER.len() {
        return Err(MmdbError::MetadataNotFound);
    }

    let search_start = data.len().saturating_sub(SEARCH_SIZE);
    let mut last_marker = None;
    for i in search_start..=(data.len() - METADATA_MARKER.len()) {
        if &data[i..i + METADATA_MARKER.len()] == METADATA_MARKER {
            last_marker = Some(i);
        }
    }

    last_marker.ok_or(MmdbError::MetadataNotFound)
}

fn extract_uint(map: &HashMap<String, Value>, key: &str) -> Result<u64, MmdbError> {
    match map.get(key) {
        Some(Value::Uint16(n)) => Ok(*n as u64),
        Some(Value::Uint32(n)) => Ok(*n as u64),
        Some(Value::Uint64(n)) => Ok(*n),
        Some(_) => Err(MmdbError::InvalidMetadata(format!(
            "field '{}' is not an unsigned integer",
            key
        ))),
        None => Err(MmdbError::InvalidMetadata(format!(
            "required field '{}' not found",
            key
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_section::encode_value;

    fn metadata_bytes(ip_version: u16) -> Vec<u8> {
        let mut map = HashMap::new();
        map.insert("node_count".to_string(), Value::Uint32(42));
        map.insert("record_size".to_string(), Value::Uint16(24));
        map.insert("ip_version".to_string(), Value::Uint16(ip_version));
        map.insert(
            "database_type".to_string(),
            Value::String("Test-DB".to_string()),
        );
        map.insert("build_epoch".to_string(), Value::Uint64(1_700_000_000));
        encode_value(&Value::Map(map))
    }

    fn file_with_metadata(ip_version: u16) -> Vec<u8> {
        let mut data = vec![0u8; 64];
        data.extend_from_slice(METADATA_MARKER);
        data.extend_from_slice(&metadata_bytes(ip_version));
        data
    }

    #[test]
    fn test_parse_metadata() {
        let data = file_with_metadata(4);
        let metadata = Metadata::from_file(&data).unwrap();
        assert_eq!(metadata.node_count, 42);
        assert_eq!(metadata.record_size, RecordSize::Bits24);
        assert_eq!(metadata.ip_version, IpVersion::V4);
        assert_eq!(metadata.database_type, "Test-DB");
        assert_eq!(metadata.build_epoch, 1_700_000_000);
    }

    #[test]
    fn test_parse_header() {
        let data = file_with_metadata(6);
        let header = MmdbHeader::from_file(&data).unwrap();
        assert_eq!(header.node_count, 42);
        assert_eq!(header.tree_size, 42 * 6);
        assert_eq!(header.ip_version, IpVersion::V6);
    }

    #[test]
    fn test_unsupported_ip_version() {
        let data = file_with_metadata(5);
        let err = Metadata::from_file(&data).unwrap_err();
        assert!(err.to_string().contains("ip_version"));
    }

    #[test]
    fn test_metadata_not_found() {
        let data = b"not a valid mmdb file";
        let result = find_metadata_marker(data);
        assert!(matches!(result, Err(MmdbError::MetadataNotFound)));
    }

    #[test]
    fn test_last_marker_wins() {
        let mut data = Vec::new();
        data.extend_from_slice(METADATA_MARKER);
        data.extend_from_slice(&[0u8; 32]);
        let second = data.len();
        data.extend_from_slice(METADATA_MARKER);
        data.extend_from_slice(&metadata_bytes(4));
        assert_eq!(find_metadata_marker(&data).unwrap(), second);
    }
}
