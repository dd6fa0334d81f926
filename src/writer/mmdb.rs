//! MMDB Output Sink
//!
//! Writes the merged row stream into a new MMDB database. Each row's
//! column vector is assembled into one nested record by splicing every
//! column's value at its output path; records are encoded with
//! deduplication and inserted into an in-memory search tree, which is
//! serialised together with the metadata on flush.
//!
//! Two columns may target the same output path only when both values are
//! maps, in which case they deep-merge; any other overlap is a field
//! conflict and aborts the merge.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::Config;
use crate::data_section::{encode_value, DataEncoder, Value};
use crate::error::{MergeError, Result};
use crate::ip_tree_builder::IpTreeBuilder;
use crate::mmdb::{IpVersion, RecordSize, METADATA_MARKER};
use crate::network::{range_to_cidrs, Network};
use crate::path::{Path, PathSegment};
use crate::writer::RowWriter;

/// Networks never carried by public geolocation databases. Rows inside
/// them are skipped unless the output opts in.
const RESERVED_V4: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.88.99.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
];

const RESERVED_V6: &[&str] = &[
    "::/128",
    "::1/128",
    "100::/64",
    "2001:db8::/32",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

/// Placement of one column inside the nested output record
#[derive(Debug)]
struct OutputColumn {
    name: String,
    path: Path,
    col_index: usize,
}

/// Writes merged rows into a new MMDB database
#[derive(Debug)]
pub struct MmdbRowWriter {
    tree: IpTreeBuilder,
    encoder: DataEncoder,
    columns: Vec<OutputColumn>,
    file_path: PathBuf,
    database_type: String,
    description: HashMap<String, String>,
    languages: Vec<String>,
    record_size: RecordSize,
    ip_version: IpVersion,
    /// Reserved networks to skip; empty when the output includes them
    reserved: Vec<Network>,
}

impl MmdbRowWriter {
    /// Create an MMDB writer for the configured output
    ///
    /// `ip_version` must match the networks the merge will emit, which is
    /// the validated common version of the input databases.
    pub fn new(config: &Config, ip_version: IpVersion) -> Result<Self> {
        let mmdb = config.output.mmdb.as_ref().ok_or_else(|| {
            MergeError::Config("mmdb output requires an output.mmdb section".to_string())
        })?;

        let record_size = RecordSize::from_bits(mmdb.record_size.unwrap_or(28))
            .map_err(|e| MergeError::Config(e.to_string()))?;

        let mut columns = Vec::with_capacity(config.columns.len());
        for (col_index, column) in config.columns.iter().enumerate() {
            let path = match &column.output_path {
                Some(segments) => Path::from_config(segments).map_err(|e| {
                    MergeError::Config(format!(
                        "normalizing output path for column '{}': {}",
                        column.name, e
                    ))
                })?,
                None => Path::from_key(&column.name),
            };
            // Nested records are keyed by strings all the way down.
            if path
                .segments()
                .iter()
                .any(|segment| !matches!(segment, PathSegment::Key(_)))
            {
                return Err(MergeError::Config(format!(
                    "output path for column '{}' may only contain string keys",
                    column.name
                )));
            }
            columns.push(OutputColumn {
                name: column.name.clone(),
                path,
                col_index,
            });
        }

        let include_reserved = mmdb.include_reserved_networks.unwrap_or(false);
        let reserved = if include_reserved {
            Vec::new()
        } else {
            let table = match ip_version {
                IpVersion::V4 => RESERVED_V4,
                IpVersion::V6 => RESERVED_V6,
            };
            table
                .iter()
                .map(|s| s.parse().expect("reserved network table entry"))
                .collect()
        };

        Ok(Self {
            tree: IpTreeBuilder::new(ip_version, record_size),
            encoder: DataEncoder::new(),
            columns,
            file_path: config.output.file.clone(),
            database_type: mmdb.database_type.clone(),
            description: mmdb.description.clone(),
            languages: mmdb.languages.clone(),
            record_size,
            ip_version,
            reserved,
        })
    }

    /// Assemble one nested record from a column vector
    fn build_nested(&self, data: &[Option<Value>]) -> Result<HashMap<String, Value>> {
        let mut root = HashMap::new();
        for column in &self.columns {
            let Some(value) = data.get(column.col_index).and_then(Option::as_ref) else {
                continue;
            };
            merge_nested_value(&mut root, column.path.segments(), value).map_err(|e| {
                let detail = match e {
                    MergeError::FieldConflict(msg) => msg,
                    other => other.to_string(),
                };
                MergeError::FieldConflict(format!(
                    "setting column '{}': {}",
                    column.name, detail
                ))
            })?;
        }
        Ok(root)
    }

    fn insert(&mut self, network: Network, offset: u32) -> Result<()> {
        if self.reserved.iter().any(|r| r.contains(&network)) {
            return Ok(());
        }
        self.tree
            .insert(network, offset)
            .map_err(|e| MergeError::Format(format!("inserting {}: {}", network, e)))
    }

    /// Serialise the finished database
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let (tree_bytes, node_count) = self.tree.build()?;

        let mut database =
            Vec::with_capacity(tree_bytes.len() + 16 + self.encoder.size() + 512);
        database.extend_from_slice(&tree_bytes);
        database.extend_from_slice(&[0u8; 16]);
        database.extend_from_slice(self.encoder.as_bytes());

        let mut metadata = HashMap::new();
        metadata.insert(
            "binary_format_major_version".to_string(),
            Value::Uint16(2),
        );
        metadata.insert(
            "binary_format_minor_version".to_string(),
            Value::Uint16(0),
        );
        metadata.insert(
            "build_epoch".to_string(),
            Value::Uint64(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
            ),
        );
        metadata.insert(
            "database_type".to_string(),
            Value::String(self.database_type.clone()),
        );
        let description = self
            .description
            .iter()
            .map(|(lang, text)| (lang.clone(), Value::String(text.clone())))
            .collect();
        metadata.insert("description".to_string(), Value::Map(description));
        metadata.insert(
            "languages".to_string(),
            Value::Array(
                self.languages
                    .iter()
                    .map(|lang| Value::String(lang.clone()))
                    .collect(),
            ),
        );
        metadata.insert(
            "ip_version".to_string(),
            Value::Uint16(self.ip_version.number()),
        );
        metadata.insert("node_count".to_string(), Value::Uint32(node_count));
        metadata.insert(
            "record_size".to_string(),
            Value::Uint16(self.record_size.bits()),
        );

        database.extend_from_slice(METADATA_MARKER);
        database.extend_from_slice(&encode_value(&Value::Map(metadata)));

        Ok(database)
    }
}

impl RowWriter for MmdbRowWriter {
    fn write_row(&mut self, network: Network, data: &[Option<Value>]) -> Result<()> {
        let nested = self.build_nested(data)?;
        let offset = self.encoder.encode(&Value::Map(nested));
        self.insert(network, offset)
    }

    fn write_range(&mut self, start: IpAddr, end: IpAddr, data: &[Option<Value>]) -> Result<()> {
        // Build and encode the record once for the whole range.
        let nested = self.build_nested(data)?;
        let offset = self.encoder.encode(&Value::Map(nested));
        for cidr in range_to_cidrs(start, end) {
            self.insert(cidr, offset)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(&self.file_path, bytes).map_err(|e| {
            MergeError::Io(format!(
                "writing MMDB output '{}': {}",
                self.file_path.display(),
                e
            ))
        })
    }
}

/// Splice `value` at `path` inside `root`
///
/// The empty path deep-merges a map value into the root. Intermediate
/// keys are created as maps; a non-map on the way down, or any overlap
/// that is not map-with-map, is a field conflict. Input values are
/// cloned, never mutated.
fn merge_nested_value(
    root: &mut HashMap<String, Value>,
    path: &[PathSegment],
    value: &Value,
) -> Result<()> {
    if path.is_empty() {
        let src = match value {
            Value::Map(map) => map,
            other => {
                return Err(MergeError::FieldConflict(format!(
                    "cannot merge a {} at the record root; an empty output path needs a map",
                    other.type_name()
                )))
            }
        };
        return deep_merge(root, src);
    }

    let mut current = root;
    for segment in &path[..path.len() - 1] {
        let key = segment_key(segment)?;
        let entry = current
            .entry(key.to_string())
            .or_insert_with(|| Value::Map(HashMap::new()));
        current = match entry {
            Value::Map(map) => map,
            other => {
                return Err(MergeError::FieldConflict(format!(
                    "key '{}' already holds a {} where a map is needed",
                    key,
                    other.type_name()
                )))
            }
        };
    }

    let last = segment_key(&path[path.len() - 1])?;
    match current.entry(last.to_string()) {
        Entry::Vacant(slot) => {
            slot.insert(value.clone());
            Ok(())
        }
        Entry::Occupied(mut entry) => match (entry.get_mut(), value) {
            (Value::Map(dest), Value::Map(src)) => deep_merge(dest, src),
            (existing, incoming) => Err(MergeError::FieldConflict(format!(
                "key '{}' already exists (cannot merge {} with {})",
                last,
                existing.type_name(),
                incoming.type_name()
            ))),
        },
    }
}

/// Merge `src` into `dest`: disjoint keys are kept, map-with-map overlaps
/// recurse, anything else is a field conflict
fn deep_merge(dest: &mut HashMap<String, Value>, src: &HashMap<String, Value>) -> Result<()> {
    for (key, src_value) in src {
        match dest.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(src_value.clone());
            }
            Entry::Occupied(mut entry) => match (entry.get_mut(), src_value) {
                (Value::Map(dest_map), Value::Map(src_map)) => deep_merge(dest_map, src_map)?,
                (existing, incoming) => {
                    return Err(MergeError::FieldConflict(format!(
                        "key '{}' already exists (cannot merge {} with {})",
                        key,
                        existing.type_name(),
                        incoming.type_name()
                    )))
                }
            },
        }
    }
    Ok(())
}

fn segment_key(segment: &PathSegment) -> Result<&str> {
    match segment {
        PathSegment::Key(key) => Ok(key),
        PathSegment::Index(index) => Err(MergeError::Config(format!(
            "non-string key in output path: {}",
            index
        ))),
    }
}
