//! Streaming Merge Driver
//!
//! Composes N databases by nested network iteration: the first reader's
//! networks drive the outer loop, and each deeper reader is restricted to
//! the effective prefix collected so far, always narrowing to the
//! smallest overlapping network. At the base case each database's record
//! is decoded once, every column extracts its value by walking the cached
//! record, and the finished row goes to the accumulator.
//!
//! Working state is one column vector, one decoder per reader, and the
//! accumulator's single open range, so memory stays bounded regardless of
//! database size.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::accumulator::Accumulator;
use crate::config::Config;
use crate::data_section::{RecordDecoder, Value};
use crate::error::{MergeError, Result};
use crate::mmdb::{IpVersion, NetResult, Reader, Readers};
use crate::network::{smallest_network, Network};
use crate::path::{walk, Path};
use crate::writer::RowWriter;

/// Cached per-column extraction state
///
/// Built once at construction so per-row extraction does no lookups or
/// allocation.
#[derive(Debug)]
struct ColumnExtractor {
    /// Normalised source path
    path: Path,
    /// Column name for error messages
    name: String,
    /// Database name for error messages
    database: String,
    /// Index of this column's database in the ordered reader list
    db_index: usize,
    /// Index of this column in the configured column order
    col_index: usize,
}

/// Merges multiple MMDB databases into a single output stream
#[derive(Debug)]
pub struct Merger<'a, W: RowWriter> {
    /// Readers in first-use order over the column list
    readers_list: Vec<&'a Reader>,
    /// Database names matching `readers_list`
    db_names: Vec<String>,
    extractors: Vec<ColumnExtractor>,
    /// One scratch decoder per reader
    decoders: Vec<RecordDecoder>,
    /// Reusable column vector, cleared between rows
    working: Vec<Option<Value>>,
    acc: Accumulator<W>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a, W: RowWriter> Merger<'a, W> {
    /// Create a new merger
    ///
    /// Fails when a column references an unknown database, a path does
    /// not normalise, or the configured databases mix IP versions. The
    /// readers must outlive the merger.
    pub fn new(readers: &'a Readers, config: &Config, writer: W) -> Result<Self> {
        // Unique database names in first-use order over the column list.
        // This fixes the reader order and every column's db_index.
        let mut db_names: Vec<String> = Vec::new();
        let mut db_indices: FxHashMap<String, usize> = FxHashMap::default();
        for column in &config.columns {
            if !db_indices.contains_key(&column.database) {
                db_indices.insert(column.database.clone(), db_names.len());
                db_names.push(column.database.clone());
            }
        }
        if db_names.is_empty() {
            return Err(MergeError::Config("no databases configured".to_string()));
        }

        let mut readers_list = Vec::with_capacity(db_names.len());
        for name in &db_names {
            let reader = readers
                .get(name)
                .ok_or_else(|| MergeError::Config(format!("database '{}' not found", name)))?;
            readers_list.push(reader);
        }

        validate_ip_versions(&readers_list, &db_names)?;

        let mut extractors = Vec::with_capacity(config.columns.len());
        for (col_index, column) in config.columns.iter().enumerate() {
            let db_index = *db_indices.get(&column.database).ok_or_else(|| {
                MergeError::Config(format!(
                    "database '{}' not found for column '{}'",
                    column.database, column.name
                ))
            })?;

            let path = Path::from_config(&column.path).map_err(|e| {
                MergeError::Config(format!(
                    "normalizing path for column '{}': {}",
                    column.name, e
                ))
            })?;

            extractors.push(ColumnExtractor {
                path,
                name: column.name.clone(),
                database: column.database.clone(),
                db_index,
                col_index,
            });
        }

        let decoders = readers_list.iter().map(|_| RecordDecoder::new()).collect();

        Ok(Self {
            readers_list,
            db_names,
            extractors,
            decoders,
            working: vec![None; config.columns.len()],
            acc: Accumulator::new(writer, config.include_empty_rows()),
            cancel: None,
        })
    }

    /// Install a cancellation flag, checked between iteration steps
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Perform the streaming merge of all databases
    ///
    /// Iterates the first database's networks, narrows each through the
    /// remaining databases, and streams the resulting rows through the
    /// accumulator. Any error aborts the merge; in-flight accumulator
    /// state is discarded.
    pub fn merge(&mut self) -> Result<()> {
        let first = self.readers_list[0];
        let networks = first
            .networks(true)
            .map_err(|e| MergeError::Format(format!("iterating first database: {}", e)))?;

        let mut results: Vec<NetResult> = Vec::with_capacity(self.readers_list.len());

        for item in networks {
            if self.cancelled() {
                return Err(MergeError::Cancelled);
            }
            let result = item
                .map_err(|e| MergeError::Format(format!("iterating first database: {}", e)))?;

            results.clear();
            results.push(result);

            if self.readers_list.len() == 1 {
                self.extract_and_process(&results, result.network)?;
            } else {
                self.process_network(&mut results, result.network, 1)?;
            }
        }

        self.acc.flush()
    }

    /// Consume the merger and return the sink for final flushing
    pub fn into_writer(self) -> W {
        self.acc.into_writer()
    }

    /// Recursively narrow a network through the remaining databases
    ///
    /// Invariants: results[i] corresponds to readers_list[i] for
    /// i < db_index, and `effective` is the smallest network seen so far.
    /// Iterating with networks-without-data included guarantees at least
    /// one result per database, so every depth is visited.
    fn process_network(
        &mut self,
        results: &mut Vec<NetResult>,
        effective: Network,
        db_index: usize,
    ) -> Result<()> {
        if db_index >= self.readers_list.len() {
            return self.extract_and_process(results, effective);
        }
        if self.cancelled() {
            return Err(MergeError::Cancelled);
        }

        let reader = self.readers_list[db_index];
        let networks = reader.networks_within(effective, true).map_err(|e| {
            MergeError::Format(format!("iterating database within {}: {}", effective, e))
        })?;

        for item in networks {
            let result = item.map_err(|e| {
                MergeError::Format(format!("iterating database within {}: {}", effective, e))
            })?;

            // The result's network may be broader than `effective` when
            // the stored record spans more than the request; the smallest
            // of the two is always the new effective prefix.
            let smallest = smallest_network(effective, result.network);

            results.push(result);
            let outcome = self.process_network(results, smallest, db_index + 1);
            results.pop();
            outcome?;
        }

        Ok(())
    }

    /// Decode once per database, extract once per column, emit the row
    fn extract_and_process(&mut self, results: &[NetResult], effective: Network) -> Result<()> {
        // Decode each database's record once; columns walk the cached
        // copies. Results without data leave their slot missing.
        for (i, result) in results.iter().enumerate() {
            if let Some(offset) = result.data_offset {
                let section = self.readers_list[i].data_section();
                self.decoders[i].decode(section, offset).map_err(|e| {
                    MergeError::Format(format!(
                        "decoding record in database '{}' at {}: {}",
                        self.db_names[i], effective, e
                    ))
                })?;
            }
        }

        for slot in self.working.iter_mut() {
            *slot = None;
        }

        let decoders = &self.decoders;
        let working = &mut self.working;
        for extractor in &self.extractors {
            let Some(offset) = results[extractor.db_index].data_offset else {
                continue;
            };
            let Some(record) = decoders[extractor.db_index].get(offset) else {
                continue;
            };

            let value = walk(record, &extractor.path).map_err(|e| {
                let detail = match e {
                    MergeError::Path(msg) => msg,
                    other => other.to_string(),
                };
                MergeError::Path(format!(
                    "column '{}' (database '{}') at {}: {}",
                    extractor.name, extractor.database, effective, detail
                ))
            })?;

            if let Some(value) = value {
                working[extractor.col_index] = Some(value.clone());
            }
        }

        self.acc.process(effective, &self.working)
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// Reject configurations mixing IPv4-only and IPv6-capable databases
///
/// IPv6-capable databases may still answer IPv4 questions through the
/// IPv4-mapped form, but composing the two tree shapes in one iteration
/// would conflate incompatible address spaces.
fn validate_ip_versions(readers: &[&Reader], names: &[String]) -> Result<()> {
    let mut ipv4_only = Vec::new();
    let mut ipv6_capable = Vec::new();

    for (reader, name) in readers.iter().zip(names) {
        match reader.metadata().ip_version {
            IpVersion::V4 => ipv4_only.push(name.as_str()),
            IpVersion::V6 => ipv6_capable.push(name.as_str()),
        }
    }

    if !ipv4_only.is_empty() && !ipv6_capable.is_empty() {
        return Err(MergeError::Config(format!(
            "configured databases mix IPv4-only ({}) and IPv6-capable ({}) files; \
             run separate conversions per IP version or supply homogeneous databases",
            ipv4_only.join(", "),
            ipv6_capable.join(", ")
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Column, Database, Output, OutputFormat};
    use crate::data_section::encode_value;
    use crate::mmdb::METADATA_MARKER;
    use crate::writer::testing::CollectingWriter;
    use serde_json::json;
    use std::collections::HashMap;
    use std::path::PathBuf;

    /// Minimal MMDB image: one all-empty node plus metadata
    fn empty_db(ip_version: u16) -> Reader {
        let mut bytes = vec![0, 0, 1, 0, 0, 1];
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.extend_from_slice(METADATA_MARKER);

        let mut metadata = HashMap::new();
        metadata.insert("node_count".to_string(), Value::Uint32(1));
        metadata.insert("record_size".to_string(), Value::Uint16(24));
        metadata.insert("ip_version".to_string(), Value::Uint16(ip_version));
        bytes.extend_from_slice(&encode_value(&Value::Map(metadata)));

        Reader::from_bytes(bytes).unwrap()
    }

    fn config(columns: Vec<Column>) -> Config {
        Config {
            databases: vec![
                Database {
                    name: "a".to_string(),
                    path: PathBuf::from("/a.mmdb"),
                    priority: 0,
                },
                Database {
                    name: "b".to_string(),
                    path: PathBuf::from("/b.mmdb"),
                    priority: 0,
                },
            ],
            columns,
            output: Output {
                format: OutputFormat::Csv,
                file: PathBuf::from("/out.csv"),
                include_empty_rows: None,
                mmdb: None,
            },
            network: Default::default(),
        }
    }

    fn column(name: &str, database: &str) -> Column {
        Column {
            name: name.to_string(),
            database: database.to_string(),
            path: vec![],
            output_path: None,
        }
    }

    #[test]
    fn test_mixed_ip_versions_rejected() {
        let readers = Readers::from_readers(vec![
            ("a".to_string(), empty_db(4)),
            ("b".to_string(), empty_db(6)),
        ]);
        let cfg = config(vec![column("c1", "a"), column("c2", "b")]);
        let err = Merger::new(&readers, &cfg, CollectingWriter::default()).unwrap_err();
        assert!(err.to_string().contains("mix IPv4-only"));
        assert!(err.to_string().contains("a"));
        assert!(err.to_string().contains("b"));
    }

    #[test]
    fn test_unknown_database_rejected() {
        let readers = Readers::from_readers(vec![("a".to_string(), empty_db(4))]);
        let cfg = config(vec![column("c1", "missing")]);
        let err = Merger::new(&readers, &cfg, CollectingWriter::default()).unwrap_err();
        assert!(err.to_string().contains("'missing' not found"));
    }

    #[test]
    fn test_bad_path_rejected_at_construction() {
        let readers = Readers::from_readers(vec![("a".to_string(), empty_db(4))]);
        let mut bad = column("c1", "a");
        bad.path = vec![json!(true)];
        let cfg = config(vec![bad]);
        let err = Merger::new(&readers, &cfg, CollectingWriter::default()).unwrap_err();
        assert!(err.to_string().contains("normalizing path for column 'c1'"));
    }

    #[test]
    fn test_empty_database_produces_no_rows() {
        let readers = Readers::from_readers(vec![("a".to_string(), empty_db(4))]);
        let cfg = config(vec![column("c1", "a")]);
        let writer = CollectingWriter::default();
        let capture = writer.capture.clone();
        let mut merger = Merger::new(&readers, &cfg, writer).unwrap();
        merger.merge().unwrap();
        assert!(capture.borrow().rows.is_empty());
    }

    #[test]
    fn test_cancellation_stops_merge() {
        let readers = Readers::from_readers(vec![("a".to_string(), empty_db(4))]);
        let cfg = config(vec![column("c1", "a")]);
        let flag = Arc::new(AtomicBool::new(true));
        let mut merger = Merger::new(&readers, &cfg, CollectingWriter::default())
            .unwrap()
            .with_cancel(flag);
        assert_eq!(merger.merge().unwrap_err(), MergeError::Cancelled);
    }
}
