//! Merge Configuration
//!
//! The configuration drives everything: which databases to open, which
//! column values to extract from their records, and where the merged
//! output goes. Files are JSON and deserialised with serde; the
//! structural checks that do not need open readers happen at load time.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{MergeError, Result};
use crate::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Input databases
    pub databases: Vec<Database>,
    /// Output columns in declaration order
    pub columns: Vec<Column>,
    /// Output destination and format
    pub output: Output,
    /// Network rendering columns, forwarded to sinks
    #[serde(default)]
    pub network: NetworkSection,
}

/// One input database
#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    /// Name columns refer to this database by
    pub name: String,
    /// Filesystem path of the MMDB file
    pub path: PathBuf,
    /// Priority, surfaced to writers but not used by the engine
    #[serde(default)]
    pub priority: i32,
}

/// One output column
#[derive(Debug, Clone, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Name of the database the value comes from
    pub database: String,
    /// Path of the value inside the source record; empty means the whole
    /// record
    #[serde(default)]
    pub path: Vec<serde_json::Value>,
    /// Placement inside the nested output record (MMDB output only);
    /// defaults to the column name at the root
    #[serde(default)]
    pub output_path: Option<Vec<serde_json::Value>>,
}

/// Output destination
#[derive(Debug, Clone, Deserialize)]
pub struct Output {
    /// Output format
    pub format: OutputFormat,
    /// Output file path
    pub file: PathBuf,
    /// Emit rows whose every column is missing (default false)
    #[serde(default)]
    pub include_empty_rows: Option<bool>,
    /// MMDB-specific output settings, required when format is mmdb
    #[serde(default)]
    pub mmdb: Option<MmdbOutput>,
}

/// Supported output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Comma-separated values, one row per CIDR
    Csv,
    /// A new MMDB database
    Mmdb,
}

/// MMDB output settings
#[derive(Debug, Clone, Deserialize)]
pub struct MmdbOutput {
    /// Database type string written to the metadata
    pub database_type: String,
    /// Description per language code
    #[serde(default)]
    pub description: HashMap<String, String>,
    /// Locale codes written to the metadata
    #[serde(default)]
    pub languages: Vec<String>,
    /// Search tree record size in bits: 24, 28, or 32 (default 28)
    #[serde(default)]
    pub record_size: Option<u16>,
    /// Keep rows that fall inside reserved networks (default false)
    #[serde(default)]
    pub include_reserved_networks: Option<bool>,
}

/// Network rendering section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkSection {
    /// Columns describing how each row's network is rendered
    #[serde(default)]
    pub columns: Vec<NetworkColumn>,
}

/// One network rendering column
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkColumn {
    /// Column name in the output
    pub name: String,
    /// What to render for each row's network
    pub kind: NetworkColumnKind,
}

/// Network renderings available to sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkColumnKind {
    /// The CIDR, e.g. "10.0.0.0/24"
    Cidr,
    /// First address of the network
    StartIp,
    /// Last address of the network
    EndIp,
    /// First address as a decimal integer
    StartInt,
    /// Last address as a decimal integer
    EndInt,
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MergeError::Io(format!("reading config file '{}': {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| MergeError::Config(format!("parsing '{}': {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation that needs no open readers
    pub fn validate(&self) -> Result<()> {
        if self.databases.is_empty() {
            return Err(MergeError::Config("no databases configured".to_string()));
        }
        if self.columns.is_empty() {
            return Err(MergeError::Config("no columns configured".to_string()));
        }

        let mut names = std::collections::HashSet::new();
        for db in &self.databases {
            if !names.insert(db.name.as_str()) {
                return Err(MergeError::Config(format!(
                    "duplicate database name '{}'",
                    db.name
                )));
            }
        }

        for column in &self.columns {
            if !names.contains(column.database.as_str()) {
                return Err(MergeError::Config(format!(
                    "database '{}' not found for column '{}'",
                    column.database, column.name
                )));
            }
            Path::from_config(&column.path).map_err(|e| {
                MergeError::Config(format!("normalizing path for column '{}': {}", column.name, e))
            })?;
            if let Some(output_path) = &column.output_path {
                Path::from_config(output_path).map_err(|e| {
                    MergeError::Config(format!(
                        "normalizing output path for column '{}': {}",
                        column.name, e
                    ))
                })?;
            }
        }

        if self.output.format == OutputFormat::Mmdb {
            let mmdb = self.output.mmdb.as_ref().ok_or_else(|| {
                MergeError::Config("mmdb output requires an output.mmdb section".to_string())
            })?;
            if let Some(bits) = mmdb.record_size {
                if !matches!(bits, 24 | 28 | 32) {
                    return Err(MergeError::Config(format!(
                        "record_size must be 24, 28, or 32, got {}",
                        bits
                    )));
                }
            }
        }

        Ok(())
    }

    /// Whether rows with no column data are emitted
    pub fn include_empty_rows(&self) -> bool {
        self.output.include_empty_rows.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_config() -> serde_json::Value {
        json!({
            "databases": [
                {"name": "city", "path": "/tmp/city.mmdb", "priority": 1}
            ],
            "columns": [
                {"name": "iso", "database": "city", "path": ["country", "iso_code"]}
            ],
            "output": {"format": "csv", "file": "/tmp/out.csv"},
            "network": {"columns": [{"name": "network", "kind": "cidr"}]}
        })
    }

    fn parse(value: serde_json::Value) -> Result<Config> {
        let config: Config = serde_json::from_value(value)
            .map_err(|e| MergeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_parse_valid_config() {
        let config = parse(base_config()).unwrap();
        assert_eq!(config.databases.len(), 1);
        assert_eq!(config.columns[0].name, "iso");
        assert_eq!(config.output.format, OutputFormat::Csv);
        assert_eq!(config.network.columns[0].kind, NetworkColumnKind::Cidr);
        assert!(!config.include_empty_rows());
    }

    #[test]
    fn test_unknown_database_rejected() {
        let mut value = base_config();
        value["columns"][0]["database"] = json!("asn");
        let err = parse(value).unwrap_err();
        assert!(err.to_string().contains("asn"));
    }

    #[test]
    fn test_bad_path_segment_rejected() {
        let mut value = base_config();
        value["columns"][0]["path"] = json!([true]);
        assert!(parse(value).is_err());
    }

    #[test]
    fn test_mmdb_requires_section() {
        let mut value = base_config();
        value["output"] = json!({"format": "mmdb", "file": "/tmp/out.mmdb"});
        let err = parse(value).unwrap_err();
        assert!(err.to_string().contains("output.mmdb"));
    }

    #[test]
    fn test_bad_record_size_rejected() {
        let mut value = base_config();
        value["output"] = json!({
            "format": "mmdb",
            "file": "/tmp/out.mmdb",
            "mmdb": {"database_type": "Test", "record_size": 26}
        });
        assert!(parse(value).is_err());
    }

    #[test]
    fn test_unsupported_format_rejected() {
        let mut value = base_config();
        value["output"]["format"] = json!("parquet");
        assert!(parse(value).is_err());
    }

    #[test]
    fn test_duplicate_database_rejected() {
        let mut value = base_config();
        value["databases"] = json!([
            {"name": "city", "path": "/a.mmdb"},
            {"name": "city", "path": "/b.mmdb"}
        ]);
        assert!(parse(value).is_err());
    }
}
