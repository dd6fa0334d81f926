//! Mmdbmerge - Streaming MaxMind Database Merge Engine
//!
//! Mmdbmerge composes several MMDB (MaxMind DB) files into one output
//! stream whose columns are driven by a user configuration, and exports
//! the result to CSV or a new MMDB database.
//!
//! # How the merge works
//!
//! The engine iterates the first database's prefix tree and narrows each
//! network through every remaining database, always subdividing to the
//! smallest overlapping prefix, so each point of the address space is
//! visited exactly once at the finest granularity any input implies. At
//! each resulting network, every database's record is decoded once and
//! each configured column extracts its value by walking a path inside
//! that record. Adjacent networks carrying identical column data are
//! coalesced into maximal ranges by a single-slot streaming accumulator,
//! which keeps memory use constant regardless of input size.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mmdbmerge::{Config, CsvRowWriter, Merger, Readers, RowWriter};
//!
//! let config = Config::load(std::path::Path::new("merge.json"))?;
//! let readers = Readers::open(&config.databases)?;
//!
//! let file = std::fs::File::create(&config.output.file)?;
//! let writer = CsvRowWriter::new(file, &config)?;
//!
//! let mut merger = Merger::new(&readers, &config, writer)?;
//! merger.merge()?;
//! merger.into_writer().flush()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//! readers (mmdb)          merger                  writer
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────────┐
//! │ networks()   │──▶│ nested         │   │ csv / mmdb /     │
//! │ networks_    │──▶│ iteration +    │──▶│ split sinks      │
//! │   within()   │   │ accumulator    │   │ (RowWriter)      │
//! └──────────────┘   └────────────────┘   └──────────────────┘
//! ```
//!
//! The reading side (`mmdb`) memory-maps each input and exposes lazy,
//! ascending network iteration including networks without data; the
//! writing side reuses the same data-section codec to build the output
//! tree.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accumulator;
pub mod config;
pub mod data_section;
pub mod error;
pub mod ip_tree_builder;
pub mod merger;
pub mod mmdb;
pub mod network;
pub mod path;
pub mod writer;

pub use crate::accumulator::Accumulator;
pub use crate::config::{Config, OutputFormat};
pub use crate::data_section::{DataDecoder, DataEncoder, RecordDecoder, Value};
pub use crate::error::{MergeError, Result};
pub use crate::merger::Merger;
pub use crate::mmdb::{IpVersion, Metadata, MmdbError, Reader, Readers, RecordSize};
pub use crate::network::Network;
pub use crate::path::{walk, Path, PathSegment};
pub use crate::writer::{CsvRowWriter, MmdbRowWriter, RowWriter, SplitRowWriter};
