//! MMDB File Reader
//!
//! Opens MMDB files with memory mapping for zero-copy access, exposes the
//! parsed metadata, point lookups, and the network iteration the merge
//! driver consumes. `Readers` keeps one open reader per configured
//! database, addressed by name.

use std::fs::File;
use std::net::IpAddr;
use std::path::Path;

use memmap2::Mmap;
use rustc_hash::FxHashMap;

use super::format::{find_metadata_marker, Metadata, MmdbHeader};
use super::tree::{NetworksIter, SearchTree};
use super::types::MmdbError;
use crate::config::Database;
use crate::data_section::{DataDecoder, Value};
use crate::error::{MergeError, Result};
use crate::network::Network;

/// Storage for database data, either owned or memory-mapped
#[derive(Debug)]
enum Storage {
    Owned(Vec<u8>),
    Mmap(Mmap),
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(v) => v.as_slice(),
            Storage::Mmap(m) => &m[..],
        }
    }
}

/// An open MMDB database
#[derive(Debug)]
pub struct Reader {
    storage: Storage,
    header: MmdbHeader,
    metadata: Metadata,
    /// Byte range of the data section within the file
    data_start: usize,
    data_end: usize,
    priority: i32,
}

impl Reader {
    /// Open an MMDB file using memory mapping
    pub fn open(path: &Path, priority: i32) -> std::result::Result<Self, MmdbError> {
        let file = File::open(path)
            .map_err(|e| MmdbError::IoError(format!("failed to open {}: {}", path.display(), e)))?;
        let mmap = unsafe { Mmap::map(&file) }
            .map_err(|e| MmdbError::IoError(format!("failed to mmap {}: {}", path.display(), e)))?;
        Self::from_storage(Storage::Mmap(mmap), priority)
    }

    /// Create a reader from raw bytes (for testing and in-memory use)
    pub fn from_bytes(data: Vec<u8>) -> std::result::Result<Self, MmdbError> {
        Self::from_storage(Storage::Owned(data), 0)
    }

    fn from_storage(storage: Storage, priority: i32) -> std::result::Result<Self, MmdbError> {
        let data = storage.as_slice();
        let metadata = Metadata::from_file(data)?;
        let header = MmdbHeader {
            node_count: metadata.node_count,
            record_size: metadata.record_size,
            ip_version: metadata.ip_version,
            tree_size: metadata.node_count as usize * metadata.record_size.node_bytes(),
        };

        let marker = find_metadata_marker(data)?;
        let data_start = header.tree_size + 16;
        if data_start > marker {
            return Err(MmdbError::InvalidFormat(format!(
                "search tree ({} bytes) overlaps the metadata section",
                header.tree_size
            )));
        }

        Ok(Self {
            storage,
            header,
            metadata,
            data_start,
            data_end: marker,
            priority,
        })
    }

    /// Parsed database metadata
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The configured priority of this database
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// The raw data section, the address space record offsets live in
    pub fn data_section(&self) -> &[u8] {
        &self.storage.as_slice()[self.data_start..self.data_end]
    }

    fn tree(&self) -> SearchTree<'_> {
        SearchTree::new(self.storage.as_slice(), self.header)
    }

    /// Iterate every network in the database in ascending prefix order
    pub fn networks(&self, include_empty: bool) -> std::result::Result<NetworksIter<'_>, MmdbError> {
        self.tree().networks(include_empty)
    }

    /// Iterate the networks within a prefix in ascending prefix order
    pub fn networks_within(
        &self,
        network: Network,
        include_empty: bool,
    ) -> std::result::Result<NetworksIter<'_>, MmdbError> {
        self.tree().networks_within(network, include_empty)
    }

    /// Decode the record at a data-section offset
    pub fn decode_record(&self, offset: u32) -> std::result::Result<Value, MmdbError> {
        DataDecoder::new(self.data_section()).decode(offset)
    }

    /// Look up an IP address and decode its record
    pub fn lookup(&self, ip: IpAddr) -> std::result::Result<Option<(Value, u8)>, MmdbError> {
        match self.tree().lookup(ip)? {
            Some(hit) => {
                let value = self.decode_record(hit.data_offset)?;
                Ok(Some((value, hit.prefix_len)))
            }
            None => Ok(None),
        }
    }
}

/// Open readers for a set of configured databases, addressed by name
pub struct Readers {
    readers: FxHashMap<String, Reader>,
}

impl Readers {
    /// Open every configured database
    pub fn open(databases: &[Database]) -> Result<Self> {
        let mut readers = FxHashMap::default();
        for db in databases {
            let reader = Reader::open(&db.path, db.priority).map_err(|e| {
                MergeError::Io(format!("opening MMDB file '{}': {}", db.path.display(), e))
            })?;
            readers.insert(db.name.clone(), reader);
        }
        Ok(Self { readers })
    }

    /// Build a registry from already-open readers (for testing)
    pub fn from_readers(readers: Vec<(String, Reader)>) -> Self {
        Self {
            readers: readers.into_iter().collect(),
        }
    }

    /// The reader for a database by name
    pub fn get(&self, name: &str) -> Option<&Reader> {
        self.readers.get(name)
    }

    /// Number of open readers
    pub fn len(&self) -> usize {
        self.readers.len()
    }

    /// True when no readers are open
    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }
}
