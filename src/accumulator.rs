//! Streaming Range Accumulator
//!
//! Coalesces the merged row stream into maximal ranges: while incoming
//! networks stay adjacent and carry identical column data the open range
//! is extended in place; any gap or data change flushes the range to the
//! sink. The accumulator holds at most one range at a time, which is what
//! keeps the whole merge at O(1) memory.

use std::net::IpAddr;

use crate::data_section::Value;
use crate::error::Result;
use crate::network::{is_adjacent, Network};
use crate::writer::RowWriter;

/// A continuous IP range with its column data
#[derive(Debug)]
struct AccumulatedRange {
    start_ip: IpAddr,
    end_ip: IpAddr,
    data: Vec<Option<Value>>,
}

/// Accumulates adjacent networks with identical data, flushing maximal
/// ranges to the sink
#[derive(Debug)]
pub struct Accumulator<W: RowWriter> {
    writer: W,
    include_empty_rows: bool,
    current: Option<AccumulatedRange>,
    /// Recycled data buffer from the last flushed range
    spare: Vec<Option<Value>>,
}

impl<W: RowWriter> Accumulator<W> {
    /// Create a new streaming accumulator
    pub fn new(writer: W, include_empty_rows: bool) -> Self {
        Self {
            writer,
            include_empty_rows,
            current: None,
            spare: Vec::new(),
        }
    }

    /// Feed the next row
    ///
    /// The caller guarantees networks arrive in non-decreasing start
    /// address order and all of one IP version within a run. The data
    /// slice is borrowed only for this call: the accumulator copies it
    /// into its own buffer when opening a range, so the caller is free to
    /// overwrite the slice as soon as this returns.
    pub fn process(&mut self, network: Network, data: &[Option<Value>]) -> Result<()> {
        if !self.include_empty_rows && data.iter().all(Option::is_none) {
            return Ok(());
        }

        let start_ip = network.first_addr();
        let end_ip = network.last_addr();

        match &mut self.current {
            None => {
                self.open(start_ip, end_ip, data);
                Ok(())
            }
            Some(current)
                if is_adjacent(current.end_ip, start_ip) && current.data.as_slice() == data =>
            {
                current.end_ip = end_ip;
                Ok(())
            }
            Some(_) => {
                // Data changed or the stream skipped addresses.
                self.flush()?;
                self.open(start_ip, end_ip, data);
                Ok(())
            }
        }
    }

    /// Write the open range, if any, and return to empty
    ///
    /// Sink errors leave the accumulator empty; the offending range is
    /// not retried.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(range) = self.current.take() {
            let result = self
                .writer
                .write_range(range.start_ip, range.end_ip, &range.data);
            // Recycle the buffer regardless of the write outcome.
            self.spare = range.data;
            self.spare.clear();
            result?;
        }
        Ok(())
    }

    /// Consume the accumulator and return its sink
    pub fn into_writer(self) -> W {
        self.writer
    }

    /// The sink, for tests and final flushing
    pub fn writer_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    fn open(&mut self, start_ip: IpAddr, end_ip: IpAddr, data: &[Option<Value>]) {
        let mut owned = std::mem::take(&mut self.spare);
        owned.clear();
        owned.extend(data.iter().cloned());
        self.current = Some(AccumulatedRange {
            start_ip,
            end_ip,
            data: owned,
        });
    }
}
