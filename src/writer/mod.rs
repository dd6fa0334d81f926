//! Output Sinks
//!
//! Sinks consume the merged row stream through the `RowWriter` trait.
//! Capabilities vary: some sinks encode a raw start/end range natively,
//! the rest get the range decomposed into the minimal CIDR cover by the
//! trait's default `write_range`; sinks with buffered output override
//! `flush`. `SplitRowWriter` routes rows to an IPv4 or IPv6 sink by the
//! address family of each row.

pub mod csv;
pub mod mmdb;

use std::net::IpAddr;

use crate::data_section::Value;
use crate::error::{MergeError, Result};
use crate::network::{range_to_cidrs, Network};

pub use self::csv::CsvRowWriter;
pub use self::mmdb::MmdbRowWriter;

/// A sink for merged output rows
///
/// `data` is the column vector in declaration order; a None slot means
/// the column has no value for this network. The slice is only borrowed
/// for the duration of the call.
pub trait RowWriter {
    /// Write a single row for one CIDR
    fn write_row(&mut self, network: Network, data: &[Option<Value>]) -> Result<()>;

    /// Write an inclusive address range carrying one set of column data
    ///
    /// The default decomposes the range into the minimal CIDR cover and
    /// writes one row per CIDR; sinks with a native range representation
    /// override it.
    fn write_range(&mut self, start: IpAddr, end: IpAddr, data: &[Option<Value>]) -> Result<()> {
        for cidr in range_to_cidrs(start, end) {
            self.write_row(cidr, data)?;
        }
        Ok(())
    }

    /// Flush buffered output; a no-op for unbuffered sinks
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<W: RowWriter + ?Sized> RowWriter for Box<W> {
    fn write_row(&mut self, network: Network, data: &[Option<Value>]) -> Result<()> {
        (**self).write_row(network, data)
    }

    fn write_range(&mut self, start: IpAddr, end: IpAddr, data: &[Option<Value>]) -> Result<()> {
        (**self).write_range(start, end, data)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Routes rows to an IPv4 or IPv6 sink based on each row's address family
pub struct SplitRowWriter {
    ipv4: Option<Box<dyn RowWriter>>,
    ipv6: Option<Box<dyn RowWriter>>,
}

impl SplitRowWriter {
    /// Construct a row writer that dispatches rows by IP version
    pub fn new(ipv4: Option<Box<dyn RowWriter>>, ipv6: Option<Box<dyn RowWriter>>) -> Self {
        Self { ipv4, ipv6 }
    }

    fn sink_for(&mut self, is_v4: bool) -> Result<&mut Box<dyn RowWriter>> {
        let sink = if is_v4 { &mut self.ipv4 } else { &mut self.ipv6 };
        sink.as_mut().ok_or_else(|| {
            MergeError::Config(format!(
                "no IPv{} writer configured",
                if is_v4 { 4 } else { 6 }
            ))
        })
    }
}

impl RowWriter for SplitRowWriter {
    fn write_row(&mut self, network: Network, data: &[Option<Value>]) -> Result<()> {
        self.sink_for(network.is_ipv4())?.write_row(network, data)
    }

    fn write_range(&mut self, start: IpAddr, end: IpAddr, data: &[Option<Value>]) -> Result<()> {
        // Start and end are the same family; the accumulator guarantees it.
        self.sink_for(start.is_ipv4())?.write_range(start, end, data)
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(sink) = self.ipv4.as_mut() {
            sink.flush()?;
        }
        if let Some(sink) = self.ipv6.as_mut() {
            sink.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Captures rows for assertions; shared so tests can inspect rows
    /// written through boxed sinks.
    #[derive(Debug, Default)]
    pub struct Capture {
        pub rows: Vec<(Network, Vec<Option<Value>>)>,
        pub ranges: Vec<(IpAddr, IpAddr)>,
        pub flushes: usize,
    }

    /// A sink that records plain rows only
    #[derive(Clone, Debug, Default)]
    pub struct CollectingWriter {
        pub capture: Rc<RefCell<Capture>>,
    }

    impl RowWriter for CollectingWriter {
        fn write_row(&mut self, network: Network, data: &[Option<Value>]) -> Result<()> {
            self.capture
                .borrow_mut()
                .rows
                .push((network, data.to_vec()));
            Ok(())
        }

        fn flush(&mut self) -> Result<()> {
            self.capture.borrow_mut().flushes += 1;
            Ok(())
        }
    }

    /// A sink with a native range representation
    #[derive(Clone, Default)]
    pub struct RangeCollectingWriter {
        pub capture: Rc<RefCell<Capture>>,
    }

    impl RowWriter for RangeCollectingWriter {
        fn write_row(&mut self, network: Network, data: &[Option<Value>]) -> Result<()> {
            self.capture
                .borrow_mut()
                .rows
                .push((network, data.to_vec()));
            Ok(())
        }

        fn write_range(&mut self, start: IpAddr, end: IpAddr, _data: &[Option<Value>]) -> Result<()> {
            self.capture.borrow_mut().ranges.push((start, end));
            Ok(())
        }
    }
}
