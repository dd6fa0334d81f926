//! CSV Output Sink
//!
//! One output row per CIDR. Network columns from the configuration's
//! network section render the row's network (CIDR, range endpoints, or
//! their integer forms); data columns render scalars directly, bytes as
//! hex, and nested maps or arrays as JSON.

use std::io;

use crate::config::{Config, NetworkColumn, NetworkColumnKind};
use crate::data_section::{hex_string, Value};
use crate::error::{MergeError, Result};
use crate::network::{addr_to_int, Network};
use crate::writer::RowWriter;

/// Writes merged rows as CSV
pub struct CsvRowWriter<W: io::Write> {
    writer: csv::Writer<W>,
    network_columns: Vec<NetworkColumn>,
    column_count: usize,
}

impl<W: io::Write> CsvRowWriter<W> {
    /// Create a CSV writer and emit the header row
    pub fn new(inner: W, config: &Config) -> Result<Self> {
        let mut writer = csv::Writer::from_writer(inner);

        let mut header: Vec<&str> = Vec::new();
        for network_column in &config.network.columns {
            header.push(&network_column.name);
        }
        for column in &config.columns {
            header.push(&column.name);
        }
        writer.write_record(&header)?;

        Ok(Self {
            writer,
            network_columns: config.network.columns.clone(),
            column_count: config.columns.len(),
        })
    }

    /// Recover the underlying writer, flushing buffered rows
    pub fn into_inner(self) -> Result<W> {
        self.writer
            .into_inner()
            .map_err(|e| MergeError::Io(e.to_string()))
    }

    fn render_network(&self, network: Network, kind: NetworkColumnKind) -> String {
        match kind {
            NetworkColumnKind::Cidr => network.to_string(),
            NetworkColumnKind::StartIp => network.first_addr().to_string(),
            NetworkColumnKind::EndIp => network.last_addr().to_string(),
            NetworkColumnKind::StartInt => addr_to_int(network.first_addr()).to_string(),
            NetworkColumnKind::EndInt => addr_to_int(network.last_addr()).to_string(),
        }
    }
}

/// Render one column value as a CSV field
fn render_value(value: Option<&Value>) -> Result<String> {
    let Some(value) = value else {
        return Ok(String::new());
    };
    Ok(match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Uint16(n) => n.to_string(),
        Value::Uint32(n) => n.to_string(),
        Value::Uint64(n) => n.to_string(),
        Value::Uint128(n) => n.to_string(),
        Value::Int32(n) => n.to_string(),
        Value::Double(d) => d.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bytes(b) => hex_string(b),
        nested @ (Value::Map(_) | Value::Array(_)) => serde_json::to_string(&nested.to_json())
            .map_err(|e| MergeError::Io(format!("rendering nested value: {}", e)))?,
    })
}

impl<W: io::Write> RowWriter for CsvRowWriter<W> {
    fn write_row(&mut self, network: Network, data: &[Option<Value>]) -> Result<()> {
        let mut record = Vec::with_capacity(self.network_columns.len() + self.column_count);
        for network_column in &self.network_columns {
            record.push(self.render_network(network, network_column.kind));
        }
        for slot in data {
            record.push(render_value(slot.as_ref())?);
        }
        self.writer.write_record(&record)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
