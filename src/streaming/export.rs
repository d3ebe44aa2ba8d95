//! Data export functionality

use anyhow::Result;
use std::io::Write;

use crate::db::{LocationRecord, LogRecord};
use super::ExportFormat;

/// Writes record history as a downloadable document
pub struct BatchExporter {
    format: ExportFormat,
}

impl BatchExporter {
    pub fn new(format: ExportFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> ExportFormat {
        self.format
    }

    /// MIME type of the produced document
    pub fn content_type(&self) -> &'static str {
        match self.format {
            ExportFormat::Json => "application/json",
            ExportFormat::Csv => "text/csv",
        }
    }

    /// Suggested attachment name, e.g. `logs.csv`
    pub fn file_name(&self, stem: &str) -> String {
        let ext = match self.format {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        };
        format!("{}.{}", stem, ext)
    }

    /// Export logs, oldest first
    pub fn export_logs<W: Write>(&self, logs: &[LogRecord], writer: &mut W) -> Result<()> {
        match self.format {
            ExportFormat::Json => {
                serde_json::to_writer_pretty(&mut *writer, logs)?;
                writeln!(writer)?;
            }
            ExportFormat::Csv => {
                writeln!(writer, "Timestamp,Device,Level,Message")?;
                for log in logs {
                    writeln!(
                        writer,
                        "{},{},{},{}",
                        csv_field(&log.timestamp),
                        csv_field(&log.device_id),
                        log.level,
                        csv_field(&log.message)
                    )?;
                }
            }
        }

        writer.flush()?;
        Ok(())
    }

    /// Export GPS fixes, oldest first
    pub fn export_locations<W: Write>(
        &self,
        locations: &[LocationRecord],
        writer: &mut W,
    ) -> Result<()> {
        match self.format {
            ExportFormat::Json => {
                serde_json::to_writer_pretty(&mut *writer, locations)?;
                writeln!(writer)?;
            }
            ExportFormat::Csv => {
                writeln!(writer, "Timestamp,Device,Latitude,Longitude")?;
                for fix in locations {
                    writeln!(
                        writer,
                        "{},{},{:.6},{:.6}",
                        csv_field(&fix.timestamp),
                        csv_field(&fix.device_id),
                        fix.latitude,
                        fix.longitude
                    )?;
                }
            }
        }

        writer.flush()?;
        Ok(())
    }
}

/// Quote a field when it contains a delimiter, quote or line break
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
