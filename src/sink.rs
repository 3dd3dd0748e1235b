use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local};

use crate::aggregator::{Row, Schema};

/// Append-only CSV log. Every write is flushed before it returns.
#[derive(Debug)]
pub struct CsvSink<W: Write> {
    writer: W,
}

/// `<dir>/<prefix>_<YYYYmmdd_HHMMSS>.csv`
pub fn file_path(dir: &Path, prefix: &str, started: DateTime<Local>) -> PathBuf {
    dir.join(format!("{prefix}_{}.csv", started.format("%Y%m%d_%H%M%S")))
}

impl CsvSink<File> {
    pub fn create(path: &Path) -> Result<Self, anyhow::Error> {
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to create log file {}", path.display()))?;

        Ok(CsvSink::new(file))
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_header(&mut self, schema: &Schema) -> io::Result<()> {
        self.write_record(schema.columns())
    }

    pub fn write_row(&mut self, row: &Row) -> io::Result<()> {
        self.write_record(row.to_record().as_slice())
    }

    fn write_record<S: AsRef<str>>(&mut self, fields: &[S]) -> io::Result<()> {
        let line = fields
            .iter()
            .map(|field| escape(field.as_ref()))
            .collect::<Vec<_>>()
            .join(",");
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
