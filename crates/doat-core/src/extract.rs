//! Column extraction from collector artifacts.
//!
//! PCM writes a two-row header: the first row names groups (`System`,
//! `Socket 0`, `Core3 (Socket 0)`, ...) and leaves the following cells
//! empty, the second row names the individual fields. A value is therefore
//! addressed by an anchor in the first row plus a fixed offset. The offsets
//! are owned by PCM's output format and live in [`PCM_SCHEMA_V1`]; a layout
//! change upstream is a new schema table, never a guess.

use std::path::{Path, PathBuf};

use crate::error::{DoatError, Result};

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// A value PCM reports per socket or per core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmField {
    SocketRead,
    SocketWrite,
    L3Miss,
    L2Miss,
    L3Hit,
    L2Hit,
}

/// Where a field sits relative to its anchor, and how to scale it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnSpec {
    pub field: PcmField,
    pub offset: usize,
    pub scale: f64,
}

/// Versioned layout of one collector's artifact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnSchema {
    pub version: u32,
    pub columns: &'static [ColumnSpec],
    /// Data rows to drop before the first sample (PCM's field-name row).
    pub skip_rows: usize,
}

/// PCM 2xx `-csv` layout. Bandwidth is reported in GB/s (scaled to MB/s),
/// misses in millions, hit ratios as fractions (scaled to percent).
pub const PCM_SCHEMA_V1: ColumnSchema = ColumnSchema {
    version: 1,
    columns: &[
        ColumnSpec { field: PcmField::SocketRead, offset: 13, scale: 1000.0 },
        ColumnSpec { field: PcmField::SocketWrite, offset: 14, scale: 1000.0 },
        ColumnSpec { field: PcmField::L3Miss, offset: 4, scale: 1_000_000.0 },
        ColumnSpec { field: PcmField::L2Miss, offset: 5, scale: 1_000_000.0 },
        ColumnSpec { field: PcmField::L3Hit, offset: 6, scale: 100.0 },
        ColumnSpec { field: PcmField::L2Hit, offset: 7, scale: 100.0 },
    ],
    skip_rows: 1,
};

impl ColumnSchema {
    pub fn spec(&self, field: PcmField) -> Result<ColumnSpec> {
        self.columns
            .iter()
            .copied()
            .find(|c| c.field == field)
            .ok_or_else(|| DoatError::Config(format!("schema v{} has no {field:?} column", self.version)))
    }
}

pub fn socket_anchor(socket: u32) -> String {
    format!("Socket {socket}")
}

pub fn core_anchor(core: usize, socket: u32) -> String {
    format!("Core{core} (Socket {socket})")
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// A parsed comma-delimited artifact: one header row plus data rows.
#[derive(Debug, Clone)]
pub struct Table {
    path: PathBuf,
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// PCM separates fields with `;`.
pub fn normalize_delimiters(text: &str) -> String {
    text.replace(';', ",")
}

impl Table {
    /// Parse `text`. `path` is only used to name the artifact in errors.
    pub fn parse(path: impl Into<PathBuf>, text: &str) -> Result<Self> {
        let path = path.into();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let mut records = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            records.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }
        let mut records = records.into_iter();
        let header = records
            .next()
            .ok_or_else(|| DoatError::malformed(&path, "artifact is empty"))?;
        Ok(Self {
            path,
            header,
            rows: records.collect(),
        })
    }

    /// Read a PCM artifact, normalising its delimiters first.
    pub fn read_pcm(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(path, &normalize_delimiters(&text))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(path, &text)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Cells in the artifact, header included.
    pub fn datapoints(&self) -> usize {
        (self.rows.len() + 1) * self.header.len()
    }

    /// Index of the column `offset` fields after `anchor`.
    pub fn locate(&self, anchor: &str, offset: usize) -> Result<usize> {
        let not_found = || DoatError::ColumnNotFound {
            anchor: anchor.to_string(),
            offset,
        };
        let base = self
            .header
            .iter()
            .position(|h| h == anchor)
            .ok_or_else(not_found)?;
        let index = base.checked_add(offset).ok_or_else(not_found)?;
        if index >= self.header.len() {
            return Err(not_found());
        }
        Ok(index)
    }

    /// Values of column `index`, skipping the first `skip` data rows.
    pub fn numbers_at(&self, index: usize, skip: usize) -> Result<Vec<f64>> {
        self.rows
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(row, cells)| {
                let cell = cells.get(index).map(String::as_str).unwrap_or("");
                cell.parse::<f64>().map_err(|_| {
                    DoatError::malformed(
                        &self.path,
                        format!("row {}, column {index}: '{cell}' is not a number", row + 2),
                    )
                })
            })
            .collect()
    }

    /// Column by exact header name.
    pub fn named(&self, name: &str) -> Result<Vec<f64>> {
        self.numbers_at(self.locate(name, 0)?, 0)
    }

    /// Column addressed through `schema`, scaled.
    pub fn extract(&self, schema: &ColumnSchema, anchor: &str, field: PcmField) -> Result<Vec<f64>> {
        let spec = schema.spec(field)?;
        let index = self.locate(anchor, spec.offset)?;
        let values = self.numbers_at(index, schema.skip_rows)?;
        Ok(values.into_iter().map(|v| v * spec.scale).collect())
    }
}
