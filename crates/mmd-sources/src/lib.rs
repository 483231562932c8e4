//! Upstream catalog sources: whole-batch JSON documents and flat sheet uploads.

mod sheets;
mod workbook;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use mmd_core::CatalogBatch;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

pub use sheets::{parse_decimal_safe, sanitize_system_id, truncate, SheetBundle, SheetBundleFile, SheetRow};
pub use workbook::{WorkbookFile, CONVERSION_SHEET, METRICS_SHEET, SYNONYMS_SHEET};

pub const CRATE_NAME: &str = "mmd-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("reading workbook {}: {source}", path.display())]
    Workbook {
        path: PathBuf,
        #[source]
        source: calamine::XlsxError,
    },
    #[error("{} validation error(s): {}", .0.len(), .0.join("; "))]
    Validation(Vec<String>),
}

/// Delivers one complete catalog batch.
pub trait BatchSource: Send + Sync {
    fn describe(&self) -> String;
    fn load(&self) -> Result<CatalogBatch, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceFormat {
    #[default]
    Json,
    Sheets,
    Xlsx,
}

impl FromStr for SourceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "sheets" | "sheet" => Ok(Self::Sheets),
            "xlsx" | "workbook" => Ok(Self::Xlsx),
            other => Err(format!("unknown source format `{other}` (expected json, sheets or xlsx)")),
        }
    }
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Json => "json",
            Self::Sheets => "sheets",
            Self::Xlsx => "xlsx",
        })
    }
}

/// A `CatalogBatch` document on disk.
#[derive(Debug, Clone)]
pub struct JsonBatchFile {
    path: PathBuf,
}

impl JsonBatchFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BatchSource for JsonBatchFile {
    fn describe(&self) -> String {
        format!("json batch {}", self.path.display())
    }

    fn load(&self) -> Result<CatalogBatch, SourceError> {
        let batch: CatalogBatch = read_json_file(&self.path)?;
        debug!(
            path = %self.path.display(),
            metrics = batch.metrics.len(),
            synonyms = batch.synonyms.len(),
            conversion_groups = batch.conversion_groups.len(),
            "loaded json batch"
        );
        Ok(batch)
    }
}

pub fn source_for(format: SourceFormat, path: impl Into<PathBuf>) -> Box<dyn BatchSource> {
    match format {
        SourceFormat::Json => Box::new(JsonBatchFile::new(path)),
        SourceFormat::Sheets => Box::new(SheetBundleFile::new(path)),
        SourceFormat::Xlsx => Box::new(WorkbookFile::new(path)),
    }
}

pub(crate) fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T, SourceError> {
    let data = fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| SourceError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
