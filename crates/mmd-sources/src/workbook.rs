use std::path::PathBuf;

use calamine::{open_workbook, Data, Range, Reader, Xlsx};
use mmd_core::CatalogBatch;
use serde_json::Value;
use tracing::debug;

use crate::sheets::{SheetBundle, SheetRow};
use crate::{BatchSource, SourceError};

pub const METRICS_SHEET: &str = "metrics";
pub const SYNONYMS_SHEET: &str = "synonyms";
pub const CONVERSION_SHEET: &str = "conversion_groups";

/// Admin upload workbook with `metrics`, `synonyms` and `conversion_groups` sheets.
///
/// The first row of each sheet holds the column names. A missing sheet reads as empty.
#[derive(Debug, Clone)]
pub struct WorkbookFile {
    path: PathBuf,
}

impl WorkbookFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn read_bundle(&self) -> Result<SheetBundle, SourceError> {
        let mut workbook: Xlsx<_> = open_workbook(&self.path).map_err(|source| SourceError::Workbook {
            path: self.path.clone(),
            source,
        })?;
        let names = workbook.sheet_names();

        let mut read = |sheet: &str| -> Result<Vec<SheetRow>, SourceError> {
            if !names.iter().any(|name| name == sheet) {
                return Ok(Vec::new());
            }
            let range = workbook
                .worksheet_range(sheet)
                .map_err(|source| SourceError::Workbook {
                    path: self.path.clone(),
                    source,
                })?;
            Ok(sheet_rows(&range))
        };

        Ok(SheetBundle {
            metrics: read(METRICS_SHEET)?,
            synonyms: read(SYNONYMS_SHEET)?,
            conversion_groups: read(CONVERSION_SHEET)?,
        })
    }
}

impl BatchSource for WorkbookFile {
    fn describe(&self) -> String {
        format!("xlsx workbook {}", self.path.display())
    }

    fn load(&self) -> Result<CatalogBatch, SourceError> {
        let bundle = self.read_bundle()?;
        let errors = bundle.validate();
        if !errors.is_empty() {
            return Err(SourceError::Validation(errors));
        }
        let batch = bundle.into_batch();
        debug!(
            path = %self.path.display(),
            metrics = batch.metrics.len(),
            synonyms = batch.synonyms.len(),
            conversion_groups = batch.conversion_groups.len(),
            "loaded xlsx workbook"
        );
        Ok(batch)
    }
}

/// Header-keyed rows; every header column is present, empty cells as null. Blank rows are skipped.
fn sheet_rows(range: &Range<Data>) -> Vec<SheetRow> {
    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Vec::new();
    };
    let columns: Vec<Option<String>> = header
        .iter()
        .map(|cell| {
            let name = cell.to_string();
            let name = name.trim();
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect();

    rows.filter(|cells| cells.iter().any(|cell| !is_blank(cell)))
        .map(|cells| {
            columns
                .iter()
                .enumerate()
                .filter_map(|(index, column)| {
                    let value = cells.get(index).map_or(Value::Null, cell_value);
                    column.clone().map(|column| (column, value))
                })
                .collect()
        })
        .collect()
}

fn is_blank(cell: &Data) -> bool {
    match cell {
        Data::Empty => true,
        Data::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn cell_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::String(s) if s.trim().is_empty() => Value::Null,
        Data::String(s) => Value::from(s.as_str()),
        Data::Int(n) => Value::from(*n),
        // Spreadsheets store every number as a float; ids typed as `1` must not read back as `1.0`.
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => Value::from(*f as i64),
        Data::Float(f) => Value::from(*f),
        Data::Bool(b) => Value::from(*b),
        other => Value::from(other.to_string()),
    }
}
