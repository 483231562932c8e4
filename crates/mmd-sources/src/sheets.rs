use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use mmd_core::{CatalogBatch, ConversionGroup, ConversionUnit, Metric, Synonym};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::{read_json_file, BatchSource, SourceError};

pub type SheetRow = serde_json::Map<String, Value>;

const ID_LEN: usize = 100;
const NAME_LEN: usize = 255;
const UNIT_LEN: usize = 50;
const FORMULA_LEN: usize = 255;
const SOURCE_LEN: usize = 100;
const DECIMAL_LIMIT: f64 = 9_999_999.999;

const METRIC_COLUMNS: [&str; 10] = [
    "metric_id",
    "metric_name",
    "system_id",
    "canonical_unit",
    "conversion_group_id",
    "normal_min",
    "normal_max",
    "is_key_metric",
    "source",
    "explanation",
];
const SYNONYM_COLUMNS: [&str; 4] = ["synonym_id", "metric_id", "synonym_name", "notes"];
const CONVERSION_COLUMNS: [&str; 6] = [
    "conversion_group_id",
    "canonical_unit",
    "alt_unit",
    "to_canonical_formula",
    "from_canonical_formula",
    "notes",
];

/// Flat admin upload: one row per metric, per synonym and per `(group, alt_unit)`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SheetBundle {
    #[serde(default)]
    pub metrics: Vec<SheetRow>,
    #[serde(default)]
    pub synonyms: Vec<SheetRow>,
    #[serde(default)]
    pub conversion_groups: Vec<SheetRow>,
}

impl SheetBundle {
    /// Every problem in the upload; empty when it can be converted.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        match self.metrics.first() {
            None => errors.push("metrics sheet is empty".to_string()),
            Some(first) => missing_columns("metrics", first, &METRIC_COLUMNS, &mut errors),
        }
        if let Some(first) = self.synonyms.first() {
            missing_columns("synonyms", first, &SYNONYM_COLUMNS, &mut errors);
        }
        if let Some(first) = self.conversion_groups.first() {
            missing_columns("conversion_groups", first, &CONVERSION_COLUMNS, &mut errors);
        }

        let mut allowed_units = BTreeSet::new();
        for row in &self.conversion_groups {
            let group_id = cell_text(row, "conversion_group_id").unwrap_or_default();
            allowed_units.extend(cell_text(row, "canonical_unit"));
            allowed_units.extend(cell_text(row, "alt_unit"));
            for field in ["to_canonical_formula", "from_canonical_formula"] {
                if let Some(formula) = cell_text(row, field) {
                    if !formula.contains('x') {
                        errors.push(format!(
                            "conversion_groups: {field} must reference 'x' for {group_id}"
                        ));
                    }
                }
            }
        }

        for (index, row) in self.metrics.iter().enumerate() {
            let label = cell_text(row, "metric_id").unwrap_or_else(|| format!("row {}", index + 1));
            if cell_text(row, "metric_id").is_none() {
                errors.push(format!("metrics[{label}]: metric_id is required"));
            }
            if cell_text(row, "metric_name").is_none() {
                errors.push(format!("metrics[{label}]: metric_name is required"));
            }
            if let Some(system) = cell_text(row, "system_id") {
                if system.trim().parse::<f64>().map_or(true, |n| n.fract() != 0.0) {
                    errors.push(format!("metrics[{label}]: system_id must be integer"));
                }
            }
            for field in ["normal_min", "normal_max"] {
                if let Some(raw) = cell_text(row, field) {
                    if parse_decimal_safe(&raw).is_none() {
                        errors.push(format!("metrics[{label}]: {field} must be numeric (found \"{raw}\")"));
                    }
                }
            }
            if let Some(flag) = cell_text(row, "is_key_metric") {
                if parse_flag(&flag).is_none() {
                    errors.push(format!("metrics[{label}]: is_key_metric must be Y or N"));
                }
            }
            if let Some(unit) = cell_text(row, "canonical_unit") {
                if !allowed_units.is_empty() && !allowed_units.contains(&unit) {
                    errors.push(format!(
                        "metrics[{label}]: canonical_unit not in conversion_groups units"
                    ));
                }
            }
        }

        errors
    }

    /// Sanitised batch. Call after `validate` came back empty.
    pub fn into_batch(self) -> CatalogBatch {
        let mut groups: BTreeMap<String, ConversionGroup> = BTreeMap::new();

        for row in &self.conversion_groups {
            let Some(group_id) = sanitized(row, "conversion_group_id", ID_LEN) else {
                continue;
            };
            let group = groups
                .entry(group_id.clone())
                .or_insert_with(|| ConversionGroup::new(group_id));
            if group.canonical_unit.is_none() {
                group.canonical_unit = sanitized(row, "canonical_unit", UNIT_LEN);
            }
            if let Some(alt_unit) = sanitized(row, "alt_unit", UNIT_LEN) {
                group.units.push(ConversionUnit {
                    alt_unit,
                    to_canonical_formula: sanitized(row, "to_canonical_formula", FORMULA_LEN),
                    from_canonical_formula: sanitized(row, "from_canonical_formula", FORMULA_LEN),
                    notes: cell_text(row, "notes"),
                });
            } else if group.notes.is_none() {
                group.notes = cell_text(row, "notes");
            }
        }

        let mut metrics = Vec::with_capacity(self.metrics.len());
        for row in &self.metrics {
            let Some(metric_id) = sanitized(row, "metric_id", ID_LEN) else {
                continue;
            };
            let metric_name = sanitized(row, "metric_name", NAME_LEN).unwrap_or_default();
            let mut metric = Metric::new(metric_id.clone(), metric_name);
            metric.system_id = cell_text(row, "system_id").and_then(|s| sanitize_system_id(&s));
            metric.canonical_unit = sanitized(row, "canonical_unit", UNIT_LEN);
            metric.normal_min = cell_text(row, "normal_min").and_then(|s| parse_decimal_safe(&s));
            metric.normal_max = cell_text(row, "normal_max").and_then(|s| parse_decimal_safe(&s));
            metric.is_key_metric = flag(row, "is_key_metric");
            metric.source = sanitized(row, "source", SOURCE_LEN);
            metric.explanation = cell_text(row, "explanation");
            metric.exclude_from_analysis = flag(row, "exclude_from_analysis");
            metric.review_reason = cell_text(row, "review_reason");

            if let Some(group_id) = sanitized(row, "conversion_group_id", ID_LEN) {
                groups
                    .entry(group_id.clone())
                    .or_insert_with(|| ConversionGroup::new(group_id))
                    .members
                    .push(metric_id);
            }
            metrics.push(metric);
        }

        let synonyms = self
            .synonyms
            .iter()
            .filter_map(|row| {
                let mut synonym = Synonym::new(
                    sanitized(row, "synonym_id", ID_LEN)?,
                    sanitized(row, "synonym_name", NAME_LEN)?,
                    sanitized(row, "metric_id", ID_LEN)?,
                );
                synonym.notes = cell_text(row, "notes");
                Some(synonym)
            })
            .collect();

        CatalogBatch {
            metrics,
            synonyms,
            conversion_groups: groups.into_values().collect(),
        }
    }
}

/// Sheet bundle document on disk, validated and sanitised on load.
#[derive(Debug, Clone)]
pub struct SheetBundleFile {
    path: PathBuf,
}

impl SheetBundleFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl BatchSource for SheetBundleFile {
    fn describe(&self) -> String {
        format!("sheet bundle {}", self.path.display())
    }

    fn load(&self) -> Result<CatalogBatch, SourceError> {
        let bundle: SheetBundle = read_json_file(&self.path)?;
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
            "loaded sheet bundle"
        );
        Ok(batch)
    }
}

/// Lenient decimal parsing clamped to `±9999999.999` and rounded to 3 places.
///
/// Accepts thousand separators and a decimal comma; `null`, `-` and blanks are absent.
pub fn parse_decimal_safe(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") || trimmed == "-" {
        return None;
    }
    let normalized = match (trimmed.contains(','), trimmed.contains('.')) {
        (true, true) => trimmed.replace(',', ""),
        (true, false) => trimmed.replace(',', "."),
        _ => trimmed.to_string(),
    };
    let digits: String = normalized
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-'))
        .collect();
    let value = leading_number(&digits)?.parse::<f64>().ok()?;
    if !value.is_finite() {
        return None;
    }
    let clamped = value.clamp(-DECIMAL_LIMIT, DECIMAL_LIMIT);
    Some((clamped * 1000.0).round() / 1000.0)
}

/// Known organ systems are numbered 1 through 13; anything else is dropped.
pub fn sanitize_system_id(raw: &str) -> Option<i64> {
    let digits = leading_integer(raw.trim())?;
    digits.parse::<i64>().ok().filter(|n| (1..=13).contains(n))
}

/// Cut `input` to at most `max_chars` characters.
pub fn truncate(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((byte_index, _)) => input[..byte_index].to_string(),
        None => input.to_string(),
    }
}

fn missing_columns(sheet: &str, first_row: &SheetRow, required: &[&str], errors: &mut Vec<String>) {
    for column in required {
        if !first_row.contains_key(*column) {
            errors.push(format!("{sheet} missing column: {column}"));
        }
    }
}

/// Cell as text; null and blank cells are absent.
fn cell_text(row: &SheetRow, column: &str) -> Option<String> {
    let text = match row.get(column)? {
        Value::Null => return None,
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    (!text.trim().is_empty()).then_some(text)
}

fn sanitized(row: &SheetRow, column: &str, max_chars: usize) -> Option<String> {
    cell_text(row, column).map(|text| truncate(&text, max_chars))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "Y" | "TRUE" => Some(true),
        "N" | "FALSE" => Some(false),
        _ => None,
    }
}

fn flag(row: &SheetRow, column: &str) -> bool {
    cell_text(row, column).and_then(|s| parse_flag(&s)).unwrap_or(false)
}

// Longest prefix shaped like `-?digits(.digits)?`.
fn leading_number(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    let mut end = usize::from(bytes.first() == Some(&b'-'));
    let start_digits = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut has_digits = end > start_digits;
    if end < bytes.len() && bytes[end] == b'.' {
        let mut frac_end = end + 1;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        if frac_end > end + 1 {
            has_digits = true;
            end = frac_end;
        }
    }
    has_digits.then(|| &s[..end])
}

fn leading_integer(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    let sign = usize::from(matches!(bytes.first(), Some(b'-') | Some(b'+')));
    let mut end = sign;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    (end > sign).then(|| &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixture_path;

    fn row(pairs: &[(&str, Value)]) -> SheetRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn metric_row(id: &str) -> SheetRow {
        let mut r = row(&[]);
        for column in METRIC_COLUMNS {
            r.insert(column.to_string(), Value::Null);
        }
        r.insert("metric_id".into(), Value::from(id));
        r.insert("metric_name".into(), Value::from(format!("Metric {id}")));
        r
    }

    #[test]
    fn decimals_are_parsed_leniently() {
        assert_eq!(parse_decimal_safe("70"), Some(70.0));
        assert_eq!(parse_decimal_safe(" 99,5 "), Some(99.5));
        assert_eq!(parse_decimal_safe("1,234.5678"), Some(1234.568));
        assert_eq!(parse_decimal_safe("-3.2 mg"), Some(-3.2));
        assert_eq!(parse_decimal_safe("123456789"), Some(9_999_999.999));
        assert_eq!(parse_decimal_safe("-123456789"), Some(-9_999_999.999));
        assert_eq!(parse_decimal_safe("null"), None);
        assert_eq!(parse_decimal_safe("-"), None);
        assert_eq!(parse_decimal_safe("abc"), None);
        assert_eq!(parse_decimal_safe(".5"), Some(0.5));
    }

    #[test]
    fn system_ids_outside_known_range_are_dropped() {
        assert_eq!(sanitize_system_id("5"), Some(5));
        assert_eq!(sanitize_system_id("13"), Some(13));
        assert_eq!(sanitize_system_id("0"), None);
        assert_eq!(sanitize_system_id("42"), None);
        assert_eq!(sanitize_system_id("x"), None);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate("µg/dL", 2), "µg");
        assert_eq!(truncate("short", 50), "short");
    }

    #[test]
    fn validation_reports_every_problem() {
        let mut bad = metric_row("1");
        bad.insert("normal_min".into(), Value::from("n/a"));
        bad.insert("is_key_metric".into(), Value::from("maybe"));
        bad.insert("system_id".into(), Value::from("2.5"));
        let bundle = SheetBundle {
            metrics: vec![bad],
            synonyms: vec![row(&[("synonym_id", Value::from("1"))])],
            conversion_groups: vec![row(&[
                ("conversion_group_id", Value::from("g")),
                ("canonical_unit", Value::from("mg/dL")),
                ("alt_unit", Value::from("mmol/L")),
                ("to_canonical_formula", Value::from("18")),
                ("from_canonical_formula", Value::from("x / 18")),
                ("notes", Value::Null),
            ])],
        };
        let errors = bundle.validate();
        assert!(errors.contains(&"synonyms missing column: metric_id".to_string()));
        assert!(errors.contains(&"conversion_groups: to_canonical_formula must reference 'x' for g".to_string()));
        assert!(errors.contains(&"metrics[1]: normal_min must be numeric (found \"n/a\")".to_string()));
        assert!(errors.contains(&"metrics[1]: is_key_metric must be Y or N".to_string()));
        assert!(errors.contains(&"metrics[1]: system_id must be integer".to_string()));
    }

    #[test]
    fn empty_metrics_sheet_is_rejected() {
        let errors = SheetBundle::default().validate();
        assert_eq!(errors, vec!["metrics sheet is empty".to_string()]);
    }

    #[test]
    fn sheet_fixture_sanitises_into_a_batch() {
        let batch = SheetBundleFile::new(fixture_path("sample_sheets.json"))
            .load()
            .expect("load sheets");

        let glucose = &batch.metrics[0];
        assert_eq!(glucose.metric_id, "1");
        assert_eq!(glucose.system_id, Some(5));
        assert_eq!(glucose.normal_max, Some(99.5));
        assert!(glucose.is_key_metric);

        let platelets = &batch.metrics[1];
        assert_eq!(platelets.metric_id, "2");
        assert_eq!(platelets.system_id, None);
        assert_eq!(platelets.normal_min, Some(150_000.5));
        assert_eq!(platelets.normal_max, None);
        assert!(!platelets.is_key_metric);

        assert_eq!(batch.conversion_groups.len(), 1);
        let group = &batch.conversion_groups[0];
        assert_eq!(group.members, vec!["1".to_string()]);
        assert_eq!(group.units[0].alt_unit, "mmol/L");
        assert_eq!(batch.synonyms[1].notes.as_deref(), Some("lab shorthand"));
    }

    #[test]
    fn invalid_sheet_file_fails_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sheets.json");
        std::fs::write(&path, r#"{"metrics": [], "synonyms": []}"#).expect("write");
        let err = SheetBundleFile::new(&path).load().expect_err("empty");
        match err {
            SourceError::Validation(errors) => assert_eq!(errors, vec!["metrics sheet is empty"]),
            other => panic!("unexpected error: {other}"),
        }
    }
}
