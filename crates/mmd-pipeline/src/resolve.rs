use serde::Serialize;
use strsim::normalized_levenshtein;

use crate::export::SynonymExportRecord;

/// Minimum confidence for mapping a free-text name without review.
pub const AUTO_MAP_THRESHOLD: f64 = 0.95;

const CONTAINS_SCORE: f64 = 0.95;

/// Lowercase and keep ASCII alphanumerics only.
pub fn normalize_name(input: &str) -> String {
    input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Similarity of two already-normalised names in `0.0..=1.0`.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        1.0
    } else if a.contains(b) || b.contains(a) {
        CONTAINS_SCORE
    } else {
        normalized_levenshtein(a, b)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynonymMatch {
    pub synonym_id: String,
    pub synonym_name: String,
    pub metric_id: String,
    pub metric_name: String,
    pub system_id: Option<i64>,
    pub canonical_unit: Option<String>,
    pub confidence: f64,
    pub exact: bool,
    pub auto_mapped: bool,
}

#[derive(Debug, Clone)]
pub struct SynonymResolver {
    entries: Vec<(String, SynonymExportRecord)>,
    threshold: f64,
}

impl SynonymResolver {
    pub fn new(records: Vec<SynonymExportRecord>) -> Self {
        let entries = records
            .into_iter()
            .map(|record| (normalize_name(&record.synonym_name), record))
            .filter(|(normalized, _)| !normalized.is_empty())
            .collect();
        Self {
            entries,
            threshold: AUTO_MAP_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest-scoring synonym for `name`; the first candidate wins ties.
    pub fn best_match(&self, name: &str) -> Option<SynonymMatch> {
        let wanted = normalize_name(name);
        if wanted.is_empty() {
            return None;
        }

        let mut best: Option<(f64, &SynonymExportRecord)> = None;
        for (normalized, record) in &self.entries {
            let score = similarity(&wanted, normalized);
            if score > best.map_or(0.0, |(s, _)| s) {
                best = Some((score, record));
            }
            if score >= 1.0 {
                break;
            }
        }

        best.map(|(confidence, record)| SynonymMatch {
            synonym_id: record.synonym_id.clone(),
            synonym_name: record.synonym_name.clone(),
            metric_id: record.metric_id.clone(),
            metric_name: record.metric_name.clone(),
            system_id: record.system_id,
            canonical_unit: record.canonical_unit.clone(),
            confidence,
            exact: confidence >= 1.0,
            auto_mapped: confidence >= self.threshold,
        })
    }

    /// The best match only when it clears the auto-map threshold.
    pub fn auto_map(&self, name: &str) -> Option<SynonymMatch> {
        self.best_match(name).filter(|m| m.auto_mapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(synonym_id: &str, synonym_name: &str, metric_id: &str, metric_name: &str) -> SynonymExportRecord {
        SynonymExportRecord {
            synonym_id: synonym_id.into(),
            synonym_name: synonym_name.into(),
            metric_id: metric_id.into(),
            metric_name: metric_name.into(),
            system_id: Some(1),
            canonical_unit: Some("mg/dL".into()),
            normal_min: None,
            normal_max: None,
        }
    }

    fn resolver() -> SynonymResolver {
        SynonymResolver::new(vec![
            record("1", "Blood Sugar", "1", "Glucose"),
            record("2", "Fasting Glucose", "1", "Glucose"),
            record("3", "HbA1c", "2", "Hemoglobin A1c"),
        ])
    }

    #[test]
    fn normalisation_drops_case_and_punctuation() {
        assert_eq!(normalize_name(" Hb-A1c (%) "), "hba1c");
        assert_eq!(normalize_name("---"), "");
    }

    #[test]
    fn exact_match_after_normalisation() {
        let found = resolver().best_match("blood-sugar").expect("match");
        assert_eq!(found.metric_id, "1");
        assert!(found.exact);
        assert!(found.auto_mapped);
        assert!((found.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn containment_scores_at_auto_map_threshold() {
        let found = resolver().best_match("Glucose").expect("match");
        assert_eq!(found.synonym_id, "2");
        assert!((found.confidence - 0.95).abs() < f64::EPSILON);
        assert!(resolver().auto_map("Glucose").is_some());
    }

    #[test]
    fn fuzzy_match_below_threshold_is_not_auto_mapped() {
        let found = resolver().best_match("HbA1x").expect("fuzzy");
        assert_eq!(found.metric_id, "2");
        assert!(found.confidence < AUTO_MAP_THRESHOLD);
        assert!(!found.auto_mapped);
        assert!(resolver().auto_map("HbA1x").is_none());
    }

    #[test]
    fn empty_input_never_matches() {
        assert!(resolver().best_match("").is_none());
        assert!(resolver().best_match("  %% ").is_none());
        assert!(SynonymResolver::new(Vec::new()).best_match("glucose").is_none());
    }
}
