//! Core catalog model for the metric master data set.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "mmd-core";

/// Canonical measurable quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(deserialize_with = "deserialize_id")]
    pub metric_id: String,
    pub metric_name: String,
    #[serde(default)]
    pub system_id: Option<i64>,
    #[serde(default)]
    pub canonical_unit: Option<String>,
    #[serde(default)]
    pub normal_min: Option<f64>,
    #[serde(default)]
    pub normal_max: Option<f64>,
    #[serde(default)]
    pub is_key_metric: bool,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub exclude_from_analysis: bool,
    #[serde(default)]
    pub review_reason: Option<String>,
}

impl Metric {
    pub fn new(metric_id: impl Into<String>, metric_name: impl Into<String>) -> Self {
        Self {
            metric_id: metric_id.into(),
            metric_name: metric_name.into(),
            system_id: None,
            canonical_unit: None,
            normal_min: None,
            normal_max: None,
            is_key_metric: false,
            source: None,
            explanation: None,
            exclude_from_analysis: false,
            review_reason: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.canonical_unit = Some(unit.into());
        self
    }

    pub fn with_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.normal_min = min;
        self.normal_max = max;
        self
    }

    pub fn with_system(mut self, system_id: i64) -> Self {
        self.system_id = Some(system_id);
        self
    }

    /// True when both bounds are set and `normal_min > normal_max`.
    pub fn range_inverted(&self) -> bool {
        matches!((self.normal_min, self.normal_max), (Some(min), Some(max)) if min > max)
    }
}

/// Alternate name resolving to exactly one metric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synonym {
    #[serde(deserialize_with = "deserialize_id")]
    pub synonym_id: String,
    pub synonym_name: String,
    #[serde(deserialize_with = "deserialize_id")]
    pub metric_id: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Synonym {
    pub fn new(
        synonym_id: impl Into<String>,
        synonym_name: impl Into<String>,
        metric_id: impl Into<String>,
    ) -> Self {
        Self {
            synonym_id: synonym_id.into(),
            synonym_name: synonym_name.into(),
            metric_id: metric_id.into(),
            notes: None,
        }
    }
}

/// One convertible unit inside a conversion group. Formulas are expressions in `x`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionUnit {
    pub alt_unit: String,
    #[serde(default)]
    pub to_canonical_formula: Option<String>,
    #[serde(default)]
    pub from_canonical_formula: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Set of metrics and units considered mutually convertible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionGroup {
    #[serde(deserialize_with = "deserialize_id")]
    pub conversion_group_id: String,
    #[serde(default)]
    pub canonical_unit: Option<String>,
    #[serde(default)]
    pub units: Vec<ConversionUnit>,
    #[serde(default, deserialize_with = "deserialize_id_list")]
    pub members: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ConversionGroup {
    pub fn new(conversion_group_id: impl Into<String>) -> Self {
        Self {
            conversion_group_id: conversion_group_id.into(),
            canonical_unit: None,
            units: Vec::new(),
            members: Vec::new(),
            notes: None,
        }
    }
}

/// Authoritative data set delivered wholesale by an upstream source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogBatch {
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub synonyms: Vec<Synonym>,
    #[serde(default)]
    pub conversion_groups: Vec<ConversionGroup>,
}

impl CatalogBatch {
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.synonyms.is_empty() && self.conversion_groups.is_empty()
    }
}

/// Read-only, point-in-time view of the whole catalog.
///
/// Rows are kept sorted by primary key so that every consumer of the same
/// snapshot sees the same order.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CatalogView {
    pub metrics: Vec<Metric>,
    pub synonyms: Vec<Synonym>,
    pub conversion_groups: Vec<ConversionGroup>,
}

impl CatalogView {
    pub fn new(
        mut metrics: Vec<Metric>,
        mut synonyms: Vec<Synonym>,
        mut conversion_groups: Vec<ConversionGroup>,
    ) -> Self {
        metrics.sort_by(|a, b| a.metric_id.cmp(&b.metric_id));
        synonyms.sort_by(|a, b| a.synonym_id.cmp(&b.synonym_id));
        conversion_groups.sort_by(|a, b| a.conversion_group_id.cmp(&b.conversion_group_id));
        for group in &mut conversion_groups {
            group.units.sort_by(|a, b| a.alt_unit.cmp(&b.alt_unit));
            group.members.sort();
        }
        Self {
            metrics,
            synonyms,
            conversion_groups,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.synonyms.is_empty() && self.conversion_groups.is_empty()
    }

    pub fn metric(&self, metric_id: &str) -> Option<&Metric> {
        self.metrics
            .binary_search_by(|m| m.metric_id.as_str().cmp(metric_id))
            .ok()
            .map(|idx| &self.metrics[idx])
    }

    pub fn metrics_by_id(&self) -> BTreeMap<&str, &Metric> {
        self.metrics
            .iter()
            .map(|m| (m.metric_id.as_str(), m))
            .collect()
    }

    pub fn synonyms_for<'a>(&'a self, metric_id: &'a str) -> impl Iterator<Item = &'a Synonym> + 'a {
        self.synonyms.iter().filter(move |s| s.metric_id == metric_id)
    }

    pub fn groups_for<'a>(
        &'a self,
        metric_id: &'a str,
    ) -> impl Iterator<Item = &'a ConversionGroup> + 'a {
        self.conversion_groups
            .iter()
            .filter(move |g| g.members.iter().any(|m| m == metric_id))
    }

    pub fn into_batch(self) -> CatalogBatch {
        CatalogBatch {
            metrics: self.metrics,
            synonyms: self.synonyms,
            conversion_groups: self.conversion_groups,
        }
    }
}

impl From<CatalogBatch> for CatalogView {
    fn from(batch: CatalogBatch) -> Self {
        Self::new(batch.metrics, batch.synonyms, batch.conversion_groups)
    }
}

/// Structural violation classes reported by the integrity checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueType {
    OrphanedSynonym,
    SynonymCollision,
    RangeInverted,
    MissingUnit,
    ExcludedWithoutReason,
    OrphanedGroupMember,
    MissingRange,
    NoSystem,
}

impl IssueType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OrphanedSynonym => "ORPHANED_SYNONYM",
            Self::SynonymCollision => "SYNONYM_COLLISION",
            Self::RangeInverted => "RANGE_INVERTED",
            Self::MissingUnit => "MISSING_UNIT",
            Self::ExcludedWithoutReason => "EXCLUDED_WITHOUT_REASON",
            Self::OrphanedGroupMember => "ORPHANED_GROUP_MEMBER",
            Self::MissingRange => "MISSING_RANGE",
            Self::NoSystem => "NO_SYSTEM",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Informational finding; reported as data, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub issue_type: IssueType,
    pub metric_id: String,
    pub metric_name: Option<String>,
    pub issue_description: String,
    /// Every metric the issue involves; more than one only for collisions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_metric_ids: Vec<String>,
}

/// Recorded bulk commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogVersion {
    pub version_id: i64,
    pub change_summary: String,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub data_hash: String,
    pub added_count: i64,
    pub changed_count: i64,
    pub removed_count: i64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Int(i64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(text) => text,
            RawId::Int(n) => n.to_string(),
        }
    }
}

/// Accepts identifiers written either as JSON strings or integers.
pub fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    RawId::deserialize(deserializer).map(String::from)
}

pub fn deserialize_id_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<RawId>::deserialize(deserializer)?;
    Ok(raw.into_iter().map(String::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_ids_are_accepted_as_text() {
        let batch: CatalogBatch = serde_json::from_str(
            r#"{
                "metrics": [{"metric_id": 1, "metric_name": "Glucose", "canonical_unit": "mg/dL", "normal_min": 70, "normal_max": 99}],
                "synonyms": [{"synonym_id": 1, "synonym_name": "Blood Sugar", "metric_id": "1"}],
                "conversion_groups": [{"conversion_group_id": "glucose", "members": [1]}]
            }"#,
        )
        .expect("parse batch");

        assert_eq!(batch.metrics[0].metric_id, "1");
        assert_eq!(batch.synonyms[0].synonym_id, "1");
        assert_eq!(batch.conversion_groups[0].members, vec!["1".to_string()]);
        assert_eq!(batch.metrics[0].normal_max, Some(99.0));
    }

    #[test]
    fn range_inversion_requires_both_bounds() {
        assert!(Metric::new("1", "A").with_range(Some(10.0), Some(5.0)).range_inverted());
        assert!(!Metric::new("2", "B").with_range(Some(5.0), Some(10.0)).range_inverted());
        assert!(!Metric::new("3", "C").with_range(Some(10.0), None).range_inverted());
    }

    #[test]
    fn view_sorts_and_looks_up_by_id() {
        let view = CatalogView::new(
            vec![Metric::new("2", "B"), Metric::new("1", "A")],
            vec![Synonym::new("s2", "b", "2"), Synonym::new("s1", "a", "1")],
            Vec::new(),
        );
        assert_eq!(view.metrics[0].metric_id, "1");
        assert_eq!(view.synonyms[0].synonym_id, "s1");
        assert_eq!(view.metric("2").map(|m| m.metric_name.as_str()), Some("B"));
        assert!(view.metric("3").is_none());
    }

    #[test]
    fn issue_types_serialize_screaming_snake() {
        let json = serde_json::to_string(&IssueType::ExcludedWithoutReason).expect("ser");
        assert_eq!(json, "\"EXCLUDED_WITHOUT_REASON\"");
        assert_eq!(IssueType::SynonymCollision.to_string(), "SYNONYM_COLLISION");
    }
}
