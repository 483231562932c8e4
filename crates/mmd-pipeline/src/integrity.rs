//! Read-only structural analysis of a catalog snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use mmd_core::{CatalogView, IntegrityIssue, IssueType, Metric};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityChecker {
    require_system: bool,
}

impl IntegrityChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also report metrics without a `system_id` (`NO_SYSTEM`).
    pub fn require_system(mut self, enabled: bool) -> Self {
        self.require_system = enabled;
        self
    }

    pub fn check(&self, view: &CatalogView) -> IntegrityReport {
        let metrics = view.metrics_by_id();
        let mut issues = Vec::new();

        for metric in &view.metrics {
            self.check_metric(metric, &mut issues);
        }

        for synonym in &view.synonyms {
            if !metrics.contains_key(synonym.metric_id.as_str()) {
                issues.push(IntegrityIssue {
                    issue_type: IssueType::OrphanedSynonym,
                    metric_id: synonym.metric_id.clone(),
                    metric_name: None,
                    issue_description: format!(
                        "synonym \"{}\" ({}) references missing metric {}",
                        synonym.synonym_name, synonym.synonym_id, synonym.metric_id
                    ),
                    related_metric_ids: Vec::new(),
                });
            }
        }

        // Synonym names compare case-insensitively after trimming.
        let mut by_name: BTreeMap<String, (String, BTreeSet<&str>)> = BTreeMap::new();
        for synonym in &view.synonyms {
            let key = synonym.synonym_name.trim().to_lowercase();
            by_name
                .entry(key)
                .or_insert_with(|| (synonym.synonym_name.trim().to_string(), BTreeSet::new()))
                .1
                .insert(synonym.metric_id.as_str());
        }
        for (display_name, metric_ids) in by_name.into_values() {
            if metric_ids.len() < 2 {
                continue;
            }
            let related: Vec<String> = metric_ids.iter().map(|id| id.to_string()).collect();
            let first = related[0].clone();
            issues.push(IntegrityIssue {
                issue_type: IssueType::SynonymCollision,
                metric_name: metrics.get(first.as_str()).map(|m| m.metric_name.clone()),
                issue_description: format!(
                    "synonym \"{display_name}\" maps to metrics {}",
                    related.join(", ")
                ),
                metric_id: first,
                related_metric_ids: related,
            });
        }

        for group in &view.conversion_groups {
            for member in &group.members {
                if !metrics.contains_key(member.as_str()) {
                    issues.push(IntegrityIssue {
                        issue_type: IssueType::OrphanedGroupMember,
                        metric_id: member.clone(),
                        metric_name: None,
                        issue_description: format!(
                            "conversion group {} lists missing metric {member}",
                            group.conversion_group_id
                        ),
                        related_metric_ids: Vec::new(),
                    });
                }
            }
        }

        issues.sort_by(|a, b| {
            (a.issue_type, &a.metric_id, &a.issue_description).cmp(&(
                b.issue_type,
                &b.metric_id,
                &b.issue_description,
            ))
        });
        IntegrityReport { issues }
    }

    fn check_metric(&self, metric: &Metric, issues: &mut Vec<IntegrityIssue>) {
        let mut push = |issue_type, description: String| {
            issues.push(IntegrityIssue {
                issue_type,
                metric_id: metric.metric_id.clone(),
                metric_name: Some(metric.metric_name.clone()),
                issue_description: description,
                related_metric_ids: Vec::new(),
            })
        };

        if let (true, Some(min), Some(max)) =
            (metric.range_inverted(), metric.normal_min, metric.normal_max)
        {
            push(
                IssueType::RangeInverted,
                format!("normal_min {min} is greater than normal_max {max}"),
            );
        }
        if metric.canonical_unit.as_deref().map_or(true, |u| u.trim().is_empty()) {
            push(IssueType::MissingUnit, "no canonical_unit".to_string());
        }
        if metric.exclude_from_analysis
            && metric.review_reason.as_deref().map_or(true, |r| r.trim().is_empty())
        {
            push(
                IssueType::ExcludedWithoutReason,
                "excluded from analysis without a review_reason".to_string(),
            );
        }
        if metric.is_key_metric && (metric.normal_min.is_none() || metric.normal_max.is_none()) {
            push(
                IssueType::MissingRange,
                "key metric is missing normal_min or normal_max".to_string(),
            );
        }
        if self.require_system && metric.system_id.is_none() {
            push(IssueType::NoSystem, "no system_id".to_string());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IntegrityReport {
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn grouped(&self) -> BTreeMap<IssueType, Vec<&IntegrityIssue>> {
        let mut groups: BTreeMap<IssueType, Vec<&IntegrityIssue>> = BTreeMap::new();
        for issue in &self.issues {
            groups.entry(issue.issue_type).or_default().push(issue);
        }
        groups
    }

    pub fn contains_any(&self, types: &[IssueType]) -> bool {
        self.issues.iter().any(|issue| types.contains(&issue.issue_type))
    }

    pub fn render_text(&self) -> String {
        if self.is_clean() {
            return "No integrity issues found.\n".to_string();
        }
        let mut out = format!("Found {} integrity issue(s):\n", self.issues.len());
        for (issue_type, issues) in self.grouped() {
            let _ = writeln!(out, "\n{issue_type} ({}):", issues.len());
            for issue in issues {
                let _ = writeln!(
                    out,
                    "  - {} ({}): {}",
                    issue.metric_name.as_deref().unwrap_or("-"),
                    issue.metric_id,
                    issue.issue_description
                );
            }
        }
        out
    }
}
