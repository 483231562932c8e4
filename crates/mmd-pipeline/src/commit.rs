//! Atomic replace-everything commits of the catalog.

use std::collections::HashSet;

use mmd_core::{CatalogBatch, CatalogView, IntegrityIssue, IssueType};
use mmd_storage::{
    classify_store_error, sha256_hex, BackoffPolicy, BulkReplace, CatalogStore, RetryDisposition,
    StoreError, VersionRecord,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::integrity::IntegrityChecker;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid {entity} {key}: {reason}")]
    InvalidRecord {
        entity: &'static str,
        key: String,
        reason: String,
    },
    #[error("commit rejected by {} blocking integrity issue(s)", issues.len())]
    Rejected { issues: Vec<IntegrityIssue> },
    #[error("catalog version {0} not found")]
    VersionNotFound(i64),
    #[error("could not encode batch: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CommitError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Store(err) => classify_store_error(err),
            _ => RetryDisposition::NonRetryable,
        }
    }
}

/// Inspects an incoming batch before any transaction is opened.
pub trait CommitGuard: Send + Sync {
    fn inspect(&self, batch: &CatalogBatch) -> Result<(), CommitError>;
}

#[derive(Debug, Default)]
pub struct NoopGuard;

impl CommitGuard for NoopGuard {
    fn inspect(&self, _batch: &CatalogBatch) -> Result<(), CommitError> {
        Ok(())
    }
}

/// Rejects batches that would introduce collisions, orphans or inverted ranges.
#[derive(Debug, Default)]
pub struct StrictGuard {
    checker: IntegrityChecker,
}

impl StrictGuard {
    pub const BLOCKING: [IssueType; 3] = [
        IssueType::SynonymCollision,
        IssueType::OrphanedSynonym,
        IssueType::RangeInverted,
    ];
}

impl CommitGuard for StrictGuard {
    fn inspect(&self, batch: &CatalogBatch) -> Result<(), CommitError> {
        let report = self.checker.check(&CatalogView::from(batch.clone()));
        let blocking: Vec<_> = report
            .issues
            .into_iter()
            .filter(|issue| Self::BLOCKING.contains(&issue.issue_type))
            .collect();
        if blocking.is_empty() {
            Ok(())
        } else {
            Err(CommitError::Rejected { issues: blocking })
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub change_summary: String,
    pub created_by: Option<String>,
}

impl Default for CommitRequest {
    fn default() -> Self {
        Self {
            change_summary: "bulk replace".to_string(),
            created_by: None,
        }
    }
}

/// Metric-level difference between the stored catalog and an incoming batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricDiff {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

pub fn diff_metrics(prior: &CatalogView, batch: &CatalogBatch) -> MetricDiff {
    let mut diff = MetricDiff::default();
    let mut incoming = HashSet::new();
    for metric in &batch.metrics {
        incoming.insert(metric.metric_id.as_str());
        match prior.metric(&metric.metric_id) {
            None => diff.added.push(metric.metric_id.clone()),
            Some(existing) if existing != metric => diff.changed.push(metric.metric_id.clone()),
            Some(_) => {}
        }
    }
    diff.removed = prior
        .metrics
        .iter()
        .filter(|m| !incoming.contains(m.metric_id.as_str()))
        .map(|m| m.metric_id.clone())
        .collect();
    diff.added.sort();
    diff.changed.sort();
    diff
}

/// SHA-256 of the batch's JSON encoding with rows, group units and members ordered by key.
pub fn data_hash(batch: &CatalogBatch) -> Result<String, CommitError> {
    let canonical = CatalogView::from(batch.clone()).into_batch();
    Ok(sha256_hex(&serde_json::to_vec(&canonical)?))
}

/// Conversion formulas are expressions in `x`.
pub fn validate_batch(batch: &CatalogBatch) -> Result<(), CommitError> {
    for group in &batch.conversion_groups {
        for unit in &group.units {
            let formulas = [
                ("to_canonical_formula", &unit.to_canonical_formula),
                ("from_canonical_formula", &unit.from_canonical_formula),
            ];
            for (field, formula) in formulas {
                if let Some(formula) = formula.as_deref().filter(|f| !f.trim().is_empty()) {
                    if !formula.contains('x') {
                        return Err(CommitError::InvalidRecord {
                            entity: "conversion_unit",
                            key: format!("{}::{}", group.conversion_group_id, unit.alt_unit),
                            reason: format!("{field} `{formula}` must reference x"),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub version_id: i64,
    pub data_hash: String,
    pub diff: MetricDiff,
    /// The latest recorded version already carried this exact data.
    pub replayed: bool,
    pub metrics: usize,
    pub synonyms: usize,
    pub conversion_groups: usize,
}

pub struct BulkCommitPipeline {
    store: CatalogStore,
    guard: Box<dyn CommitGuard>,
    backoff: BackoffPolicy,
}

impl BulkCommitPipeline {
    pub fn new(store: CatalogStore) -> Self {
        Self {
            store,
            guard: Box::<NoopGuard>::default(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_guard(mut self, guard: Box<dyn CommitGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn strict(self, enabled: bool) -> Self {
        if enabled {
            self.with_guard(Box::<StrictGuard>::default())
        } else {
            self.with_guard(Box::<NoopGuard>::default())
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    /// Replace the whole catalog with `batch` in one transaction.
    ///
    /// On any failure the transaction is rolled back and the prior catalog stays visible.
    pub async fn commit(
        &self,
        batch: &CatalogBatch,
        request: &CommitRequest,
    ) -> Result<CommitOutcome, CommitError> {
        let span = info_span!(
            "bulk_commit",
            metrics = batch.metrics.len(),
            synonyms = batch.synonyms.len(),
            conversion_groups = batch.conversion_groups.len()
        );
        self.commit_inner(batch, request).instrument(span).await
    }

    /// `commit`, retried with backoff while the backend times out.
    pub async fn commit_with_retry(
        &self,
        batch: &CatalogBatch,
        request: &CommitRequest,
    ) -> Result<CommitOutcome, CommitError> {
        let mut attempt = 0;
        loop {
            match self.commit(batch, request).await {
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(attempt, ?delay, error = %err, "bulk commit timed out; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Re-commit the batch stored with `version_id` as a new version.
    pub async fn restore_version(
        &self,
        version_id: i64,
        created_by: Option<String>,
    ) -> Result<CommitOutcome, CommitError> {
        let batch = self
            .store
            .version_snapshot(version_id)
            .await?
            .ok_or(CommitError::VersionNotFound(version_id))?;
        let request = CommitRequest {
            change_summary: format!("restore version {version_id}"),
            created_by,
        };
        self.commit_with_retry(&batch, &request).await
    }

    async fn commit_inner(
        &self,
        batch: &CatalogBatch,
        request: &CommitRequest,
    ) -> Result<CommitOutcome, CommitError> {
        validate_batch(batch)?;
        self.guard.inspect(batch)?;
        let hash = data_hash(batch)?;

        let mut tx = self.store.begin_bulk_replace().await?;
        let result = replace(&mut tx, batch, request, &hash).await;
        match result {
            Ok(outcome) => {
                tx.commit().await?;
                info!(
                    version_id = outcome.version_id,
                    added = outcome.diff.added.len(),
                    changed = outcome.diff.changed.len(),
                    removed = outcome.diff.removed.len(),
                    replayed = outcome.replayed,
                    "bulk commit applied"
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!(error = %err, "bulk commit failed; rolling back");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed; backend discards the transaction");
                }
                Err(err)
            }
        }
    }
}

async fn replace(
    tx: &mut BulkReplace,
    batch: &CatalogBatch,
    request: &CommitRequest,
    hash: &str,
) -> Result<CommitOutcome, CommitError> {
    let prior = tx.read_view().await?;
    let replayed = tx
        .latest_version()
        .await?
        .is_some_and(|version| version.data_hash == hash);
    let diff = diff_metrics(&prior, batch);

    tx.clear_all().await?;
    tx.insert_metrics(&batch.metrics).await?;
    tx.insert_synonyms(&batch.synonyms).await?;
    tx.insert_conversion_groups(&batch.conversion_groups).await?;

    let record = VersionRecord {
        change_summary: &request.change_summary,
        created_by: request.created_by.as_deref(),
        data_hash: hash,
        added: diff.added.len() as i64,
        changed: diff.changed.len() as i64,
        removed: diff.removed.len() as i64,
    };
    let version_id = tx.record_version(&record, batch).await?;

    Ok(CommitOutcome {
        version_id,
        data_hash: hash.to_string(),
        diff,
        replayed,
        metrics: batch.metrics.len(),
        synonyms: batch.synonyms.len(),
        conversion_groups: batch.conversion_groups.len(),
    })
}
