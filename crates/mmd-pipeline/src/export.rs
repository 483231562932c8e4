//! Denormalised synonym export for consumers that cannot query the catalog.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use mmd_core::CatalogView;
use mmd_storage::{sha256_hex, stage_artifact, ArtifactError, CatalogStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("could not write export artifact {}: {source}", path.display())]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("could not encode export artifact: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl From<ArtifactError> for ExportError {
    fn from(err: ArtifactError) -> Self {
        Self::IoFailure {
            path: err.path,
            source: err.source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynonymExportRecord {
    pub synonym_id: String,
    pub synonym_name: String,
    pub metric_id: String,
    pub metric_name: String,
    pub system_id: Option<i64>,
    pub canonical_unit: Option<String>,
    pub normal_min: Option<f64>,
    pub normal_max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub record_count: usize,
    pub content_hash: String,
    pub by_system: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub artifact_path: PathBuf,
    pub summary_path: PathBuf,
    pub summary: ExportSummary,
}

/// Synonyms joined with their metric, ordered by `(metric_id, synonym_id)`.
///
/// Synonyms whose metric is missing are left out; the integrity checker reports them.
pub fn flatten(view: &CatalogView) -> Vec<SynonymExportRecord> {
    let metrics = view.metrics_by_id();
    let mut records: Vec<_> = view
        .synonyms
        .iter()
        .filter_map(|synonym| {
            let metric = metrics.get(synonym.metric_id.as_str())?;
            Some(SynonymExportRecord {
                synonym_id: synonym.synonym_id.clone(),
                synonym_name: synonym.synonym_name.clone(),
                metric_id: metric.metric_id.clone(),
                metric_name: metric.metric_name.clone(),
                system_id: metric.system_id,
                canonical_unit: metric.canonical_unit.clone(),
                normal_min: metric.normal_min,
                normal_max: metric.normal_max,
            })
        })
        .collect();
    records.sort_by(|a, b| (&a.metric_id, &a.synonym_id).cmp(&(&b.metric_id, &b.synonym_id)));
    records
}

/// Record counts per `system_id`; records without one count as `unassigned`.
pub fn system_summary(records: &[SynonymExportRecord]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        let key = record
            .system_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "unassigned".to_string());
        *counts.entry(key).or_insert(0) += 1;
    }
    counts
}

/// `<dir>/<stem>.summary.json` next to the artifact.
pub fn summary_path_for(artifact_path: &Path) -> PathBuf {
    let stem = artifact_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());
    artifact_path.with_file_name(format!("{stem}.summary.json"))
}

#[derive(Debug, Clone)]
pub struct SynonymExporter {
    store: CatalogStore,
    artifact_path: PathBuf,
}

impl SynonymExporter {
    pub fn new(store: CatalogStore, artifact_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            artifact_path: artifact_path.into(),
        }
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Read one snapshot and replace both artifacts with it.
    pub async fn export(&self) -> Result<ExportReport, ExportError> {
        let view = self.store.read_snapshot().await?;
        write_export(&view, &self.artifact_path).await
    }
}

/// Stage both files, then publish the summary before the array.
///
/// Nothing is renamed until both temp files are on disk. A failed publish of
/// the summary leaves the previous pair untouched.
pub async fn write_export(view: &CatalogView, artifact_path: &Path) -> Result<ExportReport, ExportError> {
    let records = flatten(view);
    let body = serde_json::to_vec_pretty(&records)?;
    let summary = ExportSummary {
        record_count: records.len(),
        content_hash: sha256_hex(&body),
        by_system: system_summary(&records),
    };
    let summary_body = serde_json::to_vec_pretty(&summary)?;

    let staged_artifact = stage_artifact(artifact_path, &body).await?;
    let staged_summary = match stage_artifact(&summary_path_for(artifact_path), &summary_body).await {
        Ok(staged) => staged,
        Err(err) => {
            staged_artifact.discard().await;
            return Err(err.into());
        }
    };
    let summary_path = match staged_summary.publish().await {
        Ok(written) => written.path,
        Err(err) => {
            staged_artifact.discard().await;
            return Err(err.into());
        }
    };
    let artifact = staged_artifact.publish().await?;

    info!(
        path = %artifact_path.display(),
        records = summary.record_count,
        systems = summary.by_system.len(),
        "synonym export written"
    );
    Ok(ExportReport {
        artifact_path: artifact.path,
        summary_path,
        summary,
    })
}
