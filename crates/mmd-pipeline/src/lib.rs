//! Commit, check, export and resolve operations over the metric catalog.

pub mod commit;
pub mod config;
pub mod export;
pub mod integrity;
pub mod resolve;

pub use commit::{
    data_hash, diff_metrics, validate_batch, BulkCommitPipeline, CommitError, CommitGuard,
    CommitOutcome, CommitRequest, MetricDiff, NoopGuard, StrictGuard,
};
pub use config::EngineConfig;
pub use export::{
    flatten, system_summary, write_export, ExportError, ExportReport, ExportSummary,
    SynonymExportRecord, SynonymExporter,
};
pub use integrity::{IntegrityChecker, IntegrityReport};
pub use resolve::{normalize_name, SynonymMatch, SynonymResolver, AUTO_MAP_THRESHOLD};

pub const CRATE_NAME: &str = "mmd-pipeline";

use mmd_storage::CatalogStore;

/// Resolver over the synonyms of one consistent snapshot.
pub async fn load_resolver(
    store: &CatalogStore,
    threshold: f64,
) -> Result<SynonymResolver, mmd_storage::StoreError> {
    let view = store.read_snapshot().await?;
    Ok(SynonymResolver::new(flatten(&view)).with_threshold(threshold))
}
