//! Transactional catalog store on SQLite.
//!
//! The store is the only writer of catalog state. Every write runs inside a
//! transaction whose first statement updates the single-row
//! `catalog_write_lock` table, which serializes writers at the backend.
//! Readers open their own transaction and, with the WAL journal, observe one
//! point-in-time state for the duration of the read.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use mmd_core::{
    CatalogBatch, CatalogVersion, CatalogView, ConversionGroup, ConversionUnit, Metric, Synonym,
};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::schema;

/// Catalog tables. Declaration order is the delete order: children before parents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CatalogTable {
    Synonyms,
    ConversionMembers,
    ConversionUnits,
    ConversionGroups,
    Metrics,
}

impl CatalogTable {
    pub const ALL: [CatalogTable; 5] = [
        CatalogTable::Synonyms,
        CatalogTable::ConversionMembers,
        CatalogTable::ConversionUnits,
        CatalogTable::ConversionGroups,
        CatalogTable::Metrics,
    ];

    pub const fn table_name(self) -> &'static str {
        match self {
            Self::Synonyms => "master_metric_synonyms",
            Self::ConversionMembers => "master_conversion_members",
            Self::ConversionUnits => "master_conversion_units",
            Self::ConversionGroups => "master_conversion_groups",
            Self::Metrics => "master_metrics",
        }
    }
}

pub const DEFAULT_SNAPSHOT_RETENTION: usize = 100;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Bounds every statement and the time spent waiting on another writer's lock.
    pub statement_timeout: Duration,
    /// Newest version snapshots kept for restore; 0 keeps all of them.
    pub snapshot_retention: usize,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/master.db".to_string(),
            max_connections: 4,
            statement_timeout: Duration::from_secs(30),
            snapshot_retention: DEFAULT_SNAPSHOT_RETENTION,
        }
    }
}

/// Fields of a version row written alongside a bulk replace.
#[derive(Debug, Clone, Copy)]
pub struct VersionRecord<'a> {
    pub change_summary: &'a str,
    pub created_by: Option<&'a str>,
    pub data_hash: &'a str,
    pub added: i64,
    pub changed: i64,
    pub removed: i64,
}

#[derive(Debug, Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
    statement_timeout: Duration,
    snapshot_retention: usize,
}

impl CatalogStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let timeout = config.statement_timeout;
        let Some(path) = database_file(&config.database_url) else {
            return Err(StoreError::InMemoryDatabase {
                database_url: config.database_url.clone(),
            });
        };
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                StoreError::from_sqlx("create database directory", timeout, sqlx::Error::Io(err))
            })?;
        }
        // A snapshot reader needs a connection of its own while a writer holds one.
        let max_connections = config.max_connections.max(2);
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(timeout)
            .connect_with(options)
            .await
            .map_err(|err| StoreError::from_sqlx("connect", timeout, err))?;

        info!(database_url = %config.database_url, max_connections, "catalog store connected");
        Ok(Self {
            pool,
            statement_timeout: timeout,
            snapshot_retention: config.snapshot_retention,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn statement_timeout(&self) -> Duration {
        self.statement_timeout
    }

    /// Create missing tables and indexes. Safe to run repeatedly.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let timeout = self.statement_timeout;
        let mut tx = bounded("begin migration", timeout, self.pool.begin()).await?;
        for statement in schema::STATEMENTS {
            bounded("migrate", timeout, sqlx::query(statement).execute(&mut *tx)).await?;
        }
        bounded("commit migration", timeout, tx.commit()).await?;
        debug!(statements = schema::STATEMENTS.len(), "catalog schema ensured");
        Ok(())
    }

    /// Open a write transaction over the whole catalog.
    ///
    /// Blocks (up to the statement timeout) while another writer holds the
    /// catalog, then fails with `TransactionTimeout`.
    pub async fn begin_bulk_replace(&self) -> Result<BulkReplace, StoreError> {
        let tx = self.begin_write("bulk_replace").await?;
        Ok(BulkReplace {
            tx,
            timeout: self.statement_timeout,
            snapshot_retention: self.snapshot_retention,
            metric_ids: HashSet::new(),
            metric_names: HashSet::new(),
            synonym_ids: HashSet::new(),
            group_ids: HashSet::new(),
        })
    }

    /// Point-in-time consistent view of metrics, synonyms and conversion groups.
    pub async fn read_snapshot(&self) -> Result<CatalogView, StoreError> {
        let timeout = self.statement_timeout;
        let mut tx = bounded("begin snapshot", timeout, self.pool.begin()).await?;
        let view = load_view(&mut tx, timeout).await?;
        bounded("end snapshot", timeout, tx.rollback()).await?;
        Ok(view)
    }

    /// Recorded versions, newest first.
    pub async fn versions(&self) -> Result<Vec<CatalogVersion>, StoreError> {
        let timeout = self.statement_timeout;
        let rows = bounded(
            "read versions",
            timeout,
            sqlx::query(&format!("{SELECT_VERSIONS} ORDER BY version_id DESC")).fetch_all(&self.pool),
        )
        .await?;
        rows.iter()
            .map(version_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| StoreError::from_sqlx("decode versions", timeout, err))
    }

    pub async fn latest_version(&self) -> Result<Option<CatalogVersion>, StoreError> {
        let mut conn = bounded("acquire connection", self.statement_timeout, self.pool.acquire()).await?;
        fetch_latest_version(&mut conn, self.statement_timeout).await
    }

    /// The batch committed as `version_id`, if that version exists.
    pub async fn version_snapshot(&self, version_id: i64) -> Result<Option<CatalogBatch>, StoreError> {
        let row = bounded(
            "read version snapshot",
            self.statement_timeout,
            sqlx::query("SELECT batch_json FROM master_snapshots WHERE version_id = ?1")
                .bind(version_id)
                .fetch_optional(&self.pool),
        )
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let json: String = row
            .try_get("batch_json")
            .map_err(|err| StoreError::from_sqlx("decode version snapshot", self.statement_timeout, err))?;
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|source| StoreError::Snapshot {
                context: format!("version {version_id}"),
                source,
            })
    }

    /// Insert or overwrite one metric outside of a bulk replace.
    pub async fn upsert_metric(&self, metric: &Metric) -> Result<(), StoreError> {
        let timeout = self.statement_timeout;
        let mut tx = self.begin_write("upsert_metric").await?;
        let sql = format!(
            "{INSERT_METRIC} ON CONFLICT(metric_id) DO UPDATE SET \
             metric_name = excluded.metric_name, system_id = excluded.system_id, \
             canonical_unit = excluded.canonical_unit, normal_min = excluded.normal_min, \
             normal_max = excluded.normal_max, is_key_metric = excluded.is_key_metric, \
             source = excluded.source, explanation = excluded.explanation, \
             exclude_from_analysis = excluded.exclude_from_analysis, \
             review_reason = excluded.review_reason"
        );
        bounded("metric", timeout, bind_metric(sqlx::query(&sql), metric).execute(&mut *tx)).await?;
        bounded("commit upsert_metric", timeout, tx.commit()).await?;
        info!(metric_id = %metric.metric_id, "metric upserted");
        Ok(())
    }

    /// Delete a metric together with its synonyms and group memberships.
    pub async fn delete_metric(&self, metric_id: &str) -> Result<bool, StoreError> {
        self.delete_one("delete_metric", "DELETE FROM master_metrics WHERE metric_id = ?1", metric_id)
            .await
    }

    pub async fn delete_synonym(&self, synonym_id: &str) -> Result<bool, StoreError> {
        self.delete_one(
            "delete_synonym",
            "DELETE FROM master_metric_synonyms WHERE synonym_id = ?1",
            synonym_id,
        )
        .await
    }

    pub async fn set_metric_exclusion(
        &self,
        metric_id: &str,
        exclude: bool,
        review_reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let timeout = self.statement_timeout;
        let mut tx = self.begin_write("set_metric_exclusion").await?;
        let result = bounded(
            "set_metric_exclusion",
            timeout,
            sqlx::query(
                "UPDATE master_metrics SET exclude_from_analysis = ?1, review_reason = ?2 WHERE metric_id = ?3",
            )
            .bind(exclude)
            .bind(review_reason)
            .bind(metric_id)
            .execute(&mut *tx),
        )
        .await?;
        bounded("commit set_metric_exclusion", timeout, tx.commit()).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_one(&self, operation: &'static str, sql: &str, key: &str) -> Result<bool, StoreError> {
        let timeout = self.statement_timeout;
        let mut tx = self.begin_write(operation).await?;
        let result = bounded(operation, timeout, sqlx::query(sql).bind(key).execute(&mut *tx)).await?;
        bounded("commit delete", timeout, tx.commit()).await?;
        let deleted = result.rows_affected() > 0;
        info!(operation, key, deleted, "single-row delete");
        Ok(deleted)
    }

    async fn begin_write(&self, holder: &str) -> Result<Transaction<'static, Sqlite>, StoreError> {
        let timeout = self.statement_timeout;
        let mut tx = bounded("begin write transaction", timeout, self.pool.begin()).await?;
        bounded(
            "acquire catalog write lock",
            timeout,
            sqlx::query("UPDATE catalog_write_lock SET holder = ?1, acquired_at = ?2 WHERE id = 1")
                .bind(holder)
                .bind(Utc::now())
                .execute(&mut *tx),
        )
        .await?;
        Ok(tx)
    }
}

/// Open bulk-replace transaction holding the catalog write lock.
///
/// Dropping it without `commit` discards every change.
pub struct BulkReplace {
    tx: Transaction<'static, Sqlite>,
    timeout: Duration,
    snapshot_retention: usize,
    metric_ids: HashSet<String>,
    metric_names: HashSet<String>,
    synonym_ids: HashSet<String>,
    group_ids: HashSet<String>,
}

impl BulkReplace {
    /// Catalog state as seen inside this transaction.
    pub async fn read_view(&mut self) -> Result<CatalogView, StoreError> {
        load_view(&mut self.tx, self.timeout).await
    }

    pub async fn latest_version(&mut self) -> Result<Option<CatalogVersion>, StoreError> {
        fetch_latest_version(&mut self.tx, self.timeout).await
    }

    /// Delete every row of `tables`, children first whatever order they are given in.
    pub async fn clear(&mut self, tables: &[CatalogTable]) -> Result<u64, StoreError> {
        let mut ordered = tables.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut removed = 0;
        for table in ordered {
            let sql = format!("DELETE FROM {}", table.table_name());
            let result = bounded("clear", self.timeout, sqlx::query(&sql).execute(&mut *self.tx)).await?;
            removed += result.rows_affected();
            self.forget(table);
            debug!(table = table.table_name(), rows = result.rows_affected(), "cleared");
        }
        Ok(removed)
    }

    pub async fn clear_all(&mut self) -> Result<u64, StoreError> {
        self.clear(&CatalogTable::ALL).await
    }

    pub async fn insert_metrics(&mut self, records: &[Metric]) -> Result<(), StoreError> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for metric in records {
            if !ids.insert(metric.metric_id.as_str()) || self.metric_ids.contains(&metric.metric_id) {
                return Err(StoreError::DuplicateKey {
                    entity: "metric",
                    key: metric.metric_id.clone(),
                });
            }
            if !names.insert(metric.metric_name.as_str())
                || self.metric_names.contains(&metric.metric_name)
            {
                return Err(StoreError::DuplicateKey {
                    entity: "metric_name",
                    key: metric.metric_name.clone(),
                });
            }
        }

        for metric in records {
            bounded(
                "metric",
                self.timeout,
                bind_metric(sqlx::query(INSERT_METRIC), metric).execute(&mut *self.tx),
            )
            .await?;
            self.metric_ids.insert(metric.metric_id.clone());
            self.metric_names.insert(metric.metric_name.clone());
        }
        debug!(count = records.len(), "inserted metrics");
        Ok(())
    }

    /// Insert synonyms; every `metric_id` must belong to the metrics inserted in this transaction.
    pub async fn insert_synonyms(&mut self, records: &[Synonym]) -> Result<(), StoreError> {
        let mut ids = HashSet::new();
        for synonym in records {
            if !ids.insert(synonym.synonym_id.as_str()) || self.synonym_ids.contains(&synonym.synonym_id)
            {
                return Err(StoreError::DuplicateKey {
                    entity: "synonym",
                    key: synonym.synonym_id.clone(),
                });
            }
            if !self.metric_ids.contains(&synonym.metric_id) {
                return Err(StoreError::ForeignKeyViolation {
                    entity: "synonym",
                    key: synonym.synonym_id.clone(),
                    metric_id: synonym.metric_id.clone(),
                });
            }
        }

        for synonym in records {
            bounded(
                "synonym",
                self.timeout,
                sqlx::query(
                    "INSERT INTO master_metric_synonyms (synonym_id, synonym_name, metric_id, notes) \
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(&synonym.synonym_id)
                .bind(&synonym.synonym_name)
                .bind(&synonym.metric_id)
                .bind(&synonym.notes)
                .execute(&mut *self.tx),
            )
            .await?;
            self.synonym_ids.insert(synonym.synonym_id.clone());
        }
        debug!(count = records.len(), "inserted synonyms");
        Ok(())
    }

    pub async fn insert_conversion_groups(&mut self, records: &[ConversionGroup]) -> Result<(), StoreError> {
        let mut ids = HashSet::new();
        for group in records {
            let group_id = group.conversion_group_id.as_str();
            if !ids.insert(group_id) || self.group_ids.contains(group_id) {
                return Err(StoreError::DuplicateKey {
                    entity: "conversion_group",
                    key: group_id.to_string(),
                });
            }
            let mut units = HashSet::new();
            for unit in &group.units {
                if !units.insert(unit.alt_unit.as_str()) {
                    return Err(StoreError::DuplicateKey {
                        entity: "conversion_unit",
                        key: format!("{group_id}::{}", unit.alt_unit),
                    });
                }
            }
            let mut members = HashSet::new();
            for metric_id in &group.members {
                if !members.insert(metric_id.as_str()) {
                    return Err(StoreError::DuplicateKey {
                        entity: "conversion_member",
                        key: format!("{group_id}::{metric_id}"),
                    });
                }
                if !self.metric_ids.contains(metric_id) {
                    return Err(StoreError::ForeignKeyViolation {
                        entity: "conversion_group",
                        key: group_id.to_string(),
                        metric_id: metric_id.clone(),
                    });
                }
            }
        }

        for group in records {
            bounded(
                "conversion_group",
                self.timeout,
                sqlx::query(
                    "INSERT INTO master_conversion_groups (conversion_group_id, canonical_unit, notes) \
                     VALUES (?1, ?2, ?3)",
                )
                .bind(&group.conversion_group_id)
                .bind(&group.canonical_unit)
                .bind(&group.notes)
                .execute(&mut *self.tx),
            )
            .await?;
            for unit in &group.units {
                bounded(
                    "conversion_unit",
                    self.timeout,
                    sqlx::query(
                        "INSERT INTO master_conversion_units \
                         (conversion_group_id, alt_unit, to_canonical_formula, from_canonical_formula, notes) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )
                    .bind(&group.conversion_group_id)
                    .bind(&unit.alt_unit)
                    .bind(&unit.to_canonical_formula)
                    .bind(&unit.from_canonical_formula)
                    .bind(&unit.notes)
                    .execute(&mut *self.tx),
                )
                .await?;
            }
            for metric_id in &group.members {
                bounded(
                    "conversion_member",
                    self.timeout,
                    sqlx::query(
                        "INSERT INTO master_conversion_members (conversion_group_id, metric_id) VALUES (?1, ?2)",
                    )
                    .bind(&group.conversion_group_id)
                    .bind(metric_id)
                    .execute(&mut *self.tx),
                )
                .await?;
            }
            self.group_ids.insert(group.conversion_group_id.clone());
        }
        debug!(count = records.len(), "inserted conversion groups");
        Ok(())
    }

    /// Append a version row and the JSON snapshot of `batch` inside this transaction.
    pub async fn record_version(
        &mut self,
        record: &VersionRecord<'_>,
        batch: &CatalogBatch,
    ) -> Result<i64, StoreError> {
        let batch_json = serde_json::to_string(batch).map_err(|source| StoreError::Snapshot {
            context: "encode committed batch".to_string(),
            source,
        })?;

        let result = bounded(
            "record version",
            self.timeout,
            sqlx::query(
                "INSERT INTO master_versions \
                 (change_summary, created_by, created_at, data_hash, added_count, changed_count, removed_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .bind(record.change_summary)
            .bind(record.created_by)
            .bind(Utc::now())
            .bind(record.data_hash)
            .bind(record.added)
            .bind(record.changed)
            .bind(record.removed)
            .execute(&mut *self.tx),
        )
        .await?;
        let version_id = result.last_insert_rowid();

        bounded(
            "record snapshot",
            self.timeout,
            sqlx::query("INSERT INTO master_snapshots (version_id, batch_json) VALUES (?1, ?2)")
                .bind(version_id)
                .bind(&batch_json)
                .execute(&mut *self.tx),
        )
        .await?;

        if self.snapshot_retention > 0 {
            let pruned = bounded(
                "prune snapshots",
                self.timeout,
                sqlx::query(
                    "DELETE FROM master_snapshots WHERE version_id NOT IN \
                     (SELECT version_id FROM master_snapshots ORDER BY version_id DESC LIMIT ?1)",
                )
                .bind(i64::try_from(self.snapshot_retention).unwrap_or(i64::MAX))
                .execute(&mut *self.tx),
            )
            .await?;
            if pruned.rows_affected() > 0 {
                debug!(
                    pruned = pruned.rows_affected(),
                    keep = self.snapshot_retention,
                    "pruned version snapshots"
                );
            }
        }
        Ok(version_id)
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        bounded("commit bulk replace", self.timeout, self.tx.commit()).await
    }

    pub async fn rollback(self) -> Result<(), StoreError> {
        bounded("rollback bulk replace", self.timeout, self.tx.rollback()).await
    }

    fn forget(&mut self, table: CatalogTable) {
        match table {
            // Deleting metrics cascades to synonyms.
            CatalogTable::Metrics => {
                self.metric_ids.clear();
                self.metric_names.clear();
                self.synonym_ids.clear();
            }
            CatalogTable::Synonyms => self.synonym_ids.clear(),
            CatalogTable::ConversionGroups => self.group_ids.clear(),
            CatalogTable::ConversionMembers | CatalogTable::ConversionUnits => {}
        }
    }
}

const INSERT_METRIC: &str = "INSERT INTO master_metrics \
    (metric_id, metric_name, system_id, canonical_unit, normal_min, normal_max, is_key_metric, \
     source, explanation, exclude_from_analysis, review_reason) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)";

const SELECT_VERSIONS: &str = "SELECT version_id, change_summary, created_by, created_at, data_hash, \
    added_count, changed_count, removed_count FROM master_versions";

fn bind_metric<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    metric: &'q Metric,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(&metric.metric_id)
        .bind(&metric.metric_name)
        .bind(metric.system_id)
        .bind(&metric.canonical_unit)
        .bind(metric.normal_min)
        .bind(metric.normal_max)
        .bind(metric.is_key_metric)
        .bind(&metric.source)
        .bind(&metric.explanation)
        .bind(metric.exclude_from_analysis)
        .bind(&metric.review_reason)
}

async fn bounded<T, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(|err| StoreError::from_sqlx(operation, timeout, err)),
        Err(_) => Err(StoreError::TransactionTimeout {
            operation,
            after: timeout,
        }),
    }
}

/// File path of a file-backed database URL; `None` for in-memory databases.
///
/// Snapshot reads alongside a bulk replace need WAL, which needs a file.
fn database_file(database_url: &str) -> Option<&str> {
    let rest = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    let path = rest.split('?').next().unwrap_or(rest);
    (!path.is_empty() && !path.starts_with(":memory:")).then_some(path)
}

async fn fetch_latest_version(
    conn: &mut SqliteConnection,
    timeout: Duration,
) -> Result<Option<CatalogVersion>, StoreError> {
    let row = bounded(
        "read latest version",
        timeout,
        sqlx::query(&format!("{SELECT_VERSIONS} ORDER BY version_id DESC LIMIT 1")).fetch_optional(&mut *conn),
    )
    .await?;
    row.as_ref()
        .map(version_from_row)
        .transpose()
        .map_err(|err| StoreError::from_sqlx("decode version", timeout, err))
}

async fn load_view(conn: &mut SqliteConnection, timeout: Duration) -> Result<CatalogView, StoreError> {
    let metric_rows = bounded(
        "read metrics",
        timeout,
        sqlx::query(
            "SELECT metric_id, metric_name, system_id, canonical_unit, normal_min, normal_max, \
             is_key_metric, source, explanation, exclude_from_analysis, review_reason \
             FROM master_metrics ORDER BY metric_id",
        )
        .fetch_all(&mut *conn),
    )
    .await?;
    let synonym_rows = bounded(
        "read synonyms",
        timeout,
        sqlx::query(
            "SELECT synonym_id, synonym_name, metric_id, notes FROM master_metric_synonyms ORDER BY synonym_id",
        )
        .fetch_all(&mut *conn),
    )
    .await?;
    let group_rows = bounded(
        "read conversion groups",
        timeout,
        sqlx::query(
            "SELECT conversion_group_id, canonical_unit, notes FROM master_conversion_groups \
             ORDER BY conversion_group_id",
        )
        .fetch_all(&mut *conn),
    )
    .await?;
    let unit_rows = bounded(
        "read conversion units",
        timeout,
        sqlx::query(
            "SELECT conversion_group_id, alt_unit, to_canonical_formula, from_canonical_formula, notes \
             FROM master_conversion_units ORDER BY conversion_group_id, alt_unit",
        )
        .fetch_all(&mut *conn),
    )
    .await?;
    let member_rows = bounded(
        "read conversion members",
        timeout,
        sqlx::query(
            "SELECT conversion_group_id, metric_id FROM master_conversion_members \
             ORDER BY conversion_group_id, metric_id",
        )
        .fetch_all(&mut *conn),
    )
    .await?;

    let decode = |err| StoreError::from_sqlx("decode catalog rows", timeout, err);
    let metrics = metric_rows
        .iter()
        .map(metric_from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(decode)?;
    let synonyms = synonym_rows
        .iter()
        .map(synonym_from_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(decode)?;
    let groups = assemble_groups(&group_rows, &unit_rows, &member_rows).map_err(decode)?;

    Ok(CatalogView::new(metrics, synonyms, groups))
}

fn metric_from_row(row: &SqliteRow) -> Result<Metric, sqlx::Error> {
    Ok(Metric {
        metric_id: row.try_get("metric_id")?,
        metric_name: row.try_get("metric_name")?,
        system_id: row.try_get("system_id")?,
        canonical_unit: row.try_get("canonical_unit")?,
        normal_min: row.try_get("normal_min")?,
        normal_max: row.try_get("normal_max")?,
        is_key_metric: row.try_get("is_key_metric")?,
        source: row.try_get("source")?,
        explanation: row.try_get("explanation")?,
        exclude_from_analysis: row.try_get("exclude_from_analysis")?,
        review_reason: row.try_get("review_reason")?,
    })
}

fn synonym_from_row(row: &SqliteRow) -> Result<Synonym, sqlx::Error> {
    Ok(Synonym {
        synonym_id: row.try_get("synonym_id")?,
        synonym_name: row.try_get("synonym_name")?,
        metric_id: row.try_get("metric_id")?,
        notes: row.try_get("notes")?,
    })
}

fn version_from_row(row: &SqliteRow) -> Result<CatalogVersion, sqlx::Error> {
    Ok(CatalogVersion {
        version_id: row.try_get("version_id")?,
        change_summary: row.try_get("change_summary")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        data_hash: row.try_get("data_hash")?,
        added_count: row.try_get("added_count")?,
        changed_count: row.try_get("changed_count")?,
        removed_count: row.try_get("removed_count")?,
    })
}

fn assemble_groups(
    group_rows: &[SqliteRow],
    unit_rows: &[SqliteRow],
    member_rows: &[SqliteRow],
) -> Result<Vec<ConversionGroup>, sqlx::Error> {
    let mut groups = BTreeMap::new();
    for row in group_rows {
        let group_id: String = row.try_get("conversion_group_id")?;
        let mut group = ConversionGroup::new(group_id.clone());
        group.canonical_unit = row.try_get("canonical_unit")?;
        group.notes = row.try_get("notes")?;
        groups.insert(group_id, group);
    }
    for row in unit_rows {
        let group_id: String = row.try_get("conversion_group_id")?;
        if let Some(group) = groups.get_mut(&group_id) {
            group.units.push(ConversionUnit {
                alt_unit: row.try_get("alt_unit")?,
                to_canonical_formula: row.try_get("to_canonical_formula")?,
                from_canonical_formula: row.try_get("from_canonical_formula")?,
                notes: row.try_get("notes")?,
            });
        }
    }
    for row in member_rows {
        let group_id: String = row.try_get("conversion_group_id")?;
        if let Some(group) = groups.get_mut(&group_id) {
            group.members.push(row.try_get("metric_id")?);
        }
    }
    Ok(groups.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    async fn temp_store(timeout: Duration) -> (TempDir, CatalogStore) {
        let dir = tempdir().expect("tempdir");
        let config = StoreConfig {
            database_url: format!("sqlite://{}", dir.path().join("catalog.db").display()),
            max_connections: 4,
            statement_timeout: timeout,
            ..StoreConfig::default()
        };
        let store = CatalogStore::connect(&config).await.expect("connect");
        store.migrate().await.expect("migrate");
        (dir, store)
    }

    fn glucose() -> Metric {
        Metric::new("1", "Glucose")
            .with_unit("mg/dL")
            .with_range(Some(70.0), Some(99.0))
    }

    async fn seed(store: &CatalogStore) {
        let mut group = ConversionGroup::new("glucose");
        group.canonical_unit = Some("mg/dL".into());
        group.units.push(ConversionUnit {
            alt_unit: "mmol/L".into(),
            to_canonical_formula: Some("x * 18".into()),
            from_canonical_formula: Some("x / 18".into()),
            notes: None,
        });
        group.members.push("1".into());

        let mut tx = store.begin_bulk_replace().await.expect("begin");
        tx.clear_all().await.expect("clear");
        tx.insert_metrics(&[glucose(), Metric::new("2", "Hemoglobin").with_unit("g/dL")])
            .await
            .expect("metrics");
        tx.insert_synonyms(&[Synonym::new("1", "Blood Sugar", "1"), Synonym::new("2", "Hb", "2")])
            .await
            .expect("synonyms");
        tx.insert_conversion_groups(&[group]).await.expect("groups");
        tx.commit().await.expect("commit");
    }

    #[tokio::test]
    async fn committed_replace_is_visible_in_snapshot() {
        let (_dir, store) = temp_store(Duration::from_secs(5)).await;
        seed(&store).await;

        let view = store.read_snapshot().await.expect("snapshot");
        assert_eq!(view.metrics.len(), 2);
        assert_eq!(view.metrics[0], glucose());
        assert_eq!(view.synonyms.len(), 2);
        assert_eq!(view.conversion_groups.len(), 1);
        assert_eq!(view.conversion_groups[0].members, vec!["1".to_string()]);
        assert_eq!(view.conversion_groups[0].units[0].alt_unit, "mmol/L");
    }

    #[tokio::test]
    async fn duplicate_metric_id_fails_and_rollback_restores_prior_state() {
        let (_dir, store) = temp_store(Duration::from_secs(5)).await;
        seed(&store).await;
        let before = store.read_snapshot().await.expect("before");

        let mut tx = store.begin_bulk_replace().await.expect("begin");
        tx.clear_all().await.expect("clear");
        let err = tx
            .insert_metrics(&[Metric::new("9", "A"), Metric::new("9", "B")])
            .await
            .expect_err("duplicate");
        assert!(matches!(err, StoreError::DuplicateKey { entity: "metric", ref key } if key == "9"));
        tx.rollback().await.expect("rollback");

        assert_eq!(store.read_snapshot().await.expect("after"), before);
    }

    #[tokio::test]
    async fn duplicate_metric_name_is_a_duplicate_key() {
        let (_dir, store) = temp_store(Duration::from_secs(5)).await;
        let mut tx = store.begin_bulk_replace().await.expect("begin");
        let err = tx
            .insert_metrics(&[Metric::new("1", "Glucose"), Metric::new("2", "Glucose")])
            .await
            .expect_err("duplicate name");
        assert!(matches!(err, StoreError::DuplicateKey { entity: "metric_name", .. }));
    }

    #[tokio::test]
    async fn synonyms_are_checked_against_in_flight_metrics_only() {
        let (_dir, store) = temp_store(Duration::from_secs(5)).await;
        seed(&store).await;

        let mut tx = store.begin_bulk_replace().await.expect("begin");
        tx.clear_all().await.expect("clear");
        tx.insert_metrics(&[Metric::new("3", "Ferritin")]).await.expect("metrics");
        // Metric "1" existed before the clear but is not part of this batch.
        let err = tx
            .insert_synonyms(&[Synonym::new("7", "Sugar", "1")])
            .await
            .expect_err("orphan");
        match err {
            StoreError::ForeignKeyViolation { entity, key, metric_id } => {
                assert_eq!(entity, "synonym");
                assert_eq!(key, "7");
                assert_eq!(metric_id, "1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn group_member_must_reference_in_flight_metric() {
        let (_dir, store) = temp_store(Duration::from_secs(5)).await;
        let mut tx = store.begin_bulk_replace().await.expect("begin");
        tx.insert_metrics(&[Metric::new("1", "Glucose")]).await.expect("metrics");
        let mut group = ConversionGroup::new("g");
        group.members = vec!["1".into(), "404".into()];
        let err = tx.insert_conversion_groups(&[group]).await.expect_err("fk");
        assert!(matches!(err, StoreError::ForeignKeyViolation { ref metric_id, .. } if metric_id == "404"));
    }

    #[tokio::test]
    async fn clear_orders_children_before_parents() {
        let (_dir, store) = temp_store(Duration::from_secs(5)).await;
        seed(&store).await;

        let mut tx = store.begin_bulk_replace().await.expect("begin");
        let removed = tx
            .clear(&[CatalogTable::Metrics, CatalogTable::ConversionGroups, CatalogTable::Synonyms])
            .await
            .expect("clear");
        // 2 synonyms + 1 group + 2 metrics; units and members go with their parents.
        assert_eq!(removed, 5);
        assert!(tx.read_view().await.expect("view").is_empty());
        tx.commit().await.expect("commit");
        assert!(store.read_snapshot().await.expect("snapshot").is_empty());
    }

    #[tokio::test]
    async fn readers_see_prior_state_while_replace_is_in_flight() {
        let (_dir, store) = temp_store(Duration::from_secs(5)).await;
        seed(&store).await;

        let mut tx = store.begin_bulk_replace().await.expect("begin");
        tx.clear_all().await.expect("clear");
        tx.insert_metrics(&[Metric::new("5", "Sodium")]).await.expect("insert");

        let during = store.read_snapshot().await.expect("snapshot during replace");
        assert_eq!(during.metrics.len(), 2);
        assert!(during.metric("5").is_none());

        tx.commit().await.expect("commit");
        let after = store.read_snapshot().await.expect("snapshot after");
        assert_eq!(after.metrics.len(), 1);
        assert!(after.metric("5").is_some());
    }

    #[tokio::test]
    async fn second_writer_times_out_while_catalog_is_held() {
        let (_dir, store) = temp_store(Duration::from_millis(300)).await;
        let holder = store.begin_bulk_replace().await.expect("first writer");

        let err = store.begin_bulk_replace().await.err().expect("second writer must fail");
        assert!(err.is_timeout(), "unexpected error: {err}");

        holder.rollback().await.expect("rollback");
        let again = store.begin_bulk_replace().await.expect("lock free again");
        again.rollback().await.expect("rollback");
    }

    #[tokio::test]
    async fn versions_keep_snapshots_of_committed_batches() {
        let (_dir, store) = temp_store(Duration::from_secs(5)).await;
        let batch = CatalogBatch {
            metrics: vec![glucose()],
            synonyms: vec![Synonym::new("1", "Blood Sugar", "1")],
            conversion_groups: Vec::new(),
        };

        let mut tx = store.begin_bulk_replace().await.expect("begin");
        tx.insert_metrics(&batch.metrics).await.expect("metrics");
        tx.insert_synonyms(&batch.synonyms).await.expect("synonyms");
        let version_id = tx
            .record_version(
                &VersionRecord {
                    change_summary: "initial load",
                    created_by: Some("tests"),
                    data_hash: "abc",
                    added: 1,
                    changed: 0,
                    removed: 0,
                },
                &batch,
            )
            .await
            .expect("version");
        tx.commit().await.expect("commit");

        let versions = store.versions().await.expect("versions");
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version_id, version_id);
        assert_eq!(versions[0].data_hash, "abc");
        assert_eq!(versions[0].created_by.as_deref(), Some("tests"));
        assert_eq!(store.version_snapshot(version_id).await.expect("snap"), Some(batch));
        assert_eq!(store.version_snapshot(version_id + 1).await.expect("missing"), None);
    }

    #[tokio::test]
    async fn old_snapshots_are_pruned_beyond_retention() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::connect(&StoreConfig {
            database_url: format!("sqlite://{}", dir.path().join("catalog.db").display()),
            snapshot_retention: 2,
            ..StoreConfig::default()
        })
        .await
        .expect("connect");
        store.migrate().await.expect("migrate");

        let mut ids = Vec::new();
        for name in ["Glucose", "Sodium", "Potassium"] {
            let batch = CatalogBatch {
                metrics: vec![Metric::new("1", name)],
                synonyms: Vec::new(),
                conversion_groups: Vec::new(),
            };
            let mut tx = store.begin_bulk_replace().await.expect("begin");
            tx.clear_all().await.expect("clear");
            tx.insert_metrics(&batch.metrics).await.expect("metrics");
            let record = VersionRecord {
                change_summary: name,
                created_by: None,
                data_hash: name,
                added: 1,
                changed: 0,
                removed: 0,
            };
            ids.push(tx.record_version(&record, &batch).await.expect("version"));
            tx.commit().await.expect("commit");
        }

        // Version rows are history and stay; only the restorable payloads are capped.
        assert_eq!(store.versions().await.expect("versions").len(), 3);
        assert_eq!(store.version_snapshot(ids[0]).await.expect("oldest"), None);
        for id in &ids[1..] {
            assert!(store.version_snapshot(*id).await.expect("kept").is_some());
        }
    }

    #[tokio::test]
    async fn single_row_operations() {
        let (_dir, store) = temp_store(Duration::from_secs(5)).await;
        seed(&store).await;

        assert!(store
            .set_metric_exclusion("2", true, Some("assay retired"))
            .await
            .expect("exclude"));
        assert!(!store.set_metric_exclusion("404", true, None).await.expect("missing"));

        let mut renamed = glucose();
        renamed.metric_name = "Fasting Glucose".into();
        store.upsert_metric(&renamed).await.expect("upsert");

        assert!(store.delete_synonym("1").await.expect("delete synonym"));
        assert!(!store.delete_synonym("1").await.expect("already gone"));
        assert!(store.delete_metric("2").await.expect("delete metric"));

        let view = store.read_snapshot().await.expect("snapshot");
        assert_eq!(view.metrics.len(), 1);
        assert_eq!(view.metrics[0].metric_name, "Fasting Glucose");
        // Synonym "2" pointed at metric "2" and went with it.
        assert!(view.synonyms.is_empty());
    }

    #[tokio::test]
    async fn in_memory_urls_are_rejected() {
        for url in ["sqlite::memory:", "sqlite://:memory:"] {
            let err = CatalogStore::connect(&StoreConfig::new(url))
                .await
                .err()
                .expect("in-memory store must be refused");
            assert!(
                matches!(err, StoreError::InMemoryDatabase { ref database_url } if database_url == url),
                "unexpected error: {err}"
            );
        }
    }

    #[tokio::test]
    async fn single_connection_config_still_reads_during_replace() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::connect(&StoreConfig {
            database_url: format!("sqlite://{}", dir.path().join("catalog.db").display()),
            max_connections: 1,
            statement_timeout: Duration::from_millis(500),
            ..StoreConfig::default()
        })
        .await
        .expect("connect");
        store.migrate().await.expect("migrate");
        seed(&store).await;

        let mut tx = store.begin_bulk_replace().await.expect("begin");
        tx.clear_all().await.expect("clear");
        let during = store.read_snapshot().await.expect("reader is not blocked by the writer");
        assert_eq!(during.metrics.len(), 2);
        tx.rollback().await.expect("rollback");
    }

    #[test]
    fn database_file_handles_urls_and_memory() {
        assert_eq!(database_file("sqlite://./data/master.db"), Some("./data/master.db"));
        assert_eq!(database_file("sqlite:catalog.db?mode=rwc"), Some("catalog.db"));
        assert_eq!(database_file("/tmp/x.db"), Some("/tmp/x.db"));
        assert_eq!(database_file("sqlite::memory:"), None);
        assert_eq!(database_file("sqlite://:memory:"), None);
    }
}
