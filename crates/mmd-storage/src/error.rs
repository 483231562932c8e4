use std::path::PathBuf;
use std::time::Duration;

use sqlx::error::{DatabaseError, ErrorKind};
use thiserror::Error;

/// Failures raised by the catalog store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The same primary (or unique) key appeared twice in one batch.
    #[error("duplicate key in {entity}: {key}")]
    DuplicateKey { entity: &'static str, key: String },

    /// A row references a metric that is not part of the in-flight batch.
    #[error("{entity} {key} references missing metric {metric_id}")]
    ForeignKeyViolation {
        entity: &'static str,
        key: String,
        metric_id: String,
    },

    /// The backend did not answer within the statement timeout, or stayed locked by another writer.
    #[error("transaction timed out during {operation} after {after:?}")]
    TransactionTimeout {
        operation: &'static str,
        after: Duration,
    },

    /// In-memory SQLite cannot give readers a snapshot while a replace is in flight.
    #[error("in-memory database {database_url} is not supported; use a file-backed sqlite:// url")]
    InMemoryDatabase { database_url: String },

    #[error("catalog snapshot ({context}) could not be encoded or decoded: {source}")]
    Snapshot {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("database error during {operation}: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    pub(crate) fn from_sqlx(operation: &'static str, after: Duration, err: sqlx::Error) -> Self {
        if matches!(err, sqlx::Error::PoolTimedOut) {
            return Self::TransactionTimeout { operation, after };
        }
        if let Some(db) = err.as_database_error() {
            match db.kind() {
                ErrorKind::UniqueViolation => {
                    return Self::DuplicateKey {
                        entity: operation,
                        key: db.message().to_string(),
                    }
                }
                ErrorKind::ForeignKeyViolation => {
                    return Self::ForeignKeyViolation {
                        entity: operation,
                        key: db.message().to_string(),
                        metric_id: String::new(),
                    }
                }
                _ => {}
            }
            if is_busy(db) {
                return Self::TransactionTimeout { operation, after };
            }
        }
        Self::Database {
            operation,
            source: err,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TransactionTimeout { .. })
    }
}

// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_busy(db: &dyn DatabaseError) -> bool {
    let primary = db
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| code & 0xff);
    matches!(primary, Some(5) | Some(6)) || db.message().contains("database is locked")
}

/// Failure writing an artifact to disk.
#[derive(Debug, Error)]
#[error("{action} {}: {source}", path.display())]
pub struct ArtifactError {
    pub action: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}
