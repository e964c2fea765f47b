//! Fingerprint lookups and inserts.

use crate::error::{DatabaseError, Error, Result};
use sqlx::FromRow;

use super::Database;

/// One row of the duplicate index
///
/// Rows are unique on `fingerprint` and never updated.
#[derive(Debug, Clone, FromRow)]
pub struct FingerprintRow {
    /// Hex-encoded SHA-256 of the materialized file content
    pub fingerprint: String,
    /// Where the first copy of this content was placed
    pub file_path: String,
    /// Size of the materialized file in bytes
    pub file_size: i64,
    /// Unix timestamp of the first sighting
    pub created_at: i64,
}

/// Result of an insert attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The fingerprint was new and is now recorded
    Inserted,
    /// A row with this fingerprint already existed; nothing was written
    AlreadyPresent,
}

impl Database {
    /// Look up the path a fingerprint was first materialized at.
    pub async fn lookup_fingerprint(&self, fingerprint: &str) -> Result<Option<FingerprintRow>> {
        let row = sqlx::query_as::<_, FingerprintRow>(
            r#"
            SELECT fingerprint, file_path, file_size, created_at
            FROM fingerprints
            WHERE fingerprint = ?
            LIMIT 1
            "#,
        )
        .bind(fingerprint)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "failed to look up fingerprint: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// Record a fingerprint; existing rows win.
    ///
    /// The write is committed before this returns, so a crash after a
    /// successful insert cannot lose the row.
    pub async fn insert_fingerprint(
        &self,
        fingerprint: &str,
        file_path: &str,
        file_size: u64,
    ) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO fingerprints (fingerprint, file_path, file_size, created_at)
            VALUES (?, ?, ?, strftime('%s','now'))
            "#,
        )
        .bind(fingerprint)
        .bind(file_path)
        .bind(file_size as i64)
        .execute(self.pool())
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "failed to insert fingerprint: {}",
                e
            )))
        })?;

        if result.rows_affected() == 1 {
            Ok(InsertOutcome::Inserted)
        } else {
            Ok(InsertOutcome::AlreadyPresent)
        }
    }
}
