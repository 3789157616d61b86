//! Durable two-tier dedup ledger.
//!
//! Two independent keyed tables backed by one SQLite file:
//!
//! - `physical_receipts` - one row per unique file content, keyed by the
//!   SHA-256 digest of the full bytes.
//! - `semantic_receipts` - one row per unique (kind, minute, amount) triple.
//!
//! Both rows are written together in a single transaction, only after a
//! successful portal submission. Unique keys make the check-then-commit
//! sequence safe: a racing commit surfaces as a duplicate, never as a double
//! submission record. Records are never updated in place; deletion is an
//! explicit administrative operation.

use std::path::Path;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use crate::error::{DuplicateKind, ReconcileError, Result};
use crate::types::{ReceiptFields, SemanticKey};

/// Everything the ledger persists for one committed receipt.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub hash: String,
    pub filename: String,
    pub fields: ReceiptFields,
}

/// A `physical_receipts` row, as listed by the admin surface.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PhysicalRecord {
    pub hash: String,
    pub filename: String,
    pub kind: String,
    pub stamp: String,
    pub amount_minor: i64,
    pub created_at: String,
}

/// A `semantic_receipts` row, as listed by the admin surface.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SemanticRecord {
    pub kind: String,
    pub stamp_minute: String,
    pub amount_minor: i64,
    pub created_at: String,
}

/// Row counts and most recent commit per table.
#[derive(Debug, Clone, Default)]
pub struct LedgerStats {
    pub physical_rows: i64,
    pub semantic_rows: i64,
    pub last_physical: Option<String>,
    pub last_semantic: Option<String>,
}

/// Which table a purge targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeScope {
    Physical,
    Semantic,
    Both,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS physical_receipts (
        hash TEXT PRIMARY KEY,
        filename TEXT NOT NULL,
        kind TEXT NOT NULL,
        stamp TEXT NOT NULL,
        amount_minor INTEGER NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )",
    "CREATE TABLE IF NOT EXISTS semantic_receipts (
        kind TEXT NOT NULL,
        stamp_minute TEXT NOT NULL,
        amount_minor INTEGER NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        PRIMARY KEY (kind, stamp_minute, amount_minor)
    )",
    "CREATE INDEX IF NOT EXISTS idx_physical_created_at
        ON physical_receipts(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_semantic_created_at
        ON semantic_receipts(created_at)",
];

/// Handle to the ledger database. Cheap to clone via the inner pool.
#[derive(Debug, Clone)]
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open (creating if missing) the ledger file and ensure the schema.
    ///
    /// WAL journaling and NORMAL synchronous match the expected deployment:
    /// one watcher process plus occasional admin reads.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.ensure_schema().await?;
        Ok(ledger)
    }

    async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// True iff a physical record with this content hash exists.
    pub async fn is_known_physical(&self, hash: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM physical_receipts WHERE hash = ?1 LIMIT 1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// True iff a semantic record with this minute-truncated key exists.
    pub async fn is_known_semantic(&self, key: &SemanticKey) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM semantic_receipts
              WHERE kind = ?1 AND stamp_minute = ?2 AND amount_minor = ?3
              LIMIT 1",
        )
        .bind(key.kind.as_str())
        .bind(&key.stamp_minute)
        .bind(key.amount_minor)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    /// Insert both records atomically.
    ///
    /// Fails with [`ReconcileError::Duplicate`] if either key already exists
    /// at commit time; in that case neither row persists. Called only after
    /// the portal collaborator reported success.
    pub async fn commit(&self, request: &CommitRequest) -> Result<()> {
        let key = SemanticKey::from(&request.fields);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO physical_receipts (hash, filename, kind, stamp, amount_minor)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&request.hash)
        .bind(&request.filename)
        .bind(request.fields.kind.as_str())
        .bind(request.fields.stamp.format("%Y-%m-%dT%H:%M:%S").to_string())
        .bind(request.fields.amount_minor)
        .execute(&mut *tx)
        .await
        .map_err(|err| map_insert_error(err, DuplicateKind::Physical))?;

        sqlx::query(
            "INSERT INTO semantic_receipts (kind, stamp_minute, amount_minor)
             VALUES (?1, ?2, ?3)",
        )
        .bind(key.kind.as_str())
        .bind(&key.stamp_minute)
        .bind(key.amount_minor)
        .execute(&mut *tx)
        .await
        .map_err(|err| map_insert_error(err, DuplicateKind::Semantic))?;

        tx.commit().await?;
        Ok(())
    }

    /// Bulk range delete by age. Retention management only; never called from
    /// the processing path. Returns the number of deleted rows.
    pub async fn purge(&self, older_than_days: u32, scope: PurgeScope) -> Result<u64> {
        let cutoff = format!("-{older_than_days} days");
        let mut deleted = 0u64;

        if matches!(scope, PurgeScope::Physical | PurgeScope::Both) {
            let result = sqlx::query(
                "DELETE FROM physical_receipts
                  WHERE datetime(created_at) < datetime('now', ?1)",
            )
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
            deleted += result.rows_affected();
        }

        if matches!(scope, PurgeScope::Semantic | PurgeScope::Both) {
            let result = sqlx::query(
                "DELETE FROM semantic_receipts
                  WHERE datetime(created_at) < datetime('now', ?1)",
            )
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
            deleted += result.rows_affected();
        }

        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Admin surface (read / maintenance only; routed through this store so
    // nothing ever bypasses the commit path)
    // ------------------------------------------------------------------

    pub async fn list_physical(&self, limit: Option<u32>) -> Result<Vec<PhysicalRecord>> {
        let limit = i64::from(limit.unwrap_or(u32::MAX));
        let rows = sqlx::query_as::<_, PhysicalRecord>(
            "SELECT hash, filename, kind, stamp, amount_minor, created_at
               FROM physical_receipts
              ORDER BY datetime(created_at) DESC
              LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_semantic(&self, limit: Option<u32>) -> Result<Vec<SemanticRecord>> {
        let limit = i64::from(limit.unwrap_or(u32::MAX));
        let rows = sqlx::query_as::<_, SemanticRecord>(
            "SELECT kind, stamp_minute, amount_minor, created_at
               FROM semantic_receipts
              ORDER BY datetime(created_at) DESC
              LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// LIKE search over hash, filename, kind, and stamp.
    pub async fn find_physical(&self, term: &str) -> Result<Vec<PhysicalRecord>> {
        let like = format!("%{term}%");
        let rows = sqlx::query_as::<_, PhysicalRecord>(
            "SELECT hash, filename, kind, stamp, amount_minor, created_at
               FROM physical_receipts
              WHERE hash LIKE ?1 OR filename LIKE ?1 OR kind LIKE ?1 OR stamp LIKE ?1
              ORDER BY datetime(created_at) DESC",
        )
        .bind(&like)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// LIKE search over kind, minute stamp, and amount.
    pub async fn find_semantic(&self, term: &str) -> Result<Vec<SemanticRecord>> {
        let like = format!("%{term}%");
        let rows = sqlx::query_as::<_, SemanticRecord>(
            "SELECT kind, stamp_minute, amount_minor, created_at
               FROM semantic_receipts
              WHERE kind LIKE ?1 OR stamp_minute LIKE ?1
                 OR CAST(amount_minor AS TEXT) LIKE ?1
              ORDER BY datetime(created_at) DESC",
        )
        .bind(&like)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Delete physical rows matching the search term. Returns affected count.
    pub async fn delete_physical(&self, term: &str) -> Result<u64> {
        let like = format!("%{term}%");
        let result = sqlx::query(
            "DELETE FROM physical_receipts
              WHERE hash LIKE ?1 OR filename LIKE ?1 OR kind LIKE ?1 OR stamp LIKE ?1",
        )
        .bind(&like)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete semantic rows matching the search term. Returns affected count.
    pub async fn delete_semantic(&self, term: &str) -> Result<u64> {
        let like = format!("%{term}%");
        let result = sqlx::query(
            "DELETE FROM semantic_receipts
              WHERE kind LIKE ?1 OR stamp_minute LIKE ?1
                 OR CAST(amount_minor AS TEXT) LIKE ?1",
        )
        .bind(&like)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<LedgerStats> {
        let physical = sqlx::query(
            "SELECT COUNT(1), MAX(datetime(created_at)) FROM physical_receipts",
        )
        .fetch_one(&self.pool)
        .await?;
        let semantic = sqlx::query(
            "SELECT COUNT(1), MAX(datetime(created_at)) FROM semantic_receipts",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerStats {
            physical_rows: physical.get(0),
            last_physical: physical.get(1),
            semantic_rows: semantic.get(0),
            last_semantic: semantic.get(1),
        })
    }

    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Flush and close the pool. Dropping the handle also closes eventually;
    /// this makes shutdown deterministic.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn map_insert_error(err: sqlx::Error, kind: DuplicateKind) -> ReconcileError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ReconcileError::Duplicate { kind }
        }
        _ => ReconcileError::Ledger(err),
    }
}
