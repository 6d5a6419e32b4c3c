//! Import ledger: the durable record of which source files have already
//! been merged, keyed by file id and content hash.
//!
//! A ledger row's hash always equals the content hash of the bytes that
//! were last merged successfully; it is written only after the merge
//! commits, so anything that fails mid-run is naturally retried by the
//! next invocation's diff.

use std::collections::HashMap;

use chrono::NaiveDate;
use sqlx::Row;
use tracing::debug;

use crate::db::DbPool;
use crate::error::Result;
use crate::scanner::FileDescriptor;

const ENSURE_TABLE: &str = "CREATE TABLE IF NOT EXISTS import_log (
    file_id TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    path TEXT NOT NULL,
    store TEXT NOT NULL,
    machine TEXT NOT NULL,
    date DATE NOT NULL,
    row_count BIGINT NOT NULL,
    imported_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

const UPSERT_ENTRY: &str = "INSERT INTO import_log
    (file_id, content_hash, path, store, machine, date, row_count, imported_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, now())
    ON CONFLICT (file_id) DO UPDATE SET
        content_hash = EXCLUDED.content_hash,
        path = EXCLUDED.path,
        store = EXCLUDED.store,
        machine = EXCLUDED.machine,
        date = EXCLUDED.date,
        row_count = EXCLUDED.row_count,
        imported_at = now()";

pub struct ImportLedger<'a> {
    pool: &'a DbPool,
}

impl<'a> ImportLedger<'a> {
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Provision the ledger table. Idempotent, called once per invocation.
    pub async fn ensure(&self) -> Result<()> {
        sqlx::query(ENSURE_TABLE).execute(self.pool).await?;
        Ok(())
    }

    /// Keep only candidates whose content hash differs from the ledger's
    /// stored hash for that file id, or that have no entry at all.
    pub async fn diff(&self, candidates: Vec<FileDescriptor>) -> Result<Vec<FileDescriptor>> {
        let known = self.known_hashes().await?;
        let delta: Vec<FileDescriptor> = candidates
            .into_iter()
            .filter(|c| known.get(&c.id) != Some(&c.content_hash))
            .collect();
        debug!(known = known.len(), delta = delta.len(), "ledger diff");
        Ok(delta)
    }

    async fn known_hashes(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT file_id, content_hash FROM import_log")
            .fetch_all(self.pool)
            .await?;
        let mut known = HashMap::with_capacity(rows.len());
        for row in rows {
            known.insert(row.try_get("file_id")?, row.try_get("content_hash")?);
        }
        Ok(known)
    }

    /// Record a successful merge. Only called after the destination
    /// relation durably holds the file's rows.
    #[allow(clippy::too_many_arguments)]
    pub async fn commit(
        &self,
        file_id: &str,
        content_hash: &str,
        path: &str,
        store: &str,
        machine: &str,
        date: NaiveDate,
        row_count: i64,
    ) -> Result<()> {
        sqlx::query(UPSERT_ENTRY)
            .bind(file_id)
            .bind(content_hash)
            .bind(path)
            .bind(store)
            .bind(machine)
            .bind(date)
            .bind(row_count)
            .execute(self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The diff predicate itself is pure; exercise it without a database.
    fn descriptor(id: &str, hash: &str) -> FileDescriptor {
        FileDescriptor {
            id: id.to_string(),
            path: format!("s/m/{id}_2024-01-01.csv"),
            content_hash: hash.to_string(),
            mime: "text/csv".to_string(),
        }
    }

    #[test]
    fn diff_predicate_keeps_new_and_changed_files() {
        let mut known = HashMap::new();
        known.insert("f1".to_string(), "h1".to_string());
        known.insert("f2".to_string(), "h2".to_string());

        let candidates = vec![
            descriptor("f1", "h1"),      // unchanged
            descriptor("f2", "h2-new"),  // changed
            descriptor("f3", "h3"),      // never seen
        ];

        let delta: Vec<_> = candidates
            .into_iter()
            .filter(|c| known.get(&c.id) != Some(&c.content_hash))
            .collect();

        let ids: Vec<&str> = delta.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["f2", "f3"]);
    }
}
