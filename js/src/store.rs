//! SQLite-backed record store
//!
//! Documents live in a `records` table; indexed fields are mirrored into a
//! `record_index` side table inside the same transaction as the document
//! write, so queries and documents can never disagree.

use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::{Filter, FilterOp, IndexValue, Record};

/// Outcome of a compare-and-set update
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The guard matched and the update was applied
    Updated,
    /// The guard field held a different value; nothing was written
    Conflict {
        /// Observed value of the guard field (None if record missing)
        actual: Option<String>,
    },
}

impl CasOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated)
    }
}

/// The record store
///
/// Not `Sync`: intended to be owned by a single actor task that serialises
/// access. Every write commits before the call returns.
pub struct Store {
    conn: Connection,
    path: PathBuf,
}

impl Store {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let conn = Connection::open(&path).context("Failed to open store database")?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id         TEXT NOT NULL,
                json       TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, id)
            );
            CREATE TABLE IF NOT EXISTS record_index (
                collection TEXT NOT NULL,
                record_id  TEXT NOT NULL,
                field      TEXT NOT NULL,
                value      TEXT NOT NULL,
                value_int  INTEGER,
                PRIMARY KEY (collection, record_id, field)
            );
            CREATE INDEX IF NOT EXISTS idx_record_index_lookup
                ON record_index (collection, field, value);
            CREATE INDEX IF NOT EXISTS idx_record_index_numeric
                ON record_index (collection, field, value_int);",
        )
        .context("Failed to create store schema")?;

        debug!(path = %path.display(), "Opened job store");
        Ok(Self { conn, path })
    }

    /// Path this store was opened at
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Insert a new record; fails if the id already exists
    pub fn insert<T: Record>(&mut self, record: &T) -> Result<()> {
        debug!(collection = T::collection_name(), id = record.id(), "insert: called");
        let json = serde_json::to_string(record).context("Failed to serialize record")?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO records (collection, id, json, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![T::collection_name(), record.id(), json, record.updated_at()],
        )
        .context("Failed to insert record")?;
        write_index(&tx, T::collection_name(), record.id(), &record.indexed_fields())?;
        tx.commit()?;
        Ok(())
    }

    /// Get a record by id
    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT json FROM records WHERE collection = ?1 AND id = ?2",
                params![T::collection_name(), id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read record")?;

        match json {
            Some(json) => {
                let record = serde_json::from_str(&json).context("Failed to deserialize record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Replace a record wholesale, reindexing it
    pub fn put<T: Record>(&mut self, record: &T) -> Result<()> {
        debug!(collection = T::collection_name(), id = record.id(), "put: called");
        let json = serde_json::to_string(record).context("Failed to serialize record")?;
        let tx = self.conn.transaction()?;
        let n = tx.execute(
            "UPDATE records SET json = ?3, updated_at = ?4 WHERE collection = ?1 AND id = ?2",
            params![T::collection_name(), record.id(), json, record.updated_at()],
        )?;
        if n == 0 {
            return Err(eyre::eyre!("Record not found: {}", record.id()));
        }
        write_index(&tx, T::collection_name(), record.id(), &record.indexed_fields())?;
        tx.commit()?;
        Ok(())
    }

    /// Read-modify-write a record under a transaction
    ///
    /// The closure sees the current document and may mutate it freely. The
    /// reindex and document write commit together. Returns the record as
    /// written, or None if the id does not exist.
    pub fn mutate<T, F>(&mut self, id: &str, f: F) -> Result<Option<T>>
    where
        T: Record,
        F: FnOnce(&mut T),
    {
        debug!(collection = T::collection_name(), %id, "mutate: called");
        let tx = self.conn.transaction()?;
        let json: Option<String> = tx
            .query_row(
                "SELECT json FROM records WHERE collection = ?1 AND id = ?2",
                params![T::collection_name(), id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(json) = json else {
            return Ok(None);
        };

        let mut record: T = serde_json::from_str(&json).context("Failed to deserialize record")?;
        f(&mut record);

        let json = serde_json::to_string(&record).context("Failed to serialize record")?;
        tx.execute(
            "UPDATE records SET json = ?3, updated_at = ?4 WHERE collection = ?1 AND id = ?2",
            params![T::collection_name(), id, json, record.updated_at()],
        )?;
        write_index(&tx, T::collection_name(), id, &record.indexed_fields())?;
        tx.commit()?;
        Ok(Some(record))
    }

    /// Compare-and-set update
    ///
    /// Applies the closure only if the guard field currently holds the
    /// expected value. The check, mutation, and reindex happen inside one
    /// transaction, so a losing writer observes the winner's value in
    /// `Conflict::actual`.
    pub fn compare_and_update<T, F>(
        &mut self,
        id: &str,
        guard_field: &str,
        expected: &IndexValue,
        f: F,
    ) -> Result<CasOutcome>
    where
        T: Record,
        F: FnOnce(&mut T),
    {
        debug!(
            collection = T::collection_name(),
            %id,
            guard_field,
            expected = %expected.as_text(),
            "compare_and_update: called"
        );
        let tx = self.conn.transaction()?;
        let json: Option<String> = tx
            .query_row(
                "SELECT json FROM records WHERE collection = ?1 AND id = ?2",
                params![T::collection_name(), id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(json) = json else {
            return Ok(CasOutcome::Conflict { actual: None });
        };

        let mut record: T = serde_json::from_str(&json).context("Failed to deserialize record")?;
        let actual = record.indexed_fields().get(guard_field).map(|v| v.as_text());
        if actual.as_deref() != Some(expected.as_text().as_str()) {
            debug!(?actual, "compare_and_update: guard mismatch");
            return Ok(CasOutcome::Conflict { actual });
        }

        f(&mut record);

        let json = serde_json::to_string(&record).context("Failed to serialize record")?;
        tx.execute(
            "UPDATE records SET json = ?3, updated_at = ?4 WHERE collection = ?1 AND id = ?2",
            params![T::collection_name(), id, json, record.updated_at()],
        )?;
        write_index(&tx, T::collection_name(), id, &record.indexed_fields())?;
        tx.commit()?;
        Ok(CasOutcome::Updated)
    }

    /// List records matching all filters, most recently updated first
    pub fn list<T: Record>(&self, filters: &[Filter], limit: Option<usize>) -> Result<Vec<T>> {
        let mut sql = String::from("SELECT r.json FROM records r");
        let mut args: Vec<rusqlite::types::Value> = Vec::new();

        for (i, filter) in filters.iter().enumerate() {
            let alias = format!("i{}", i);
            sql.push_str(&format!(
                " JOIN record_index {a} ON {a}.collection = r.collection AND {a}.record_id = r.id",
                a = alias
            ));
            match filter.op {
                FilterOp::Eq => {
                    sql.push_str(&format!(" AND {a}.field = ? AND {a}.value = ?", a = alias));
                    args.push(filter.field.clone().into());
                    args.push(filter.value.as_text().into());
                }
                FilterOp::Ne => {
                    sql.push_str(&format!(" AND {a}.field = ? AND {a}.value != ?", a = alias));
                    args.push(filter.field.clone().into());
                    args.push(filter.value.as_text().into());
                }
                FilterOp::Gte => {
                    sql.push_str(&format!(" AND {a}.field = ? AND {a}.value_int >= ?", a = alias));
                    args.push(filter.field.clone().into());
                    args.push(filter.value.as_int().unwrap_or(0).into());
                }
                FilterOp::Lte => {
                    sql.push_str(&format!(" AND {a}.field = ? AND {a}.value_int <= ?", a = alias));
                    args.push(filter.field.clone().into());
                    args.push(filter.value.as_int().unwrap_or(0).into());
                }
            }
        }

        sql.push_str(" WHERE r.collection = ? ORDER BY r.updated_at DESC");
        args.push(T::collection_name().to_string().into());
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list query")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), |row| row.get::<_, String>(0))
            .context("Failed to run list query")?;

        let mut out = Vec::new();
        for row in rows {
            let json = row?;
            let record = serde_json::from_str(&json).context("Failed to deserialize record")?;
            out.push(record);
        }
        Ok(out)
    }

    /// Count records matching all filters
    pub fn count<T: Record>(&self, filters: &[Filter]) -> Result<usize> {
        Ok(self.list::<T>(filters, None)?.len())
    }

    /// Delete a record by id; returns whether it existed
    pub fn delete<T: Record>(&mut self, id: &str) -> Result<bool> {
        debug!(collection = T::collection_name(), %id, "delete: called");
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM record_index WHERE collection = ?1 AND record_id = ?2",
            params![T::collection_name(), id],
        )?;
        let n = tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![T::collection_name(), id],
        )?;
        tx.commit()?;
        Ok(n > 0)
    }

    /// Delete all records in a collection; returns the number removed
    pub fn delete_all<T: Record>(&mut self) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM record_index WHERE collection = ?1",
            params![T::collection_name()],
        )?;
        let n = tx.execute("DELETE FROM records WHERE collection = ?1", params![T::collection_name()])?;
        tx.commit()?;
        info!(collection = T::collection_name(), removed = n, "Deleted all records");
        Ok(n)
    }

    /// Rebuild the index side table for every record of a type
    ///
    /// Run after opening a store that may have been written by an older
    /// schema. Returns the number of records reindexed.
    pub fn rebuild_indexes<T: Record>(&mut self) -> Result<usize> {
        let records: Vec<T> = self.list(&[], None)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM record_index WHERE collection = ?1",
            params![T::collection_name()],
        )?;
        for record in &records {
            write_index(&tx, T::collection_name(), record.id(), &record.indexed_fields())?;
        }
        tx.commit()?;
        debug!(collection = T::collection_name(), count = records.len(), "rebuild_indexes: complete");
        Ok(records.len())
    }
}

/// Replace the index rows for one record inside an open transaction
fn write_index(
    tx: &rusqlite::Transaction<'_>,
    collection: &str,
    record_id: &str,
    fields: &std::collections::HashMap<String, IndexValue>,
) -> Result<()> {
    tx.execute(
        "DELETE FROM record_index WHERE collection = ?1 AND record_id = ?2",
        params![collection, record_id],
    )?;
    for (field, value) in fields {
        tx.execute(
            "INSERT INTO record_index (collection, record_id, field, value, value_int)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![collection, record_id, field, value.as_text(), value.as_int()],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::now_ms;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestDoc {
        id: String,
        status: String,
        name: String,
        cycle: i64,
        updated_at: i64,
    }

    impl TestDoc {
        fn new(id: &str, status: &str, name: &str, cycle: i64) -> Self {
            Self {
                id: id.to_string(),
                status: status.to_string(),
                name: name.to_string(),
                cycle,
                updated_at: now_ms(),
            }
        }
    }

    impl Record for TestDoc {
        fn id(&self) -> &str {
            &self.id
        }

        fn updated_at(&self) -> i64 {
            self.updated_at
        }

        fn collection_name() -> &'static str {
            "test_docs"
        }

        fn indexed_fields(&self) -> HashMap<String, IndexValue> {
            let mut fields = HashMap::new();
            fields.insert("status".to_string(), IndexValue::String(self.status.clone()));
            fields.insert("name".to_string(), IndexValue::String(self.name.clone()));
            fields.insert("cycle".to_string(), IndexValue::Int(self.cycle));
            fields
        }
    }

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_insert_and_get() {
        let (_dir, mut store) = temp_store();
        let doc = TestDoc::new("a", "scheduled", "eod_prices", 1);
        store.insert(&doc).unwrap();

        let got: TestDoc = store.get("a").unwrap().unwrap();
        assert_eq!(got, doc);
        assert!(store.get::<TestDoc>("missing").unwrap().is_none());
    }

    #[test]
    fn test_insert_duplicate_fails() {
        let (_dir, mut store) = temp_store();
        let doc = TestDoc::new("a", "scheduled", "eod_prices", 1);
        store.insert(&doc).unwrap();
        assert!(store.insert(&doc).is_err());
    }

    #[test]
    fn test_list_by_status() {
        let (_dir, mut store) = temp_store();
        store.insert(&TestDoc::new("a", "running", "eod_prices", 1)).unwrap();
        store.insert(&TestDoc::new("b", "completed", "eod_prices", 1)).unwrap();
        store.insert(&TestDoc::new("c", "running", "tickers", 2)).unwrap();

        let running: Vec<TestDoc> = store.list(&[Filter::eq("status", "running")], None).unwrap();
        assert_eq!(running.len(), 2);

        let both: Vec<TestDoc> = store
            .list(&[Filter::eq("status", "running"), Filter::eq("name", "tickers")], None)
            .unwrap();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].id, "c");
    }

    #[test]
    fn test_list_numeric_range() {
        let (_dir, mut store) = temp_store();
        for (id, cycle) in [("a", 1), ("b", 2), ("c", 3)] {
            store.insert(&TestDoc::new(id, "completed", "x", cycle)).unwrap();
        }

        let recent: Vec<TestDoc> = store.list(&[Filter::gte("cycle", 2)], None).unwrap();
        assert_eq!(recent.len(), 2);

        let old: Vec<TestDoc> = store.list(&[Filter::lte("cycle", 1)], None).unwrap();
        assert_eq!(old.len(), 1);
        assert_eq!(old[0].id, "a");
    }

    #[test]
    fn test_list_limit_and_order() {
        let (_dir, mut store) = temp_store();
        for i in 0..5 {
            let mut doc = TestDoc::new(&format!("doc-{}", i), "completed", "x", 1);
            doc.updated_at = 1000 + i;
            store.insert(&doc).unwrap();
        }

        let top: Vec<TestDoc> = store.list(&[], Some(2)).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].id, "doc-4");
        assert_eq!(top[1].id, "doc-3");
    }

    #[test]
    fn test_mutate_reindexes() {
        let (_dir, mut store) = temp_store();
        store.insert(&TestDoc::new("a", "scheduled", "x", 1)).unwrap();

        let updated: TestDoc = store
            .mutate("a", |doc: &mut TestDoc| {
                doc.status = "running".to_string();
                doc.updated_at = now_ms();
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, "running");

        let running: Vec<TestDoc> = store.list(&[Filter::eq("status", "running")], None).unwrap();
        assert_eq!(running.len(), 1);
        let scheduled: Vec<TestDoc> = store.list(&[Filter::eq("status", "scheduled")], None).unwrap();
        assert!(scheduled.is_empty());
    }

    #[test]
    fn test_mutate_missing_returns_none() {
        let (_dir, mut store) = temp_store();
        let result = store.mutate("missing", |_doc: &mut TestDoc| {}).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_compare_and_update_success() {
        let (_dir, mut store) = temp_store();
        store.insert(&TestDoc::new("a", "scheduled", "x", 1)).unwrap();

        let outcome = store
            .compare_and_update("a", "status", &IndexValue::String("scheduled".into()), |doc: &mut TestDoc| {
                doc.status = "running".to_string();
            })
            .unwrap();
        assert!(outcome.is_updated());

        let got: TestDoc = store.get("a").unwrap().unwrap();
        assert_eq!(got.status, "running");
    }

    #[test]
    fn test_compare_and_update_conflict() {
        let (_dir, mut store) = temp_store();
        store.insert(&TestDoc::new("a", "cancelled", "x", 1)).unwrap();

        let outcome = store
            .compare_and_update("a", "status", &IndexValue::String("running".into()), |doc: &mut TestDoc| {
                doc.status = "completed".to_string();
            })
            .unwrap();
        assert_eq!(
            outcome,
            CasOutcome::Conflict {
                actual: Some("cancelled".to_string())
            }
        );

        // Loser must not have written anything
        let got: TestDoc = store.get("a").unwrap().unwrap();
        assert_eq!(got.status, "cancelled");
    }

    #[test]
    fn test_compare_and_update_missing_record() {
        let (_dir, mut store) = temp_store();
        let outcome = store
            .compare_and_update("nope", "status", &IndexValue::String("running".into()), |_doc: &mut TestDoc| {})
            .unwrap();
        assert_eq!(outcome, CasOutcome::Conflict { actual: None });
    }

    #[test]
    fn test_delete() {
        let (_dir, mut store) = temp_store();
        store.insert(&TestDoc::new("a", "completed", "x", 1)).unwrap();
        assert!(store.delete::<TestDoc>("a").unwrap());
        assert!(!store.delete::<TestDoc>("a").unwrap());
        assert!(store.get::<TestDoc>("a").unwrap().is_none());
    }

    #[test]
    fn test_delete_all() {
        let (_dir, mut store) = temp_store();
        for i in 0..3 {
            store.insert(&TestDoc::new(&format!("doc-{}", i), "completed", "x", 1)).unwrap();
        }
        assert_eq!(store.delete_all::<TestDoc>().unwrap(), 3);
        assert!(store.list::<TestDoc>(&[], None).unwrap().is_empty());
    }

    #[test]
    fn test_rebuild_indexes() {
        let (_dir, mut store) = temp_store();
        store.insert(&TestDoc::new("a", "running", "x", 1)).unwrap();
        store.insert(&TestDoc::new("b", "completed", "y", 2)).unwrap();

        let count = store.rebuild_indexes::<TestDoc>().unwrap();
        assert_eq!(count, 2);

        let running: Vec<TestDoc> = store.list(&[Filter::eq("status", "running")], None).unwrap();
        assert_eq!(running.len(), 1);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("persist.db");
        {
            let mut store = Store::open(&db).unwrap();
            store.insert(&TestDoc::new("a", "completed", "x", 1)).unwrap();
        }
        let store = Store::open(&db).unwrap();
        let got: TestDoc = store.get("a").unwrap().unwrap();
        assert_eq!(got.id, "a");
    }
}
