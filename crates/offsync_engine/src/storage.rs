//! Local storage adapter.
//!
//! The engine never touches records directly. It reads through a
//! [`StorageView`] snapshot and writes through a [`StorageTxn`] that the
//! adapter commits atomically or not at all.

use crate::error::{StorageError, StorageResult};
use offsync_protocol::{Record, RecordId};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// Consistent read access to local records.
pub trait StorageView {
    /// Returns every table that holds records or tombstones.
    fn tables(&self) -> StorageResult<Vec<String>>;

    /// Looks up a record.
    fn find(&self, table: &str, id: &RecordId) -> StorageResult<Option<Record>>;

    /// Returns records whose status is `created` or `updated`.
    fn pending_records(&self, table: &str) -> StorageResult<Vec<Record>>;

    /// Returns the tombstone ledger of a table.
    fn deleted_ids(&self, table: &str) -> StorageResult<Vec<RecordId>>;

    /// Returns true if the id is in the tombstone ledger.
    fn is_tombstoned(&self, table: &str, id: &RecordId) -> StorageResult<bool>;

    /// Returns the cursor of the last applied pull.
    fn last_pulled_at(&self) -> StorageResult<Option<i64>>;
}

/// Write access inside an atomic transaction.
pub trait StorageTxn: StorageView {
    /// Inserts a record that must not exist yet.
    fn create(&mut self, table: &str, record: Record) -> StorageResult<()>;

    /// Replaces a record that must exist.
    fn update(&mut self, table: &str, record: Record) -> StorageResult<()>;

    /// Removes a record without leaving a tombstone. Missing ids are ignored.
    fn destroy_permanently(&mut self, table: &str, id: &RecordId) -> StorageResult<()>;

    /// Drops ids from the tombstone ledger.
    fn release_tombstones(&mut self, table: &str, ids: &[RecordId]) -> StorageResult<()>;

    /// Stores the pull cursor.
    fn set_last_pulled_at(&mut self, timestamp: i64) -> StorageResult<()>;
}

/// A transactional local store.
///
/// `read` must present a snapshot that concurrent writers cannot change
/// mid-callback. `write` must commit every change made by the callback
/// atomically, and discard all of them if the callback returns an error.
pub trait LocalStorage: Send + Sync {
    /// Runs `f` against a consistent snapshot.
    fn read(&self, f: &mut dyn FnMut(&dyn StorageView) -> StorageResult<()>) -> StorageResult<()>;

    /// Runs `f` inside one atomic write transaction.
    fn write(
        &self,
        f: &mut dyn FnMut(&mut dyn StorageTxn) -> StorageResult<()>,
    ) -> StorageResult<()>;
}

/// Value-returning helpers over [`LocalStorage`].
pub trait LocalStorageExt: LocalStorage {
    /// Runs `f` against a consistent snapshot and returns its result.
    fn view<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&dyn StorageView) -> StorageResult<T>,
    {
        let mut f = Some(f);
        let mut out = None;
        self.read(&mut |view: &dyn StorageView| {
            if let Some(f) = f.take() {
                out = Some(f(view)?);
            }
            Ok(())
        })?;
        out.ok_or_else(|| StorageError::Transaction("read callback never ran".into()))
    }

    /// Runs `f` in one atomic write transaction and returns its result.
    fn transact<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut dyn StorageTxn) -> StorageResult<T>,
    {
        let mut f = Some(f);
        let mut out = None;
        self.write(&mut |txn: &mut dyn StorageTxn| {
            if let Some(f) = f.take() {
                out = Some(f(txn)?);
            }
            Ok(())
        })?;
        out.ok_or_else(|| StorageError::Transaction("write callback never ran".into()))
    }
}

impl<S: LocalStorage + ?Sized> LocalStorageExt for S {}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tables: BTreeMap<String, BTreeMap<RecordId, Record>>,
    tombstones: BTreeMap<String, BTreeSet<RecordId>>,
    last_pulled_at: Option<i64>,
}

impl MemoryState {
    fn tombstone(&mut self, table: &str, id: RecordId) {
        self.tombstones
            .entry(table.to_string())
            .or_default()
            .insert(id);
    }
}

impl StorageView for MemoryState {
    fn tables(&self) -> StorageResult<Vec<String>> {
        let names: BTreeSet<&String> = self.tables.keys().chain(self.tombstones.keys()).collect();
        Ok(names.into_iter().cloned().collect())
    }

    fn find(&self, table: &str, id: &RecordId) -> StorageResult<Option<Record>> {
        Ok(self.tables.get(table).and_then(|t| t.get(id)).cloned())
    }

    fn pending_records(&self, table: &str) -> StorageResult<Vec<Record>> {
        Ok(self
            .tables
            .get(table)
            .map(|t| {
                t.values()
                    .filter(|r| r.status().is_pending_upsert())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn deleted_ids(&self, table: &str) -> StorageResult<Vec<RecordId>> {
        Ok(self
            .tombstones
            .get(table)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn is_tombstoned(&self, table: &str, id: &RecordId) -> StorageResult<bool> {
        Ok(self
            .tombstones
            .get(table)
            .is_some_and(|ids| ids.contains(id)))
    }

    fn last_pulled_at(&self) -> StorageResult<Option<i64>> {
        Ok(self.last_pulled_at)
    }
}

impl StorageTxn for MemoryState {
    fn create(&mut self, table: &str, record: Record) -> StorageResult<()> {
        let records = self.tables.entry(table.to_string()).or_default();
        if records.contains_key(record.id()) {
            return Err(StorageError::AlreadyExists {
                table: table.to_string(),
                id: record.id().to_string(),
            });
        }
        records.insert(record.id().clone(), record);
        Ok(())
    }

    fn update(&mut self, table: &str, record: Record) -> StorageResult<()> {
        match self
            .tables
            .get_mut(table)
            .and_then(|t| t.get_mut(record.id()))
        {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StorageError::NotFound {
                table: table.to_string(),
                id: record.id().to_string(),
            }),
        }
    }

    fn destroy_permanently(&mut self, table: &str, id: &RecordId) -> StorageResult<()> {
        if let Some(records) = self.tables.get_mut(table) {
            records.remove(id);
        }
        Ok(())
    }

    fn release_tombstones(&mut self, table: &str, ids: &[RecordId]) -> StorageResult<()> {
        if let Some(ledger) = self.tombstones.get_mut(table) {
            for id in ids {
                ledger.remove(id);
            }
            if ledger.is_empty() {
                self.tombstones.remove(table);
            }
        }
        Ok(())
    }

    fn set_last_pulled_at(&mut self, timestamp: i64) -> StorageResult<()> {
        self.last_pulled_at = Some(timestamp);
        Ok(())
    }
}

/// In-memory [`LocalStorage`].
///
/// Write transactions run on a private copy that replaces the committed state
/// only when the callback succeeds. Host mutations go through the same lock,
/// so they never interleave with an engine read or write.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: RwLock<MemoryState>,
    failing_reads: AtomicU32,
    failing_writes: AtomicU32,
    commits: AtomicU64,
}

impl MemoryStorage {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a record locally with status `created`.
    ///
    /// Re-creating a tombstoned id releases its tombstone.
    pub fn create(
        &self,
        table: &str,
        id: impl Into<RecordId>,
        fields: Map<String, Value>,
    ) -> StorageResult<Record> {
        let record = Record::created(id, fields);
        let mut state = self.state.write();
        state.create(table, record.clone())?;
        state.release_tombstones(table, std::slice::from_ref(record.id()))?;
        Ok(record)
    }

    /// Applies a local edit, recording each touched column in `_changed`.
    pub fn update(
        &self,
        table: &str,
        id: impl Into<RecordId>,
        changes: Map<String, Value>,
    ) -> StorageResult<Record> {
        let id = id.into();
        let mut state = self.state.write();
        let mut record = state.find(table, &id)?.ok_or_else(|| StorageError::NotFound {
            table: table.to_string(),
            id: id.to_string(),
        })?;
        for (column, value) in changes {
            record
                .set(&column, value)
                .map_err(|e| StorageError::InvalidRecord(e.to_string()))?;
        }
        state.update(table, record.clone())?;
        Ok(record)
    }

    /// Deletes a record locally and queues its id for push.
    pub fn mark_deleted(&self, table: &str, id: impl Into<RecordId>) -> StorageResult<()> {
        let id = id.into();
        let mut state = self.state.write();
        if state.find(table, &id)?.is_none() {
            return Err(StorageError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        state.destroy_permanently(table, &id)?;
        state.tombstone(table, id);
        Ok(())
    }

    /// Inserts or replaces a record exactly as given.
    pub fn seed(&self, table: &str, record: Record) {
        self.state
            .write()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(record.id().clone(), record);
    }

    /// Adds an id to the tombstone ledger.
    pub fn seed_tombstone(&self, table: &str, id: impl Into<RecordId>) {
        self.state.write().tombstone(table, id.into());
    }

    /// Looks up a record.
    pub fn get(&self, table: &str, id: impl Into<RecordId>) -> Option<Record> {
        let id = id.into();
        self.state
            .read()
            .tables
            .get(table)
            .and_then(|t| t.get(&id))
            .cloned()
    }

    /// Returns every record of a table in id order.
    pub fn records(&self, table: &str) -> Vec<Record> {
        self.state
            .read()
            .tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the tombstone ledger of a table.
    pub fn tombstones(&self, table: &str) -> Vec<RecordId> {
        self.state
            .read()
            .tombstones
            .get(table)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the stored pull cursor.
    pub fn cursor(&self) -> Option<i64> {
        self.state.read().last_pulled_at
    }

    /// Makes the next `count` engine reads fail.
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` engine write transactions fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Returns the number of committed engine write transactions.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }
}

fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl LocalStorage for MemoryStorage {
    fn read(&self, f: &mut dyn FnMut(&dyn StorageView) -> StorageResult<()>) -> StorageResult<()> {
        if take_fault(&self.failing_reads) {
            return Err(StorageError::Transaction("injected read failure".into()));
        }
        let state = self.state.read();
        f(&*state)
    }

    fn write(
        &self,
        f: &mut dyn FnMut(&mut dyn StorageTxn) -> StorageResult<()>,
    ) -> StorageResult<()> {
        if take_fault(&self.failing_writes) {
            return Err(StorageError::Transaction("injected write failure".into()));
        }
        let mut state = self.state.write();
        let mut draft = state.clone();
        match f(&mut draft) {
            Ok(()) => {
                *state = draft;
                self.commits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                debug!(error = %err, "rolling back write transaction");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_protocol::RecordStatus;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn host_create_and_update_follow_status_model() {
        let storage = MemoryStorage::new();
        storage
            .seed("tasks", Record::synced("t1", fields(json!({"name": "a"}))));

        let record = storage
            .update("tasks", "t1", fields(json!({"name": "b"})))
            .unwrap();
        assert_eq!(record.status(), RecordStatus::Updated);
        assert_eq!(record.changed(), ["name"]);

        let created = storage
            .create("tasks", "t2", fields(json!({"name": "c"})))
            .unwrap();
        assert_eq!(created.status(), RecordStatus::Created);
        assert!(storage.create("tasks", "t2", Map::new()).is_err());
    }

    #[test]
    fn reserved_columns_are_rejected() {
        let storage = MemoryStorage::new();
        storage.seed("tasks", Record::new("t1"));
        let err = storage
            .update("tasks", "t1", fields(json!({"_status": "synced"})))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord(_)));
    }

    #[test]
    fn mark_deleted_moves_record_to_ledger() {
        let storage = MemoryStorage::new();
        storage.seed("tasks", Record::new("t1"));

        storage.mark_deleted("tasks", "t1").unwrap();
        assert!(storage.get("tasks", "t1").is_none());
        assert_eq!(storage.tombstones("tasks"), vec![RecordId::from("t1")]);
        assert!(storage.mark_deleted("tasks", "t1").is_err());

        storage.create("tasks", "t1", Map::new()).unwrap();
        assert!(storage.tombstones("tasks").is_empty());
    }

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let storage = MemoryStorage::new();
        let result: StorageResult<()> = storage.transact(|txn| {
            txn.create("tasks", Record::new("t1"))?;
            txn.set_last_pulled_at(5)?;
            txn.update("tasks", Record::new("missing"))
        });

        assert!(matches!(result, Err(StorageError::NotFound { .. })));
        assert!(storage.get("tasks", "t1").is_none());
        assert_eq!(storage.cursor(), None);
        assert_eq!(storage.commit_count(), 0);
    }

    #[test]
    fn committed_transaction_is_visible() {
        let storage = MemoryStorage::new();
        storage.seed_tombstone("notes", "n1");
        storage
            .transact(|txn| {
                txn.create("tasks", Record::new("t1"))?;
                txn.release_tombstones("notes", &[RecordId::from("n1")])?;
                txn.set_last_pulled_at(9)
            })
            .unwrap();

        assert!(storage.get("tasks", "t1").is_some());
        assert!(storage.tombstones("notes").is_empty());
        assert_eq!(storage.cursor(), Some(9));
        assert_eq!(storage.commit_count(), 1);
    }

    #[test]
    fn view_reports_tables_with_only_tombstones() {
        let storage = MemoryStorage::new();
        storage.seed("tasks", Record::new("t1"));
        storage.seed_tombstone("notes", "n1");

        let tables = storage.view(|view| view.tables()).unwrap();
        assert_eq!(tables, vec!["notes".to_string(), "tasks".to_string()]);
    }

    #[test]
    fn injected_faults_are_consumed() {
        let storage = MemoryStorage::new();
        storage.fail_next_writes(1);
        storage.fail_next_reads(1);

        assert!(storage.transact(|txn| txn.set_last_pulled_at(1)).is_err());
        assert!(storage.transact(|txn| txn.set_last_pulled_at(1)).is_ok());
        assert!(storage.view(|view| view.last_pulled_at()).is_err());
        assert_eq!(storage.view(|view| view.last_pulled_at()).unwrap(), Some(1));
    }
}
