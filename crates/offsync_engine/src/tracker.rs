//! Local change extraction.

use crate::error::StorageResult;
use crate::storage::{LocalStorage, LocalStorageExt};
use offsync_protocol::{RecordStatus, SyncDatabaseChangeSet, SyncTableChangeSet};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Reads pending local changes and settles them after a push.
pub struct ChangeTracker<'a> {
    storage: &'a dyn LocalStorage,
}

impl<'a> ChangeTracker<'a> {
    /// Creates a tracker over a storage adapter.
    pub fn new(storage: &'a dyn LocalStorage) -> Self {
        Self { storage }
    }

    /// Collects every created, updated and deleted record in one snapshot.
    ///
    /// A record that is both pending and tombstoned is reported as deleted
    /// only, so no id lands in two buckets.
    pub fn capture_local_changes(&self) -> StorageResult<SyncDatabaseChangeSet> {
        self.storage.view(|view| {
            let mut changes = SyncDatabaseChangeSet::new();
            for table in view.tables()? {
                let mut set = SyncTableChangeSet {
                    deleted: view.deleted_ids(&table)?,
                    ..Default::default()
                };
                let deleted: HashSet<_> = set.deleted.iter().cloned().collect();

                for record in view.pending_records(&table)? {
                    if deleted.contains(record.id()) {
                        warn!(table = %table, id = %record.id(), "pending record is also tombstoned; pushing the deletion");
                        continue;
                    }
                    match record.status() {
                        RecordStatus::Created => set.created.push(record),
                        RecordStatus::Updated => set.updated.push(record),
                        RecordStatus::Deleted | RecordStatus::Synced => {}
                    }
                }

                if !set.is_empty() {
                    changes.insert(table, set);
                }
            }
            debug!(changes = changes.len(), "captured local changes");
            Ok(changes)
        })
    }

    /// Marks the records of an accepted push as synced.
    ///
    /// A record edited after `pushed` was captured keeps its pending status
    /// for the next cycle. Tombstones of pushed deletions are released.
    /// Returns the number of records settled.
    pub fn mark_pushed_as_synced(&self, pushed: &SyncDatabaseChangeSet) -> StorageResult<usize> {
        self.storage.transact(|txn| {
            let mut settled = 0;
            for (table, changes) in pushed.iter() {
                for captured in changes.created.iter().chain(changes.updated.iter()) {
                    match txn.find(table, captured.id())? {
                        Some(current) if current == *captured => {
                            let mut synced = current;
                            synced.mark_synced();
                            txn.update(table, synced)?;
                            settled += 1;
                        }
                        Some(_) => {
                            debug!(table, id = %captured.id(), "record changed during push; keeping it pending");
                        }
                        None => {}
                    }
                }
                if !changes.deleted.is_empty() {
                    txn.release_tombstones(table, &changes.deleted)?;
                    settled += changes.deleted.len();
                }
            }
            Ok(settled)
        })
    }
}
