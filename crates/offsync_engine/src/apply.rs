//! Transactional application of pulled changes.

use crate::error::StorageResult;
use crate::storage::{LocalStorage, LocalStorageExt, StorageTxn};
use offsync_protocol::{
    resolve, Conflict, ConflictResolver, PullResponse, Record, RecordId, SyncTableChangeSet,
};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Append-only log of resolved conflicts.
#[derive(Debug, Default)]
pub struct SyncLog {
    entries: Mutex<Vec<Conflict>>,
}

impl SyncLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends entries.
    pub fn extend(&self, conflicts: impl IntoIterator<Item = Conflict>) {
        self.entries.lock().extend(conflicts);
    }

    /// Returns a copy of every entry.
    pub fn entries(&self) -> Vec<Conflict> {
        self.entries.lock().clone()
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing was logged.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Outcome of one apply transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Records created locally.
    pub created: usize,
    /// Local records rewritten by a merge.
    pub updated: usize,
    /// Local records destroyed.
    pub destroyed: usize,
    /// Merges into records with unpushed changes.
    pub conflicts: usize,
    /// Tombstones released.
    pub released_tombstones: usize,
}

impl ApplyReport {
    /// Returns the number of local writes.
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.destroyed
    }
}

/// Applies pull responses to local storage.
#[derive(Default)]
pub struct ApplyEngine {
    resolver: Option<Arc<dyn ConflictResolver>>,
    log: Option<Arc<SyncLog>>,
}

impl ApplyEngine {
    /// Creates an engine with the built-in per-column merge only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Post-processes every merge with a host resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Records resolved conflicts in `log`.
    pub fn with_log(mut self, log: Arc<SyncLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Writes a pull response in one atomic transaction, cursor included.
    ///
    /// Any storage error rolls back the whole response.
    pub fn apply(
        &self,
        storage: &dyn LocalStorage,
        response: &PullResponse,
    ) -> StorageResult<ApplyReport> {
        let mut conflicts = Vec::new();
        let report = storage.transact(|txn| {
            let mut report = ApplyReport::default();
            for (table, changes) in response.changes.iter() {
                self.apply_table(txn, table, changes, &mut report, &mut conflicts)?;
            }
            txn.set_last_pulled_at(response.timestamp)?;
            Ok(report)
        })?;

        if !conflicts.is_empty() {
            info!(count = conflicts.len(), "resolved conflicts with local changes");
            if let Some(log) = &self.log {
                log.extend(conflicts);
            }
        }
        debug!(?report, timestamp = response.timestamp, "applied pull response");
        Ok(report)
    }

    fn apply_table(
        &self,
        txn: &mut dyn StorageTxn,
        table: &str,
        changes: &SyncTableChangeSet,
        report: &mut ApplyReport,
        conflicts: &mut Vec<Conflict>,
    ) -> StorageResult<()> {
        for remote in &changes.created {
            if txn.find(table, remote.id())?.is_none() && txn.is_tombstoned(table, remote.id())? {
                debug!(table, id = %remote.id(), "server resurrected a locally deleted record");
                txn.release_tombstones(table, std::slice::from_ref(remote.id()))?;
                report.released_tombstones += 1;
            }
            self.upsert(txn, table, remote, report, conflicts)?;
        }

        for remote in &changes.updated {
            if txn.find(table, remote.id())?.is_none() && txn.is_tombstoned(table, remote.id())? {
                debug!(table, id = %remote.id(), "ignoring update of a locally deleted record");
                continue;
            }
            self.upsert(txn, table, remote, report, conflicts)?;
        }

        let mut acknowledged: Vec<RecordId> = Vec::new();
        for id in &changes.deleted {
            if txn.find(table, id)?.is_some() {
                txn.destroy_permanently(table, id)?;
                report.destroyed += 1;
            }
            if txn.is_tombstoned(table, id)? {
                acknowledged.push(id.clone());
            }
        }
        if !acknowledged.is_empty() {
            txn.release_tombstones(table, &acknowledged)?;
            report.released_tombstones += acknowledged.len();
        }
        Ok(())
    }

    fn upsert(
        &self,
        txn: &mut dyn StorageTxn,
        table: &str,
        remote: &Record,
        report: &mut ApplyReport,
        conflicts: &mut Vec<Conflict>,
    ) -> StorageResult<()> {
        let Some(local) = txn.find(table, remote.id())? else {
            txn.create(table, Record::synced(remote.id().clone(), remote.fields().clone()))?;
            report.created += 1;
            return Ok(());
        };

        let merged = resolve(&local, remote);
        let merged = match &self.resolver {
            Some(resolver) => {
                let fallback = merged.clone();
                catch_unwind(AssertUnwindSafe(|| {
                    resolver.resolve(table, &local, remote, merged)
                }))
                .unwrap_or_else(|_| {
                    error!(table, id = %remote.id(), "conflict resolver panicked; keeping default merge");
                    fallback
                })
            }
            None => merged,
        };

        if local.is_pending() {
            report.conflicts += 1;
            conflicts.push(Conflict::new(table, local.clone(), remote.clone(), merged.clone()));
        }
        if merged != local {
            txn.update(table, merged)?;
            report.updated += 1;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ApplyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyEngine")
            .field("resolver", &self.resolver.is_some())
            .field("log", &self.log.is_some())
            .finish()
    }
}
