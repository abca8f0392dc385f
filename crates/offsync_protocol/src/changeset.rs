//! Changesets exchanged between client and server.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{Record, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Created, updated and deleted records of a single table.
///
/// An id appears in at most one of the three buckets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncTableChangeSet {
    /// Records created since the last sync.
    #[serde(default)]
    pub created: Vec<Record>,
    /// Records updated since the last sync.
    #[serde(default)]
    pub updated: Vec<Record>,
    /// Ids of records deleted since the last sync.
    #[serde(default)]
    pub deleted: Vec<RecordId>,
}

impl SyncTableChangeSet {
    /// Returns true if all three buckets are empty.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Returns the total number of entries across the buckets.
    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    /// Checks that no id appears more than once across the buckets.
    pub fn validate(&self, table: &str) -> ProtocolResult<()> {
        let mut seen = HashSet::with_capacity(self.len());
        let ids = self
            .created
            .iter()
            .chain(self.updated.iter())
            .map(Record::id)
            .chain(self.deleted.iter());

        for id in ids {
            if !seen.insert(id) {
                return Err(ProtocolError::DuplicateRecord {
                    table: table.to_string(),
                    id: id.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Per-table changesets, keyed by table name.
///
/// Used both for pull payloads (server to client) and push payloads
/// (client to server).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncDatabaseChangeSet(BTreeMap<String, SyncTableChangeSet>);

impl SyncDatabaseChangeSet {
    /// Creates an empty changeset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the changeset of a table, if present.
    pub fn table(&self, table: &str) -> Option<&SyncTableChangeSet> {
        self.0.get(table)
    }

    /// Returns a mutable changeset for a table, inserting an empty one if needed.
    pub fn table_mut(&mut self, table: &str) -> &mut SyncTableChangeSet {
        self.0.entry(table.to_string()).or_default()
    }

    /// Inserts the changeset of a table, replacing any previous one.
    pub fn insert(&mut self, table: impl Into<String>, changes: SyncTableChangeSet) {
        self.0.insert(table.into(), changes);
    }

    /// Iterates over tables in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SyncTableChangeSet)> {
        self.0.iter().map(|(name, changes)| (name.as_str(), changes))
    }

    /// Returns true if no table carries any change.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(SyncTableChangeSet::is_empty)
    }

    /// Returns the total number of entries across all tables.
    pub fn len(&self) -> usize {
        self.0.values().map(SyncTableChangeSet::len).sum()
    }

    /// Drops tables without changes.
    pub fn prune(&mut self) {
        self.0.retain(|_, changes| !changes.is_empty());
    }

    /// Checks bucket exclusivity for every table.
    pub fn validate(&self) -> ProtocolResult<()> {
        for (table, changes) in &self.0 {
            changes.validate(table)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, SyncTableChangeSet)> for SyncDatabaseChangeSet {
    fn from_iter<I: IntoIterator<Item = (String, SyncTableChangeSet)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
