//! Canonical server-side dataset.

use crate::error::{ServerError, ServerResult};
use offsync_protocol::{PullResponse, Record, RecordId, SyncDatabaseChangeSet};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// A row as the server stores it.
#[derive(Debug, Clone)]
struct Row {
    fields: Map<String, Value>,
    created_at: i64,
    updated_at: i64,
    deleted: bool,
}

#[derive(Debug, Default)]
struct DatasetState {
    clock: i64,
    tables: BTreeMap<String, BTreeMap<RecordId, Row>>,
}

impl DatasetState {
    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn upsert(&mut self, table: &str, id: RecordId, fields: Map<String, Value>, now: i64) {
        let rows = self.tables.entry(table.to_string()).or_default();
        match rows.get_mut(&id) {
            Some(row) => {
                if row.deleted {
                    row.created_at = now;
                    row.deleted = false;
                }
                row.fields = fields;
                row.updated_at = now;
            }
            None => {
                rows.insert(
                    id,
                    Row {
                        fields,
                        created_at: now,
                        updated_at: now,
                        deleted: false,
                    },
                );
            }
        }
    }

    fn delete(&mut self, table: &str, id: &RecordId, now: i64) -> bool {
        match self.tables.get_mut(table).and_then(|rows| rows.get_mut(id)) {
            Some(row) if !row.deleted => {
                row.deleted = true;
                row.fields.clear();
                row.updated_at = now;
                true
            }
            _ => false,
        }
    }
}

/// In-memory canonical dataset.
///
/// Every write batch advances a logical clock; each row remembers when it
/// was created and last touched, which is enough to answer
/// "changes since `lastPulledAt`". Deleted rows are kept as markers so
/// later pulls can report them.
#[derive(Debug, Default)]
pub struct ServerDataset {
    state: RwLock<DatasetState>,
}

impl ServerDataset {
    /// Creates an empty dataset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current server timestamp.
    pub fn timestamp(&self) -> i64 {
        self.state.read().clock
    }

    /// Returns every change newer than `since`.
    ///
    /// Without a cursor, every live row is reported as created and deletions
    /// are omitted. With one, a row deleted after the cursor is reported as
    /// deleted even if it was also created after it.
    pub fn changes_since(&self, since: Option<i64>) -> PullResponse {
        let state = self.state.read();
        let mut changes = SyncDatabaseChangeSet::new();

        for (table, rows) in &state.tables {
            for (id, row) in rows {
                let is_new = since.map_or(true, |since| row.created_at > since);
                let touched = since.map_or(true, |since| row.updated_at > since);
                if !touched {
                    continue;
                }
                match (row.deleted, is_new) {
                    (true, _) if since.is_none() => {}
                    (true, _) => changes.table_mut(table).deleted.push(id.clone()),
                    (false, true) => changes
                        .table_mut(table)
                        .created
                        .push(Record::synced(id.clone(), row.fields.clone())),
                    (false, false) => changes
                        .table_mut(table)
                        .updated
                        .push(Record::synced(id.clone(), row.fields.clone())),
                }
            }
        }

        changes.prune();
        PullResponse::new(changes, state.clock)
    }

    /// Applies a pushed changeset as one batch and returns the new timestamp.
    ///
    /// Pushed created and updated records replace the stored row; the
    /// distinction between the two buckets is not enforced.
    pub fn apply_push(&self, changes: &SyncDatabaseChangeSet) -> ServerResult<i64> {
        changes.validate().map_err(ServerError::from)?;

        let mut state = self.state.write();
        if changes.is_empty() {
            return Ok(state.clock);
        }

        let now = state.tick();
        for (table, set) in changes.iter() {
            for record in set.created.iter().chain(set.updated.iter()) {
                state.upsert(table, record.id().clone(), record.fields().clone(), now);
            }
            for id in &set.deleted {
                if !state.delete(table, id, now) {
                    debug!(table, id = %id, "pushed deletion of an unknown record");
                }
            }
        }
        debug!(records = changes.len(), timestamp = now, "applied push");
        Ok(now)
    }

    /// Writes a row as if another client had pushed it.
    pub fn upsert(&self, table: &str, id: impl Into<RecordId>, fields: Map<String, Value>) -> i64 {
        let mut state = self.state.write();
        let now = state.tick();
        state.upsert(table, id.into(), fields, now);
        now
    }

    /// Deletes a row as if another client had pushed the deletion.
    pub fn delete(&self, table: &str, id: impl Into<RecordId>) -> bool {
        let mut state = self.state.write();
        let now = state.tick();
        state.delete(table, &id.into(), now)
    }

    /// Returns a live row.
    pub fn get(&self, table: &str, id: impl Into<RecordId>) -> Option<Map<String, Value>> {
        let id = id.into();
        self.state
            .read()
            .tables
            .get(table)
            .and_then(|rows| rows.get(&id))
            .filter(|row| !row.deleted)
            .map(|row| row.fields.clone())
    }

    /// Returns the number of live rows in a table.
    pub fn len(&self, table: &str) -> usize {
        self.state
            .read()
            .tables
            .get(table)
            .map_or(0, |rows| rows.values().filter(|row| !row.deleted).count())
    }

    /// Returns true if no table has a live row.
    pub fn is_empty(&self) -> bool {
        self.state
            .read()
            .tables
            .values()
            .all(|rows| rows.values().all(|row| row.deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_protocol::SyncTableChangeSet;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        records.iter().map(|r| r.id().as_str()).collect()
    }

    #[test]
    fn first_pull_returns_live_rows_as_created() {
        let dataset = ServerDataset::new();
        dataset.upsert("tasks", "a", fields(json!({"name": "a"})));
        dataset.upsert("tasks", "b", Map::new());
        dataset.delete("tasks", "b");

        let response = dataset.changes_since(None);
        let tasks = response.changes.table("tasks").unwrap();
        assert_eq!(ids(&tasks.created), vec!["a"]);
        assert!(tasks.updated.is_empty());
        assert!(tasks.deleted.is_empty());
        assert_eq!(response.timestamp, 3);
    }

    #[test]
    fn incremental_pull_splits_buckets() {
        let dataset = ServerDataset::new();
        dataset.upsert("tasks", "kept", Map::new());
        dataset.upsert("tasks", "edited", Map::new());
        dataset.upsert("tasks", "removed", Map::new());
        let cursor = dataset.timestamp();

        dataset.upsert("tasks", "edited", fields(json!({"name": "new"})));
        dataset.delete("tasks", "removed");
        dataset.upsert("tasks", "fresh", Map::new());
        dataset.upsert("tasks", "ephemeral", Map::new());
        dataset.delete("tasks", "ephemeral");

        let response = dataset.changes_since(Some(cursor));
        let tasks = response.changes.table("tasks").unwrap();
        assert_eq!(ids(&tasks.created), vec!["fresh"]);
        assert_eq!(ids(&tasks.updated), vec!["edited"]);
        assert_eq!(
            tasks.deleted,
            vec![RecordId::new("ephemeral"), RecordId::new("removed")]
        );
        assert_eq!(tasks.updated[0].get("name"), Some(&json!("new")));
    }

    #[test]
    fn pull_at_head_is_empty() {
        let dataset = ServerDataset::new();
        dataset.upsert("tasks", "a", Map::new());

        let response = dataset.changes_since(Some(dataset.timestamp()));
        assert!(response.changes.is_empty());
    }

    #[test]
    fn push_applies_one_batch() {
        let dataset = ServerDataset::new();
        dataset.upsert("tasks", "gone", Map::new());

        let mut changes = SyncDatabaseChangeSet::new();
        changes.insert(
            "tasks",
            SyncTableChangeSet {
                created: vec![Record::created("n", fields(json!({"name": "n"})))],
                updated: vec![Record::synced("u", fields(json!({"name": "u"})))],
                deleted: vec![RecordId::new("gone"), RecordId::new("never")],
            },
        );

        let timestamp = dataset.apply_push(&changes).unwrap();
        assert_eq!(timestamp, 2);
        assert_eq!(dataset.get("tasks", "n"), Some(fields(json!({"name": "n"}))));
        assert!(dataset.get("tasks", "u").is_some());
        assert!(dataset.get("tasks", "gone").is_none());
        assert_eq!(dataset.len("tasks"), 2);
    }

    #[test]
    fn empty_push_keeps_clock() {
        let dataset = ServerDataset::new();
        assert_eq!(dataset.apply_push(&SyncDatabaseChangeSet::new()).unwrap(), 0);
        assert!(dataset.is_empty());
    }

    #[test]
    fn duplicate_bucket_membership_is_rejected() {
        let dataset = ServerDataset::new();
        let mut changes = SyncDatabaseChangeSet::new();
        let table = changes.table_mut("tasks");
        table.updated.push(Record::new("x"));
        table.deleted.push(RecordId::new("x"));

        assert!(matches!(
            dataset.apply_push(&changes),
            Err(ServerError::Protocol(_))
        ));
        assert_eq!(dataset.timestamp(), 0);
    }

    #[test]
    fn recreated_row_is_reported_as_created() {
        let dataset = ServerDataset::new();
        dataset.upsert("tasks", "a", Map::new());
        dataset.delete("tasks", "a");
        let cursor = dataset.timestamp();
        dataset.upsert("tasks", "a", fields(json!({"name": "back"})));

        let response = dataset.changes_since(Some(cursor));
        let tasks = response.changes.table("tasks").unwrap();
        assert_eq!(ids(&tasks.created), vec!["a"]);
    }
}
