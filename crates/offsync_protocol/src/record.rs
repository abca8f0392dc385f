//! Record status model.
//!
//! Every locally persisted record carries two bookkeeping columns next to its
//! data:
//!
//! - `_status`: one of `created`, `updated`, `deleted`, `synced`
//! - `_changed`: the ordered, de-duplicated list of columns mutated since the
//!   record was last synced (serialized as a comma-separated string)
//!
//! A `synced` record always has an empty `_changed` list.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Name of the id column.
pub const ID_COLUMN: &str = "id";
/// Name of the status column.
pub const STATUS_COLUMN: &str = "_status";
/// Name of the changed-columns column.
pub const CHANGED_COLUMN: &str = "_changed";

/// Returns true if `column` is owned by the status model rather than by the user.
pub fn is_reserved_column(column: &str) -> bool {
    column == ID_COLUMN || column == STATUS_COLUMN || column == CHANGED_COLUMN
}

/// Identifier of a record within its table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Creates a record id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Local sync status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    /// Created locally, never pushed.
    Created,
    /// Modified locally since the last sync.
    Updated,
    /// Deleted locally, deletion not yet pushed.
    Deleted,
    /// Identical to the last known server state.
    Synced,
}

impl RecordStatus {
    /// Returns the wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Created => "created",
            RecordStatus::Updated => "updated",
            RecordStatus::Deleted => "deleted",
            RecordStatus::Synced => "synced",
        }
    }

    /// Parses a wire name.
    pub fn parse(value: &str) -> ProtocolResult<Self> {
        match value {
            "created" => Ok(RecordStatus::Created),
            "updated" => Ok(RecordStatus::Updated),
            "deleted" => Ok(RecordStatus::Deleted),
            "synced" => Ok(RecordStatus::Synced),
            other => Err(ProtocolError::UnknownStatus(other.to_string())),
        }
    }

    /// Returns true if a record with this status must be pushed as created or updated.
    pub fn is_pending_upsert(&self) -> bool {
        matches!(self, RecordStatus::Created | RecordStatus::Updated)
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record together with its sync bookkeeping.
///
/// On the wire a record is a flat JSON object: user columns next to `id`,
/// `_status` and `_changed`. Server payloads normally omit the bookkeeping
/// columns; they default to `synced` with nothing changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Record {
    id: RecordId,
    status: RecordStatus,
    changed: Vec<String>,
    fields: Map<String, Value>,
}

impl Record {
    /// Creates an empty synced record.
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            status: RecordStatus::Synced,
            changed: Vec::new(),
            fields: Map::new(),
        }
    }

    /// Creates a synced record with the given columns.
    ///
    /// Reserved columns in `fields` are dropped.
    pub fn synced(id: impl Into<RecordId>, fields: Map<String, Value>) -> Self {
        let mut record = Self::new(id);
        record.fields = strip_reserved(fields);
        record
    }

    /// Creates a record that was just created locally and never pushed.
    pub fn created(id: impl Into<RecordId>, fields: Map<String, Value>) -> Self {
        let mut record = Self::synced(id, fields);
        record.status = RecordStatus::Created;
        record
    }

    /// Builds a record from a raw JSON object, keeping `_status` and `_changed`.
    pub fn from_raw(mut raw: Map<String, Value>) -> ProtocolResult<Self> {
        let id = match raw.remove(ID_COLUMN) {
            Some(Value::String(id)) => RecordId::new(id),
            _ => return Err(ProtocolError::MissingId),
        };

        let status = match raw.remove(STATUS_COLUMN) {
            None | Some(Value::Null) => RecordStatus::Synced,
            Some(Value::String(s)) => RecordStatus::parse(&s)?,
            Some(other) => return Err(ProtocolError::UnknownStatus(other.to_string())),
        };

        let changed = match raw.remove(CHANGED_COLUMN) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(s)) => split_changed(&s),
            Some(Value::Array(items)) => {
                let mut columns = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(column) => push_unique(&mut columns, column),
                        other => return Err(ProtocolError::InvalidChanged(other.to_string())),
                    }
                }
                columns
            }
            Some(other) => return Err(ProtocolError::InvalidChanged(other.to_string())),
        };

        let mut record = Self {
            id,
            status,
            changed,
            fields: raw,
        };
        record.normalize();
        Ok(record)
    }

    /// Builds a record from a server payload, discarding any bookkeeping columns.
    pub fn from_remote(mut raw: Map<String, Value>) -> ProtocolResult<Self> {
        raw.remove(STATUS_COLUMN);
        raw.remove(CHANGED_COLUMN);
        Self::from_raw(raw)
    }

    /// Converts the record into its flat JSON representation.
    pub fn to_raw(&self) -> Map<String, Value> {
        let mut raw = self.fields.clone();
        raw.insert(ID_COLUMN.into(), Value::String(self.id.0.clone()));
        raw.insert(
            STATUS_COLUMN.into(),
            Value::String(self.status.as_str().into()),
        );
        raw.insert(CHANGED_COLUMN.into(), Value::String(self.changed.join(",")));
        raw
    }

    /// Returns the record id.
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    /// Returns the sync status.
    pub fn status(&self) -> RecordStatus {
        self.status
    }

    /// Returns the columns changed since the last sync, in mutation order.
    pub fn changed(&self) -> &[String] {
        &self.changed
    }

    /// Returns the user columns.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Returns a single user column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    /// Applies a local mutation of one column.
    ///
    /// The column is appended to `_changed` if absent and the status becomes
    /// `updated` unless the record is still `created`.
    pub fn set(&mut self, column: &str, value: Value) -> ProtocolResult<()> {
        if is_reserved_column(column) {
            return Err(ProtocolError::ReservedColumn(column.to_string()));
        }
        self.fields.insert(column.to_string(), value);
        if self.status != RecordStatus::Created {
            self.status = RecordStatus::Updated;
        }
        push_unique(&mut self.changed, column.to_string());
        Ok(())
    }

    /// Marks the record as identical to the server state.
    pub fn mark_synced(&mut self) {
        self.status = RecordStatus::Synced;
        self.changed.clear();
    }

    /// Marks the record as locally deleted.
    pub fn mark_deleted(&mut self) {
        self.status = RecordStatus::Deleted;
    }

    /// Returns true if the record has local changes that were never pushed.
    pub fn is_pending(&self) -> bool {
        self.status != RecordStatus::Synced
    }

    pub(crate) fn set_status(&mut self, status: RecordStatus) {
        self.status = status;
        self.normalize();
    }

    pub(crate) fn set_changed(&mut self, changed: Vec<String>) {
        self.changed = changed;
        self.normalize();
    }

    pub(crate) fn fields_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.fields
    }

    fn normalize(&mut self) {
        if self.status == RecordStatus::Synced {
            self.changed.clear();
        }
    }
}

impl TryFrom<Map<String, Value>> for Record {
    type Error = ProtocolError;

    fn try_from(raw: Map<String, Value>) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
    }
}

impl From<Record> for Map<String, Value> {
    fn from(record: Record) -> Self {
        record.to_raw()
    }
}

fn split_changed(value: &str) -> Vec<String> {
    let mut columns = Vec::new();
    for column in value.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        push_unique(&mut columns, column.to_string());
    }
    columns
}

fn push_unique(columns: &mut Vec<String>, column: String) {
    if !columns.contains(&column) {
        columns.push(column);
    }
}

fn strip_reserved(mut fields: Map<String, Value>) -> Map<String, Value> {
    fields.remove(ID_COLUMN);
    fields.remove(STATUS_COLUMN);
    fields.remove(CHANGED_COLUMN);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn raw_roundtrip_keeps_bookkeeping() {
        let raw = object(json!({
            "id": "t1",
            "name": "old",
            "_status": "updated",
            "_changed": "name,note"
        }));

        let record = Record::from_raw(raw).unwrap();
        assert_eq!(record.id().as_str(), "t1");
        assert_eq!(record.status(), RecordStatus::Updated);
        assert_eq!(record.changed(), ["name", "note"]);
        assert_eq!(record.get("name"), Some(&json!("old")));

        let back = record.to_raw();
        assert_eq!(back["_changed"], json!("name,note"));
        assert_eq!(back["_status"], json!("updated"));
    }

    #[test]
    fn changed_accepts_list_and_deduplicates() {
        let raw = object(json!({
            "id": "t1",
            "_status": "updated",
            "_changed": ["a", "b", "a"]
        }));
        let record = Record::from_raw(raw).unwrap();
        assert_eq!(record.changed(), ["a", "b"]);
    }

    #[test]
    fn synced_record_never_keeps_changed_columns() {
        let raw = object(json!({"id": "t1", "_status": "synced", "_changed": "name"}));
        let record = Record::from_raw(raw).unwrap();
        assert!(record.changed().is_empty());
    }

    #[test]
    fn remote_payload_cannot_define_bookkeeping() {
        let raw = object(json!({"id": "t1", "_status": "created", "_changed": "x"}));
        let record = Record::from_remote(raw).unwrap();
        assert_eq!(record.status(), RecordStatus::Synced);
        assert!(record.changed().is_empty());
    }

    #[test]
    fn missing_id_is_rejected() {
        let raw = object(json!({"name": "x"}));
        assert!(matches!(
            Record::from_raw(raw),
            Err(ProtocolError::MissingId)
        ));

        let raw = object(json!({"id": 7}));
        assert!(matches!(
            Record::from_raw(raw),
            Err(ProtocolError::MissingId)
        ));
    }

    #[test]
    fn unknown_status_is_rejected() {
        let raw = object(json!({"id": "t1", "_status": "archived"}));
        assert!(matches!(
            Record::from_raw(raw),
            Err(ProtocolError::UnknownStatus(_))
        ));
    }

    #[test]
    fn local_mutation_tracks_changed_columns() {
        let mut record = Record::synced("t1", object(json!({"name": "a", "note": "b"})));

        record.set("name", json!("x")).unwrap();
        record.set("note", json!("y")).unwrap();
        record.set("name", json!("z")).unwrap();

        assert_eq!(record.status(), RecordStatus::Updated);
        assert_eq!(record.changed(), ["name", "note"]);
        assert_eq!(record.get("name"), Some(&json!("z")));
    }

    #[test]
    fn mutation_keeps_created_status() {
        let mut record = Record::created("t1", Map::new());
        record.set("name", json!("x")).unwrap();
        assert_eq!(record.status(), RecordStatus::Created);
        assert_eq!(record.changed(), ["name"]);
    }

    #[test]
    fn reserved_columns_cannot_be_set() {
        let mut record = Record::new("t1");
        assert!(record.set("_status", json!("synced")).is_err());
        assert!(record.set("id", json!("t2")).is_err());
    }

    #[test]
    fn mark_synced_clears_changed() {
        let mut record = Record::new("t1");
        record.set("name", json!("x")).unwrap();
        record.mark_synced();
        assert_eq!(record.status(), RecordStatus::Synced);
        assert!(record.changed().is_empty());
    }

    #[test]
    fn serde_uses_flat_objects() {
        let record: Record =
            serde_json::from_value(json!({"id": "t1", "name": "n", "_status": "created"})).unwrap();
        assert_eq!(record.status(), RecordStatus::Created);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({"id": "t1", "name": "n", "_status": "created", "_changed": ""})
        );
    }
}
