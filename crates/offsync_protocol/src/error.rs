//! Error types for protocol payloads.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while interpreting a sync payload.
///
/// Every variant describes a payload that will not become valid by sending the
/// same request again, so the engine never retries on these.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The payload is not valid JSON or does not have the expected shape.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A record object has no string `id` column.
    #[error("record is missing a string `id`")]
    MissingId,

    /// A record object is not a JSON object.
    #[error("record must be a JSON object, got {0}")]
    NotAnObject(String),

    /// A `_status` value is not one of the known statuses.
    #[error("unknown record status `{0}`")]
    UnknownStatus(String),

    /// A `_changed` value is neither a comma-separated string nor a list of strings.
    #[error("invalid `_changed` value: {0}")]
    InvalidChanged(String),

    /// The same id appears in more than one bucket of a table changeset.
    #[error("record {id} appears in more than one bucket of table `{table}`")]
    DuplicateRecord {
        /// Table name.
        table: String,
        /// Offending record id.
        id: String,
    },

    /// A column name is reserved for the record status model.
    #[error("column `{0}` is reserved")]
    ReservedColumn(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::DuplicateRecord {
            table: "tasks".into(),
            id: "t1".into(),
        };
        assert_eq!(
            err.to_string(),
            "record t1 appears in more than one bucket of table `tasks`"
        );

        let err = ProtocolError::ReservedColumn("_status".into());
        assert!(err.to_string().contains("_status"));
    }

    #[test]
    fn json_errors_convert() {
        let err: ProtocolError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::Json(_)));
    }
}
