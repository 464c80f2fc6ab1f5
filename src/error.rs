use rusqlite::ErrorCode;

use crate::{path::PathError, schema::Collection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The storage engine cannot be opened in this context.
    ConnectionUnavailable(String),
    /// The connection was closed, reset, or blocked by another writer mid-operation.
    ConnectionInvalidated(String),
    UpgradeConflict(String),
    DuplicateId {
        collection: Collection,
        id: String,
    },
    NotFound {
        collection: Collection,
        id: String,
    },
    Path(PathError),
    InvalidRecord(String),
    UnknownCollection(String),
    SchemaMissing(String),
    Storage(String),
    Serialization(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionUnavailable(message) => {
                write!(f, "storage engine unavailable: {message}")
            }
            Self::ConnectionInvalidated(message) => {
                write!(f, "connection invalidated: {message}")
            }
            Self::UpgradeConflict(message) => write!(f, "schema upgrade conflict: {message}"),
            Self::DuplicateId { collection, id } => {
                write!(f, "record `{id}` already exists in `{collection}`")
            }
            Self::NotFound { collection, id } => {
                write!(f, "record `{id}` was not found in `{collection}`")
            }
            Self::Path(err) => write!(f, "{err}"),
            Self::InvalidRecord(message)
            | Self::Storage(message)
            | Self::Serialization(message)
            | Self::SchemaMissing(message) => f.write_str(message),
            Self::UnknownCollection(name) => write!(f, "unknown collection `{name}`"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<PathError> for StoreError {
    fn from(value: PathError) -> Self {
        Self::Path(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(format!("json: {value}"))
    }
}

impl StoreError {
    /// Errors that only a rebuilt schema can cure. Lock contention and
    /// superseded handles are not structural.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::SchemaMissing(_))
    }

    pub(crate) fn from_sqlite(context: &str, err: rusqlite::Error) -> Self {
        let message = format!("{context}: {err}");
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Self::ConnectionInvalidated(message)
            }
            Some(
                ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::PermissionDenied
                | ErrorCode::ReadOnly,
            ) => Self::ConnectionUnavailable(message),
            _ if err.to_string().contains("no such table") => Self::SchemaMissing(message),
            _ => Self::Storage(message),
        }
    }

    pub(crate) fn join(context: &str, err: tokio::task::JoinError) -> Self {
        Self::Storage(format!("join {context} task failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use rusqlite::Connection;

    use super::StoreError;
    use crate::schema::Collection;

    #[test]
    fn missing_table_is_structural() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn
            .execute("DELETE FROM \"nudges\"", [])
            .map_err(|err| StoreError::from_sqlite("clear nudges", err))
            .unwrap_err();

        assert!(matches!(err, StoreError::SchemaMissing(_)), "{err:?}");
        assert!(err.is_structural());
    }

    #[test]
    fn duplicate_id_message_names_record_and_collection() {
        let err = StoreError::DuplicateId {
            collection: Collection::Users,
            id: "1".to_owned(),
        };
        assert_eq!(err.to_string(), "record `1` already exists in `users`");
        assert!(!err.is_structural());
    }

    #[test]
    fn lock_contention_is_not_structural() {
        let err = StoreError::from_sqlite(
            "insert record",
            rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                Some("database is locked".to_owned()),
            ),
        );

        assert!(matches!(err, StoreError::ConnectionInvalidated(_)), "{err:?}");
        assert!(!err.is_structural());
    }
}
