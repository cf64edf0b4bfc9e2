use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForkDbError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Transaction conflict (retry the unit of work): {0}")]
    Conflict(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),
}

impl ForkDbError {
    /// Not-found constructor used by the `-or-throw` resolvers.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        ForkDbError::NotFound { kind, id: id.into() }
    }
}

/// Serialization failures (SQLITE_BUSY / SQLITE_LOCKED) surface as
/// `Conflict` so callers can retry the whole unit of work; everything
/// else stays a plain SQLite error.
impl From<rusqlite::Error> for ForkDbError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        if let rusqlite::Error::SqliteFailure(e, ref msg) = err {
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) {
                return ForkDbError::Conflict(
                    msg.clone().unwrap_or_else(|| "database is busy".into()),
                );
            }
        }
        ForkDbError::Sqlite(err)
    }
}

pub type Result<T> = std::result::Result<T, ForkDbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_conflict() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY as i32),
            Some("database is locked".into()),
        );
        assert!(matches!(ForkDbError::from(busy), ForkDbError::Conflict(_)));
    }

    #[test]
    fn other_sqlite_errors_pass_through() {
        let err = rusqlite::Error::InvalidQuery;
        assert!(matches!(ForkDbError::from(err), ForkDbError::Sqlite(_)));
    }
}
