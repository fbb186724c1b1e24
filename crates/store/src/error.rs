use thiserror::Error;

/// Errors that can occur when interacting with the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The requested record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The record exists but is in a state that forbids the operation.
    #[error("Invalid state for {entity} {id}: {reason}")]
    InvalidState {
        entity: &'static str,
        id: String,
        reason: String,
    },

    /// The job was handed to another worker after this one's lease lapsed.
    #[error("Lease lost for job {id}")]
    LeaseLost { id: String },

    /// A stored value could not be decoded into its domain type.
    #[error("Corrupt {entity} record: {reason}")]
    Corrupt { entity: &'static str, reason: String },
}

/// Returns true if a database error reports an undefined table (SQLSTATE `42P01`).
pub fn is_missing_table(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "42P01")
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_entity() {
        let err = StoreError::NotFound {
            entity: "job",
            id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "job not found: abc");
    }

    #[test]
    fn row_not_found_is_not_a_missing_table() {
        assert!(!is_missing_table(&sqlx::Error::RowNotFound));
    }
}
