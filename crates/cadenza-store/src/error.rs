use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    Duplicate(String),

    /// Conditional write lost: the stored revision no longer matches the one
    /// the caller read. Refetch and reapply.
    #[error("Revision conflict on session {0}")]
    RevisionConflict(String),

    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("SurrealDB error: {0}")]
    Surreal(#[from] surrealdb::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
