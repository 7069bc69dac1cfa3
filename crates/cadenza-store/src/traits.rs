use async_trait::async_trait;

use crate::error::StoreResult;
use crate::schema::Session;

/// Single-key session persistence.
///
/// Uses `async-trait` for object safety (`dyn SessionStore`). Expiry policy
/// deliberately does NOT live here: `fetch` returns the raw record, expired
/// or not, and the auth engine decides what readers may observe. No
/// multi-record transactions anywhere.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Fails on duplicate id.
    async fn insert(&self, session: Session) -> StoreResult<Session>;

    /// Raw single-key read, including expired and terminated records.
    async fn fetch(&self, session_id: &str) -> StoreResult<Option<Session>>;

    /// Single-record conditional write: succeeds iff the stored revision
    /// equals `session.revision`, and bumps it. On mismatch returns
    /// `StoreError::RevisionConflict`; callers refetch and reapply. The only
    /// contended mutation (extending expiry) is commutative, so retries are
    /// always safe.
    async fn update(&self, session: Session) -> StoreResult<Session>;
}
