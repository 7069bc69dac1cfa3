//! SurrealDB-backed `SessionStore` (embedded kv-mem engine).
//!
//! Sessions live in the `session` table keyed by their opaque id. The
//! conditional write is expressed as a guarded `UPDATE ... WHERE revision =
//! $expected`, so the revision check and the write are a single statement.

use async_trait::async_trait;
use surrealdb::engine::local::{Db, Mem};
use surrealdb::Surreal;

use crate::error::{StoreError, StoreResult};
use crate::schema::Session;
use crate::traits::SessionStore;

const TABLE: &str = "session";

pub struct SurrealSessionStore {
    db: Surreal<Db>,
}

impl SurrealSessionStore {
    /// Create an embedded in-memory SurrealDB store.
    pub async fn new() -> StoreResult<Self> {
        let db = Surreal::new::<Mem>(()).await?;
        db.use_ns("cadenza")
            .use_db("main")
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { db })
    }
}

#[async_trait]
impl SessionStore for SurrealSessionStore {
    async fn insert(&self, session: Session) -> StoreResult<Session> {
        if self.fetch(&session.session_id).await?.is_some() {
            return Err(StoreError::Duplicate(session.session_id));
        }
        let created: Option<Session> = self
            .db
            .create((TABLE, session.session_id.clone()))
            .content(session)
            .await?;
        created.ok_or_else(|| StoreError::Query("Failed to create session".into()))
    }

    async fn fetch(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let session: Option<Session> = self.db.select((TABLE, session_id)).await?;
        Ok(session)
    }

    async fn update(&self, mut session: Session) -> StoreResult<Session> {
        let id = session.session_id.clone();
        let expected = session.revision;
        session.revision += 1;

        let mut response = self
            .db
            .query("UPDATE type::thing($table, $id) CONTENT $data WHERE revision = $expected RETURN AFTER")
            .bind(("table", TABLE))
            .bind(("id", id.clone()))
            .bind(("data", session))
            .bind(("expected", expected))
            .await?;
        let after: Option<Session> = response
            .take(0)
            .map_err(|e| StoreError::Query(e.to_string()))?;

        match after {
            Some(updated) => Ok(updated),
            None => {
                // Guard failed: either the record is gone or another writer won.
                if self.fetch(&id).await?.is_some() {
                    Err(StoreError::RevisionConflict(id))
                } else {
                    Err(StoreError::NotFound(id))
                }
            }
        }
    }
}
