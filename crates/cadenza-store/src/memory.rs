//! In-memory `SessionStore` for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};
use crate::schema::Session;
use crate::traits::SessionStore;

pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, session: Session) -> StoreResult<Session> {
        let mut sessions = self.sessions.write().unwrap();
        if sessions.contains_key(&session.session_id) {
            return Err(StoreError::Duplicate(session.session_id));
        }
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    async fn fetch(&self, session_id: &str) -> StoreResult<Option<Session>> {
        Ok(self.sessions.read().unwrap().get(session_id).cloned())
    }

    async fn update(&self, mut session: Session) -> StoreResult<Session> {
        let mut sessions = self.sessions.write().unwrap();
        let stored = sessions
            .get(&session.session_id)
            .ok_or_else(|| StoreError::NotFound(session.session_id.clone()))?;
        if stored.revision != session.revision {
            return Err(StoreError::RevisionConflict(session.session_id));
        }
        session.revision += 1;
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(session)
    }
}
