//! Subject resolution seam.
//!
//! Each vertical owns the mapping from an identity hint (a phone number, a
//! member id) to a subject and its stored knowledge challenges. The engine
//! only ever sees hashed answers.

use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// A stored knowledge challenge. The answer is kept as a hex SHA-256 of the
/// normalized answer text, never plaintext.
#[derive(Debug, Clone)]
pub struct KnowledgeQuestion {
    pub id: String,
    pub prompt: String,
    pub answer_hash: String,
}

/// What the directory knows about a subject.
#[derive(Debug, Clone)]
pub struct SubjectProfile {
    pub subject_id: String,
    pub identity_hint: String,
    pub knowledge: Vec<KnowledgeQuestion>,
}

/// Identity resolution, implemented per vertical.
#[async_trait]
pub trait SubjectDirectory: Send + Sync {
    /// Resolve an identity hint to a subject, or None if unknown.
    async fn resolve(&self, identity_hint: &str) -> Option<SubjectProfile>;

    /// Look up a subject by id.
    async fn profile(&self, subject_id: &str) -> Option<SubjectProfile>;
}

/// Normalize and hash a knowledge answer (case- and whitespace-insensitive).
pub fn hash_answer(answer: &str) -> String {
    let normalized = answer.trim().to_lowercase();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

/// In-memory directory for tests and demos.
pub struct MemoryDirectory {
    by_hint: HashMap<String, SubjectProfile>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self {
            by_hint: HashMap::new(),
        }
    }

    pub fn with_subject(mut self, profile: SubjectProfile) -> Self {
        self.by_hint.insert(profile.identity_hint.clone(), profile);
        self
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubjectDirectory for MemoryDirectory {
    async fn resolve(&self, identity_hint: &str) -> Option<SubjectProfile> {
        self.by_hint.get(identity_hint).cloned()
    }

    async fn profile(&self, subject_id: &str) -> Option<SubjectProfile> {
        self.by_hint
            .values()
            .find(|p| p.subject_id == subject_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> SubjectProfile {
        SubjectProfile {
            subject_id: "SUBJ-1".into(),
            identity_hint: "+15550100".into(),
            knowledge: vec![KnowledgeQuestion {
                id: "first_pet".into(),
                prompt: "What was the name of your first pet?".into(),
                answer_hash: hash_answer("Rex"),
            }],
        }
    }

    #[tokio::test]
    async fn resolve_known_hint() {
        let dir = MemoryDirectory::new().with_subject(profile());
        let hit = dir.resolve("+15550100").await.unwrap();
        assert_eq!(hit.subject_id, "SUBJ-1");
        assert!(dir.resolve("+15559999").await.is_none());
    }

    #[tokio::test]
    async fn profile_by_subject_id() {
        let dir = MemoryDirectory::new().with_subject(profile());
        assert!(dir.profile("SUBJ-1").await.is_some());
        assert!(dir.profile("SUBJ-2").await.is_none());
    }

    #[test]
    fn answer_hashing_normalizes() {
        assert_eq!(hash_answer("Rex"), hash_answer("  rex "));
        assert_ne!(hash_answer("rex"), hash_answer("max"));
    }
}
