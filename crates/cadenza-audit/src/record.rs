use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cadenza_core::trust::TrustLevel;

/// Result of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success,
    Failure,
}

/// One immutable audit record. Never updated or deleted after append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: String,
    pub timestamp: DateTime<Utc>,
    pub subject_id: Option<String>,
    pub session_id: String,
    pub action: String,
    pub resource: Option<String>,
    pub outcome: Outcome,
    pub trust_level: TrustLevel,
    pub sensitive_data_accessed: bool,
    /// The chain link: `sha256(previous_token || canonical fields)`.
    pub integrity_token: String,
}

impl AuditRecord {
    /// The canonical byte payload covered by the integrity token: every field
    /// except the token itself, serialized in declaration order.
    pub fn canonical_payload(&self) -> String {
        #[derive(Serialize)]
        struct Canonical<'a> {
            audit_id: &'a str,
            timestamp: &'a DateTime<Utc>,
            subject_id: &'a Option<String>,
            session_id: &'a str,
            action: &'a str,
            resource: &'a Option<String>,
            outcome: &'a Outcome,
            trust_level: &'a TrustLevel,
            sensitive_data_accessed: bool,
        }
        // Struct serialization is infallible for these field types.
        serde_json::to_string(&Canonical {
            audit_id: &self.audit_id,
            timestamp: &self.timestamp,
            subject_id: &self.subject_id,
            session_id: &self.session_id,
            action: &self.action,
            resource: &self.resource,
            outcome: &self.outcome,
            trust_level: &self.trust_level,
            sensitive_data_accessed: self.sensitive_data_accessed,
        })
        .unwrap_or_default()
    }
}

/// Fields the caller supplies; id, timestamp, and token are assigned by the
/// log at append time.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub session_id: String,
    pub action: String,
    pub outcome: Outcome,
    pub trust_level: TrustLevel,
    pub subject_id: Option<String>,
    pub resource: Option<String>,
    pub sensitive_data_accessed: bool,
}

impl AuditDraft {
    pub fn new(
        session_id: impl Into<String>,
        action: impl Into<String>,
        outcome: Outcome,
        trust_level: TrustLevel,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            action: action.into(),
            outcome,
            trust_level,
            subject_id: None,
            resource: None,
            sensitive_data_accessed: false,
        }
    }

    pub fn subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive_data_accessed = true;
        self
    }
}
