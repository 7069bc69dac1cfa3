//! Session record schema.
//!
//! A `Session` is the one piece of state touched from multiple concurrent
//! paths (the auth engine and every tool handler). All mutations go through
//! the store's revision-guarded conditional write; the helpers here keep the
//! paired invariants (expiry/warn recomputed together, monotonic trust)
//! in one place.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use cadenza_core::trust::{AuthFactor, TerminationReason, TrustLevel};

/// One authentication session, progressing through trust levels until
/// terminated. Never physically deleted, only marked terminated, so the
/// audit trail stays resolvable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    /// None until identification succeeds (anonymous placeholder sessions).
    pub subject_id: Option<String>,
    pub trust_level: TrustLevel,
    /// Factors granted so far. Append-only within a session's lifetime.
    pub factors: Vec<AuthFactor>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub warn_at: DateTime<Utc>,
    /// At most one step-up challenge may be outstanding at a time.
    pub pending_step_up: Option<PendingStepUp>,
    /// Consent kind → when it was recorded.
    pub consent_flags: BTreeMap<String, DateTime<Utc>>,
    pub terminated: Option<TerminationReason>,
    /// Conditional-write guard, bumped by the store on every update.
    pub revision: u64,
}

impl Session {
    /// Create a fresh session at the given level with its granting factor.
    pub fn new(
        session_id: String,
        subject_id: Option<String>,
        level: TrustLevel,
        timeout: Duration,
        warn_window: Duration,
    ) -> Self {
        let now = Utc::now();
        let factors = level.granting_factor().into_iter().collect();
        Self {
            session_id,
            subject_id,
            trust_level: level,
            factors,
            created_at: now,
            last_activity_at: now,
            expires_at: now + timeout,
            warn_at: now + timeout - warn_window,
            pending_step_up: None,
            consent_flags: BTreeMap::new(),
            terminated: None,
            revision: 0,
        }
    }

    /// Whether the session is logically absent to readers at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Extend the session: `expires_at = now + timeout`, `warn_at` recomputed
    /// with it. The two fields always move together.
    pub fn touch(&mut self, timeout: Duration, warn_window: Duration) {
        let now = Utc::now();
        self.last_activity_at = now;
        self.expires_at = now + timeout;
        self.warn_at = self.expires_at - warn_window;
    }

    /// Raise the trust level to at least `target` and grant its factor.
    /// Monotonic: a target below the current level changes nothing except
    /// factor accumulation.
    pub fn raise_to(&mut self, target: TrustLevel) {
        self.trust_level = self.trust_level.max(target);
        if let Some(factor) = target.granting_factor() {
            self.grant_factor(factor);
        }
    }

    /// Add a factor if not already present. Factors are never removed.
    pub fn grant_factor(&mut self, factor: AuthFactor) {
        if !self.factors.contains(&factor) {
            self.factors.push(factor);
        }
    }
}

/// Kind of outstanding step-up challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    /// Short numeric code delivered out of band.
    PossessionCode,
    /// Stored knowledge question.
    KnowledgeQuestion,
}

/// The single outstanding step-up challenge on a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingStepUp {
    pub kind: ChallengeKind,
    pub target_level: TrustLevel,
    /// The code itself, or the hex SHA-256 of the expected answer.
    pub expected_proof: String,
    /// Question id and prompt, for knowledge challenges.
    pub question_id: Option<String>,
    pub question_prompt: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub proof_expires_at: DateTime<Utc>,
}

impl PendingStepUp {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.proof_expires_at
    }
}
