//! The authentication engine: session lifecycle, step-up challenges,
//! and the `authorize` gate every guarded operation passes through.
//!
//! Expiry is checked inside `get_session` so "expired = absent" holds for
//! every caller. All session mutations are read-then-conditional-write
//! against the store; the touch path retries on revision conflicts because
//! expiry extension is commutative (the larger expiry always wins).

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;

use cadenza_audit::{AuditDraft, AuditLog, Outcome};
use cadenza_core::config::{SessionConfig, StepUpConfig};
use cadenza_core::error::{EngineError, EngineResult};
use cadenza_core::trust::{TerminationReason, TrustLevel};
use cadenza_store::error::StoreError;
use cadenza_store::{ChallengeKind, PendingStepUp, Session, SessionStore};

use crate::directory::{hash_answer, SubjectDirectory};

/// Outcome of an authorization check.
///
/// `authorize` has a side effect (issuing a step-up code on a one-level
/// possession gap), so callers must not invoke it speculatively: exactly
/// one call per logical check.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Authorization {
    Authorized {
        level: TrustLevel,
    },
    InsufficientLevel {
        current: TrustLevel,
        required: TrustLevel,
        next_step: NextStep,
        guidance: String,
    },
    NoSession,
}

/// Machine-readable next step the conversation layer can relay or act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NextStep {
    /// A possession code was just issued; verify it.
    VerifyCode,
    /// Request and answer a knowledge challenge.
    AnswerChallenge,
    /// No session or gap too wide; authenticate from the start.
    Authenticate,
}

/// Descriptor of an outstanding step-up challenge. Never carries the code
/// or the expected answer.
#[derive(Debug, Clone, Serialize)]
pub struct StepUpChallenge {
    pub kind: ChallengeKind,
    pub target_level: TrustLevel,
    pub question_prompt: Option<String>,
    pub expires_at: DateTime<Utc>,
}

pub struct AuthEngine {
    store: Arc<dyn SessionStore>,
    directory: Arc<dyn SubjectDirectory>,
    audit: Arc<AuditLog>,
    session_cfg: SessionConfig,
    step_up_cfg: StepUpConfig,
}

impl AuthEngine {
    pub fn new(
        store: Arc<dyn SessionStore>,
        directory: Arc<dyn SubjectDirectory>,
        audit: Arc<AuditLog>,
        session_cfg: SessionConfig,
        step_up_cfg: StepUpConfig,
    ) -> Self {
        Self {
            store,
            directory,
            audit,
            session_cfg,
            step_up_cfg,
        }
    }

    pub fn audit_log(&self) -> Arc<AuditLog> {
        Arc::clone(&self.audit)
    }

    fn timeout(&self) -> Duration {
        Duration::minutes(self.session_cfg.timeout_minutes)
    }

    fn warn_window(&self) -> Duration {
        Duration::minutes(self.session_cfg.warn_window_minutes)
    }

    /// Create a session from an identity hint. A resolved subject starts at
    /// `Identified`; an unresolved hint fails with `NotFound` unless the
    /// vertical allows anonymous placeholder sessions.
    pub async fn create_session(&self, identity_hint: &str) -> EngineResult<Session> {
        let (subject_id, level) = match self.directory.resolve(identity_hint).await {
            Some(profile) => (Some(profile.subject_id), TrustLevel::Identified),
            None if self.session_cfg.allow_anonymous => (None, TrustLevel::Anonymous),
            None => {
                return Err(EngineError::NotFound(
                    "No subject matches the provided identity".into(),
                ))
            }
        };

        let session_id = new_session_id();
        let session = Session::new(
            session_id,
            subject_id,
            level,
            self.timeout(),
            self.warn_window(),
        );
        let session = self.store.insert(session).await.map_err(store_err)?;

        self.audit_trust_event(&session, "session_created", Outcome::Success)?;
        tracing::info!(
            session_id = %session.session_id,
            level = %session.trust_level,
            "Session created"
        );
        Ok(session)
    }

    /// Fetch a live session. Expired records are logically absent: they are
    /// lazily marked terminated and reported as `Expired`; terminated or
    /// missing records are `NotFound`.
    pub async fn get_session(&self, session_id: &str) -> EngineResult<Session> {
        let session = self
            .store
            .fetch(session_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| EngineError::NotFound(format!("Unknown session {session_id}")))?;

        if session.terminated.is_some() {
            return Err(EngineError::NotFound(format!(
                "Session {session_id} is terminated"
            )));
        }
        if session.is_expired(Utc::now()) {
            // Best effort: a concurrent writer losing this race is fine, the
            // record is already unreadable through this gate.
            let mut lapsed = session;
            lapsed.terminated = Some(TerminationReason::TimedOut);
            let _ = self.store.update(lapsed).await;
            return Err(EngineError::Expired(format!(
                "Session {session_id} expired"
            )));
        }
        Ok(session)
    }

    /// Extend the session after a successfully authorized operation.
    /// Conflict-retried: concurrent touches commute.
    pub async fn touch(&self, session_id: &str) -> EngineResult<Session> {
        loop {
            let mut session = self.get_session(session_id).await?;
            session.touch(self.timeout(), self.warn_window());
            match self.store.update(session).await {
                Ok(updated) => return Ok(updated),
                Err(StoreError::RevisionConflict(_)) => continue,
                Err(e) => return Err(store_err(e)),
            }
        }
    }

    /// Issue a step-up challenge toward `target_level`: a short possession
    /// code or a knowledge question, never both. Idempotent while a challenge
    /// for the same target is pending; a pending challenge for a different
    /// target is a `Conflict`.
    pub async fn request_step_up(
        &self,
        session_id: &str,
        target_level: TrustLevel,
    ) -> EngineResult<StepUpChallenge> {
        loop {
            let mut session = self.get_session(session_id).await?;

            if session.trust_level >= target_level {
                return Err(EngineError::Conflict(format!(
                    "Session already at {} (requested {})",
                    session.trust_level, target_level
                )));
            }

            if let Some(pending) = &session.pending_step_up {
                if !pending.is_expired(Utc::now()) {
                    if pending.target_level == target_level {
                        // Same target: hand back the outstanding challenge.
                        return Ok(challenge_descriptor(pending));
                    }
                    return Err(EngineError::Conflict(format!(
                        "A step-up toward {} is already pending",
                        pending.target_level
                    )));
                }
                // A lapsed challenge no longer blocks reissue.
            }

            let pending = self.issue_challenge(&session, target_level).await?;
            let descriptor = challenge_descriptor(&pending);
            session.pending_step_up = Some(pending);

            match self.store.update(session).await {
                Ok(updated) => {
                    self.audit_trust_event(&updated, "step_up_issued", Outcome::Success)?;
                    return Ok(descriptor);
                }
                Err(StoreError::RevisionConflict(_)) => continue,
                Err(e) => return Err(store_err(e)),
            }
        }
    }

    async fn issue_challenge(
        &self,
        session: &Session,
        target_level: TrustLevel,
    ) -> EngineResult<PendingStepUp> {
        let now = Utc::now();
        let expires = now + Duration::minutes(self.step_up_cfg.code_expiry_minutes);

        match target_level.granting_factor() {
            Some(cadenza_core::trust::AuthFactor::Possession) => {
                let code = generate_code(self.step_up_cfg.code_length);
                // Delivery is out of band (SMS/app push); the demo surface
                // logs it the way the reference deployment did.
                tracing::info!(session_id = %session.session_id, "Step-up code issued: {code}");
                Ok(PendingStepUp {
                    kind: ChallengeKind::PossessionCode,
                    target_level,
                    expected_proof: code,
                    question_id: None,
                    question_prompt: None,
                    issued_at: now,
                    proof_expires_at: expires,
                })
            }
            Some(cadenza_core::trust::AuthFactor::Knowledge) => {
                let subject_id = session.subject_id.as_deref().ok_or_else(|| {
                    EngineError::Unauthorized(
                        "Knowledge challenge requires an identified subject".into(),
                    )
                })?;
                let profile = self.directory.profile(subject_id).await.ok_or_else(|| {
                    EngineError::NotFound(format!("No profile for subject {subject_id}"))
                })?;
                let question = profile.knowledge.first().cloned().ok_or_else(|| {
                    EngineError::NotFound(format!(
                        "Subject {subject_id} has no knowledge challenges on file"
                    ))
                })?;
                Ok(PendingStepUp {
                    kind: ChallengeKind::KnowledgeQuestion,
                    target_level,
                    expected_proof: question.answer_hash,
                    question_id: Some(question.id),
                    question_prompt: Some(question.prompt),
                    issued_at: now,
                    proof_expires_at: expires,
                })
            }
            _ => Err(EngineError::Conflict(format!(
                "No step-up path to {target_level}"
            ))),
        }
    }

    /// Verify a step-up proof.
    ///
    /// Match: trust raised to `max(current, target)`, factor granted, pending
    /// cleared, success audited before return. Mismatch: level unchanged,
    /// pending retained for another attempt, failure audited. Lapsed
    /// challenge: distinct `Expired` outcome, pending cleared so a reissue
    /// can follow. No pending challenge: fails closed.
    pub async fn verify_step_up(&self, session_id: &str, proof: &str) -> EngineResult<Session> {
        loop {
            let mut session = self.get_session(session_id).await?;

            let Some(pending) = session.pending_step_up.clone() else {
                self.audit_trust_event(&session, "step_up_verify_failed", Outcome::Failure)?;
                return Err(EngineError::InvalidProof(
                    "No step-up challenge is pending".into(),
                ));
            };

            if pending.is_expired(Utc::now()) {
                session.pending_step_up = None;
                match self.store.update(session).await {
                    Ok(updated) => {
                        self.audit_trust_event(&updated, "step_up_expired", Outcome::Failure)?;
                        return Err(EngineError::Expired(
                            "Step-up challenge expired; request a new one".into(),
                        ));
                    }
                    Err(StoreError::RevisionConflict(_)) => continue,
                    Err(e) => return Err(store_err(e)),
                }
            }

            let supplied = match pending.kind {
                ChallengeKind::PossessionCode => proof.trim().to_string(),
                ChallengeKind::KnowledgeQuestion => hash_answer(proof),
            };
            if supplied != pending.expected_proof {
                self.audit_trust_event(&session, "step_up_verify_failed", Outcome::Failure)?;
                return Err(EngineError::InvalidProof(match pending.kind {
                    ChallengeKind::PossessionCode => "Incorrect code".into(),
                    ChallengeKind::KnowledgeQuestion => "Incorrect answer".into(),
                }));
            }

            session.raise_to(pending.target_level);
            session.pending_step_up = None;
            match self.store.update(session).await {
                Ok(updated) => {
                    self.audit_trust_event(&updated, "step_up_verified", Outcome::Success)?;
                    tracing::info!(
                        session_id = %updated.session_id,
                        level = %updated.trust_level,
                        "Trust level raised"
                    );
                    return Ok(updated);
                }
                Err(StoreError::RevisionConflict(_)) => continue,
                Err(e) => return Err(store_err(e)),
            }
        }
    }

    /// The authorization gate. `Authorized` also touches the session. A
    /// one-level gap reachable via a possession factor triggers
    /// `request_step_up` as a side effect and returns `VerifyCode` guidance.
    pub async fn authorize(
        &self,
        session_id: &str,
        required_level: TrustLevel,
    ) -> EngineResult<Authorization> {
        let session = match self.get_session(session_id).await {
            Ok(s) => s,
            Err(EngineError::NotFound(_)) | Err(EngineError::Expired(_)) => {
                return Ok(Authorization::NoSession)
            }
            Err(e) => return Err(e),
        };

        let current = session.trust_level;
        if current >= required_level {
            self.touch(session_id).await?;
            return Ok(Authorization::Authorized { level: current });
        }

        let (next_step, guidance) = match (
            current.gap_to(required_level),
            required_level.granting_factor(),
        ) {
            (1, Some(cadenza_core::trust::AuthFactor::Possession)) => {
                // Auto-issue the code; idempotent if one is already pending.
                self.request_step_up(session_id, required_level).await?;
                (
                    NextStep::VerifyCode,
                    "This operation requires additional verification. A code has been sent; please verify it.".to_string(),
                )
            }
            (1, Some(cadenza_core::trust::AuthFactor::Knowledge)) => (
                NextStep::AnswerChallenge,
                "This high-risk operation requires answering a security question.".to_string(),
            ),
            _ => (
                NextStep::Authenticate,
                format!(
                    "Insufficient authentication level: current {current}, required {required_level}."
                ),
            ),
        };

        self.audit_trust_event(&session, "authorize_denied", Outcome::Failure)?;
        Ok(Authorization::InsufficientLevel {
            current,
            required: required_level,
            next_step,
            guidance,
        })
    }

    /// Record a consent decision on the session. Audited before return.
    pub async fn record_consent(
        &self,
        session_id: &str,
        kind: &str,
        granted: bool,
    ) -> EngineResult<Session> {
        loop {
            let mut session = self.get_session(session_id).await?;
            if granted {
                session.consent_flags.insert(kind.to_string(), Utc::now());
            }
            match self.store.update(session).await {
                Ok(updated) => {
                    let outcome = if granted {
                        Outcome::Success
                    } else {
                        Outcome::Failure
                    };
                    let draft = AuditDraft::new(
                        updated.session_id.clone(),
                        "consent_captured",
                        outcome,
                        updated.trust_level,
                    )
                    .resource(kind.to_string());
                    let draft = match &updated.subject_id {
                        Some(id) => draft.subject(id.clone()),
                        None => draft,
                    };
                    self.audit.append(draft).map_err(audit_err)?;
                    return Ok(updated);
                }
                Err(StoreError::RevisionConflict(_)) => continue,
                Err(e) => return Err(store_err(e)),
            }
        }
    }

    /// Move a session to its terminal state. Idempotent; never deletes.
    pub async fn terminate(
        &self,
        session_id: &str,
        reason: TerminationReason,
    ) -> EngineResult<()> {
        loop {
            let Some(mut session) = self.store.fetch(session_id).await.map_err(store_err)? else {
                return Err(EngineError::NotFound(format!("Unknown session {session_id}")));
            };
            if session.terminated.is_some() {
                return Ok(());
            }
            session.terminated = Some(reason);
            match self.store.update(session).await {
                Ok(updated) => {
                    self.audit_trust_event(&updated, "session_terminated", Outcome::Success)?;
                    tracing::info!(session_id, ?reason, "Session terminated");
                    return Ok(());
                }
                Err(StoreError::RevisionConflict(_)) => continue,
                Err(e) => return Err(store_err(e)),
            }
        }
    }

    fn audit_trust_event(
        &self,
        session: &Session,
        action: &str,
        outcome: Outcome,
    ) -> EngineResult<()> {
        let draft = AuditDraft::new(
            session.session_id.clone(),
            action,
            outcome,
            session.trust_level,
        );
        let draft = match &session.subject_id {
            Some(id) => draft.subject(id.clone()),
            None => draft,
        };
        self.audit.append(draft).map_err(audit_err)?;
        Ok(())
    }
}

fn challenge_descriptor(pending: &PendingStepUp) -> StepUpChallenge {
    StepUpChallenge {
        kind: pending.kind,
        target_level: pending.target_level,
        question_prompt: pending.question_prompt.clone(),
        expires_at: pending.proof_expires_at,
    }
}

fn new_session_id() -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("SESSION-{stamp}-{}", &suffix[..8])
}

fn generate_code(length: u8) -> String {
    let mut rng = rand::rng();
    (0..length).map(|_| char::from(b'0' + rng.random_range(0..10u8))).collect()
}

fn store_err(e: StoreError) -> EngineError {
    match e {
        StoreError::NotFound(id) => EngineError::NotFound(format!("Session {id} not found")),
        StoreError::Duplicate(id) => EngineError::Conflict(format!("Session {id} already exists")),
        StoreError::RevisionConflict(id) => {
            EngineError::Conflict(format!("Concurrent update on session {id}"))
        }
        other => EngineError::HandlerFault(format!("store: {other}")),
    }
}

fn audit_err(e: cadenza_audit::AuditError) -> EngineError {
    EngineError::HandlerFault(format!("audit: {e}"))
}
