//! Engine-wide error taxonomy.
//!
//! The first five variants are expected conversational outcomes: they are
//! surfaced to the speech model as structured results and never tear down a
//! session. `TransportFault` is fatal to the owning stream session only;
//! `HandlerFault` is caught at the dispatcher boundary.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Session or resource absent, or logically expired for readers.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Insufficient trust level for the requested operation.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Wrong one-time code or knowledge answer.
    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    /// A time-bounded artifact (session, code, challenge) lapsed.
    #[error("Expired: {0}")]
    Expired(String),

    /// Step-up requested while a different one is already pending.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The duplex channel to the speech model broke.
    #[error("Transport fault: {0}")]
    TransportFault(String),

    /// A business tool raised an unexpected fault.
    #[error("Handler fault: {0}")]
    HandlerFault(String),
}

impl EngineError {
    /// Machine-readable code relayed to the conversation layer so the model
    /// can self-correct (e.g. automatically re-request a step-up).
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Unauthorized(_) => "unauthorized",
            Self::InvalidProof(_) => "invalid_proof",
            Self::Expired(_) => "expired",
            Self::Conflict(_) => "conflict",
            Self::TransportFault(_) => "transport_fault",
            Self::HandlerFault(_) => "handler_fault",
        }
    }

    /// Whether this outcome is expected in normal conversation flow
    /// (relayed to the model) rather than fatal to the stream.
    pub fn is_expected(&self) -> bool {
        !matches!(self, Self::TransportFault(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
