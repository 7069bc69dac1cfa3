//! Trust type system for the Cadenza engine.
//!
//! Defines the progressive authentication levels, the factors that grant
//! them, and the terminal states a session can reach. Every other crate
//! depends on the ordering defined here.

use serde::{Deserialize, Serialize};

/// Progressive trust level of a session, from least to most authenticated.
///
/// Levels only ever increase within a session's lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Level 0: no identity established (anonymous placeholder, vertical-dependent).
    #[default]
    Anonymous = 0,
    /// Level 1: caller identity resolved (e.g. phone number on file).
    Identified = 1,
    /// Level 2: possession factor verified (one-time code).
    Verified = 2,
    /// Level 3: knowledge factor verified on top of possession.
    Enhanced = 3,
}

impl TrustLevel {
    /// The level directly above this one, if any.
    pub fn next(self) -> Option<TrustLevel> {
        match self {
            TrustLevel::Anonymous => Some(TrustLevel::Identified),
            TrustLevel::Identified => Some(TrustLevel::Verified),
            TrustLevel::Verified => Some(TrustLevel::Enhanced),
            TrustLevel::Enhanced => None,
        }
    }

    /// Number of step-ups separating `self` from `target` (0 if already there).
    pub fn gap_to(self, target: TrustLevel) -> u8 {
        (target as u8).saturating_sub(self as u8)
    }

    /// The factor whose verification grants this level, if any.
    pub fn granting_factor(self) -> Option<AuthFactor> {
        match self {
            TrustLevel::Anonymous => None,
            TrustLevel::Identified => Some(AuthFactor::CallerId),
            TrustLevel::Verified => Some(AuthFactor::Possession),
            TrustLevel::Enhanced => Some(AuthFactor::Knowledge),
        }
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => write!(f, "anonymous"),
            Self::Identified => write!(f, "identified"),
            Self::Verified => write!(f, "verified"),
            Self::Enhanced => write!(f, "enhanced"),
        }
    }
}

/// An authentication factor granted to a session.
///
/// Factors accumulate; none is ever revoked before termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthFactor {
    /// Caller identity resolved against the subject directory.
    CallerId,
    /// One-time code delivered out of band.
    Possession,
    /// Answer to a stored knowledge challenge.
    Knowledge,
}

/// Why a session reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Expiry passed without activity.
    TimedOut,
    /// Explicit end of conversation.
    Ended,
    /// The duplex channel to the speech model broke.
    TransportFault,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_are_ordered() {
        assert!(TrustLevel::Anonymous < TrustLevel::Identified);
        assert!(TrustLevel::Identified < TrustLevel::Verified);
        assert!(TrustLevel::Verified < TrustLevel::Enhanced);
    }

    #[test]
    fn next_walks_the_ladder() {
        assert_eq!(TrustLevel::Anonymous.next(), Some(TrustLevel::Identified));
        assert_eq!(TrustLevel::Identified.next(), Some(TrustLevel::Verified));
        assert_eq!(TrustLevel::Verified.next(), Some(TrustLevel::Enhanced));
        assert_eq!(TrustLevel::Enhanced.next(), None);
    }

    #[test]
    fn gap_counts_step_ups() {
        assert_eq!(TrustLevel::Identified.gap_to(TrustLevel::Verified), 1);
        assert_eq!(TrustLevel::Identified.gap_to(TrustLevel::Enhanced), 2);
        assert_eq!(TrustLevel::Enhanced.gap_to(TrustLevel::Identified), 0);
    }

    #[test]
    fn granting_factors() {
        assert_eq!(TrustLevel::Anonymous.granting_factor(), None);
        assert_eq!(
            TrustLevel::Verified.granting_factor(),
            Some(AuthFactor::Possession)
        );
        assert_eq!(
            TrustLevel::Enhanced.granting_factor(),
            Some(AuthFactor::Knowledge)
        );
    }

    #[test]
    fn serde_snake_case() {
        let json = serde_json::to_string(&TrustLevel::Verified).unwrap();
        assert_eq!(json, "\"verified\"");
        let level: TrustLevel = serde_json::from_str("\"enhanced\"").unwrap();
        assert_eq!(level, TrustLevel::Enhanced);
    }
}
