//! Hash-chain primitives: token computation and range verification.

use sha2::{Digest, Sha256};

use crate::record::AuditRecord;

/// Token preceding the very first record in a chain.
pub const GENESIS_TOKEN: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Compute the integrity token for a record given the previous token.
pub fn compute_token(previous_token: &str, record: &AuditRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous_token.as_bytes());
    hasher.update(record.canonical_payload().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A detected break in the chain.
#[derive(Debug, thiserror::Error)]
#[error("chain break at record {index} ({audit_id}): expected token {expected}, stored {stored}")]
pub struct ChainBreak {
    pub index: usize,
    pub audit_id: String,
    pub expected: String,
    pub stored: String,
}

/// Replay the chain over a contiguous range of records.
///
/// `preceding_token` is the integrity token of the record just before the
/// range ([`GENESIS_TOKEN`] when verifying from the start). Detects mutation,
/// deletion, and reordering anywhere in the range.
pub fn verify_chain(records: &[AuditRecord], preceding_token: &str) -> Result<(), ChainBreak> {
    let mut previous = preceding_token.to_string();
    for (index, record) in records.iter().enumerate() {
        let expected = compute_token(&previous, record);
        if record.integrity_token != expected {
            return Err(ChainBreak {
                index,
                audit_id: record.audit_id.clone(),
                expected,
                stored: record.integrity_token.clone(),
            });
        }
        previous = record.integrity_token.clone();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Outcome;
    use cadenza_core::trust::TrustLevel;
    use chrono::Utc;

    fn chained(n: usize) -> Vec<AuditRecord> {
        let mut records = Vec::new();
        let mut previous = GENESIS_TOKEN.to_string();
        for i in 0..n {
            let mut record = AuditRecord {
                audit_id: format!("AUDIT-{i}"),
                timestamp: Utc::now(),
                subject_id: None,
                session_id: "SESSION-1".into(),
                action: format!("action_{i}"),
                resource: None,
                outcome: Outcome::Success,
                trust_level: TrustLevel::Identified,
                sensitive_data_accessed: false,
                integrity_token: String::new(),
            };
            record.integrity_token = compute_token(&previous, &record);
            previous = record.integrity_token.clone();
            records.push(record);
        }
        records
    }

    #[test]
    fn valid_chain_verifies() {
        let records = chained(5);
        assert!(verify_chain(&records, GENESIS_TOKEN).is_ok());
    }

    #[test]
    fn any_prefix_verifies() {
        let records = chained(5);
        for n in 0..=5 {
            assert!(verify_chain(&records[..n], GENESIS_TOKEN).is_ok());
        }
    }

    #[test]
    fn mid_range_verifies_with_preceding_token() {
        let records = chained(5);
        let preceding = &records[1].integrity_token;
        assert!(verify_chain(&records[2..], preceding).is_ok());
    }

    #[test]
    fn mutated_record_detected() {
        let mut records = chained(3);
        records[1].action = "tampered".into();
        let err = verify_chain(&records, GENESIS_TOKEN).unwrap_err();
        assert_eq!(err.index, 1);
    }

    #[test]
    fn deleted_record_detected() {
        let mut records = chained(3);
        records.remove(1);
        assert!(verify_chain(&records, GENESIS_TOKEN).is_err());
    }

    #[test]
    fn reordered_records_detected() {
        let mut records = chained(3);
        records.swap(0, 1);
        assert!(verify_chain(&records, GENESIS_TOKEN).is_err());
    }

    #[test]
    fn token_covers_outcome_flip() {
        let mut records = chained(2);
        records[0].outcome = Outcome::Failure;
        assert!(verify_chain(&records, GENESIS_TOKEN).is_err());
    }
}
