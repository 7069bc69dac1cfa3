//! Tamper-evident audit log.
//!
//! Every security- and data-access-relevant action appends one record. Each
//! record carries an integrity token, the SHA-256 of the previous token and
//! the record's canonical fields, forming a hash chain: any modification,
//! deletion, or reordering of historical records is detectable by replaying
//! the chain over a contiguous range.

pub mod chain;
pub mod log;
pub mod record;

pub use chain::{verify_chain, ChainBreak, GENESIS_TOKEN};
pub use log::{AuditError, AuditLog};
pub use record::{AuditDraft, AuditRecord, Outcome};
