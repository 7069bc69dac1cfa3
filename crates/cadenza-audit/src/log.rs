//! The `AuditLog`: append, query, and verify.
//!
//! Appends are synchronous and serialized behind one lock, so a record is
//! durably chained before the triggering operation reports completion. The
//! log keeps records in memory for range/subject queries and optionally
//! mirrors every line to an append-only JSONL file; on reopen the chain
//! continues from the last persisted token.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::chain::{compute_token, verify_chain, ChainBreak, GENESIS_TOKEN};
use crate::record::{AuditDraft, AuditRecord};

const LOG_FILE: &str = "audit_log.jsonl";

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit sink I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt audit line {0}: {1}")]
    Corrupt(usize, String),
    #[error(transparent)]
    ChainBreak(#[from] ChainBreak),
}

struct Inner {
    last_token: String,
    records: Vec<AuditRecord>,
    file: Option<BufWriter<std::fs::File>>,
}

pub struct AuditLog {
    inner: Mutex<Inner>,
}

impl AuditLog {
    /// Purely in-memory log (tests, ephemeral deployments).
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                last_token: GENESIS_TOKEN.to_string(),
                records: Vec::new(),
                file: None,
            }),
        }
    }

    /// Open a file-backed log under `dir`, replaying any existing records so
    /// the chain continues where it left off.
    pub fn open(dir: &Path) -> Result<Self, AuditError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);
        let records = Self::load(&path)?;
        let last_token = records
            .last()
            .map(|r| r.integrity_token.clone())
            .unwrap_or_else(|| GENESIS_TOKEN.to_string());

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::info!("Audit log: {} ({} records)", path.display(), records.len());
        Ok(Self {
            inner: Mutex::new(Inner {
                last_token,
                records,
                file: Some(BufWriter::new(file)),
            }),
        })
    }

    fn load(path: &PathBuf) -> Result<Vec<AuditRecord>, AuditError> {
        let file = match fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)
                .map_err(|e| AuditError::Corrupt(i, e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Append one record: assign id and timestamp, chain the integrity token,
    /// persist, then return. The caller's operation is not complete until
    /// this returns.
    pub fn append(&self, draft: AuditDraft) -> Result<AuditRecord, AuditError> {
        let mut inner = self.inner.lock().unwrap();

        let mut record = AuditRecord {
            audit_id: format!("AUDIT-{}", uuid::Uuid::new_v4()),
            timestamp: Utc::now(),
            subject_id: draft.subject_id,
            session_id: draft.session_id,
            action: draft.action,
            resource: draft.resource,
            outcome: draft.outcome,
            trust_level: draft.trust_level,
            sensitive_data_accessed: draft.sensitive_data_accessed,
            integrity_token: String::new(),
        };
        record.integrity_token = compute_token(&inner.last_token, &record);

        if let Some(file) = inner.file.as_mut() {
            let line = serde_json::to_string(&record)
                .map_err(|e| AuditError::Corrupt(0, e.to_string()))?;
            writeln!(file, "{line}")?;
            file.flush()?;
        }

        inner.last_token = record.integrity_token.clone();
        inner.records.push(record.clone());
        Ok(record)
    }

    /// Records in a time range, optionally filtered by subject. For the
    /// downstream reporting surface; rendering is out of scope.
    pub fn query(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        subject_id: Option<&str>,
    ) -> Vec<AuditRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .filter(|r| subject_id.is_none_or(|s| r.subject_id.as_deref() == Some(s)))
            .cloned()
            .collect()
    }

    /// Replay the full chain from genesis.
    pub fn verify(&self) -> Result<(), ChainBreak> {
        let inner = self.inner.lock().unwrap();
        verify_chain(&inner.records, GENESIS_TOKEN)
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all records (cloned; the log itself stays immutable).
    pub fn records(&self) -> Vec<AuditRecord> {
        self.inner.lock().unwrap().records.clone()
    }
}
