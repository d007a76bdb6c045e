//! Append-only audit log for request lifecycle transitions.
//!
//! One JSONL event per transition (creation, approval decision, execution
//! outcome), hash-chained so tampering or truncation in the middle of the
//! file is detectable offline with `verify_log`. Appends are fire-and-
//! forget from the orchestrator's point of view: an audit failure must
//! never fail the request path.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
}

/// Lifecycle stage an event records.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStage {
    RequestCreated,
    ApprovalDecision,
    ExecutionOutcome,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub timestamp: String,
    pub request_id: Uuid,
    pub agent_id: Uuid,
    pub stage: AuditStage,
    /// Request status after the transition.
    pub status: String,
    /// Free-form detail: query summary, decision reason, error text.
    pub detail: String,
    pub prev_hash: Option<String>,
    pub chain_hash: String,
}

pub struct AuditLog {
    path: PathBuf,
    last_hash: Mutex<Option<String>>,
}

impl AuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let last_hash = read_last_hash(&path)?;
        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub fn append(&self, mut event: AuditEvent) -> Result<(), AuditError> {
        let mut last = self
            .last_hash
            .lock()
            .map_err(|_| AuditError::Io("lock".into()))?;
        event.prev_hash = last.clone();
        event.chain_hash = hash_event(&event);

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AuditError::Io(e.to_string()))?;
        let line =
            serde_json::to_string(&event).map_err(|e| AuditError::Parse(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| AuditError::Io(e.to_string()))?;
        *last = Some(event.chain_hash.clone());
        Ok(())
    }
}

/// Walk the whole chain and fail on any gap or recomputed-hash mismatch.
pub fn verify_log(path: impl AsRef<Path>) -> Result<(), AuditError> {
    let file = File::open(path.as_ref()).map_err(|e| AuditError::Io(e.to_string()))?;
    let reader = BufReader::new(file);
    let mut prev: Option<String> = None;
    for line in reader.lines() {
        let line = line.map_err(|e| AuditError::Io(e.to_string()))?;
        let event: AuditEvent =
            serde_json::from_str(&line).map_err(|e| AuditError::Parse(e.to_string()))?;
        if event.prev_hash != prev {
            return Err(AuditError::Parse("hash chain mismatch".into()));
        }
        let expected = hash_event(&event);
        if event.chain_hash != expected {
            return Err(AuditError::Parse("chain hash invalid".into()));
        }
        prev = Some(event.chain_hash);
    }
    Ok(())
}

fn hash_event(event: &AuditEvent) -> String {
    let mut h = Sha256::new();
    h.update(event.event_id.to_string());
    h.update(&event.timestamp);
    h.update(event.request_id.to_string());
    h.update(event.agent_id.to_string());
    h.update(serde_json::to_string(&event.stage).unwrap_or_default());
    h.update(&event.status);
    h.update(&event.detail);
    if let Some(prev) = &event.prev_hash {
        h.update(prev);
    }
    format!("{:x}", h.finalize())
}

fn read_last_hash(path: &Path) -> Result<Option<String>, AuditError> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path).map_err(|e| AuditError::Io(e.to_string()))?;
    let reader = BufReader::new(file);
    let mut last: Option<String> = None;
    for line in reader.lines() {
        let line = line.map_err(|e| AuditError::Io(e.to_string()))?;
        let event: AuditEvent =
            serde_json::from_str(&line).map_err(|e| AuditError::Parse(e.to_string()))?;
        last = Some(event.chain_hash);
    }
    Ok(last)
}
