//! Event and audit plumbing. Best-effort by contract: nothing here may block
//! or fail a workflow.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::debug;

use super::WorkflowKind;

/// Lifecycle notifications emitted around every orchestrator invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ReconcileEvent {
    WorkflowStarted {
        operation_id: String,
        kind: WorkflowKind,
        source: String,
    },
    WorkflowCompleted {
        operation_id: String,
        kind: WorkflowKind,
        success: bool,
        duration_ms: u64,
    },
}

/// Receiver for start/completed events.
pub trait EventSink: Send + Sync {
    /// Must never block or fail the workflow.
    fn emit(&self, event: &ReconcileEvent);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &ReconcileEvent) {}
}

/// Forwards events to the tracing subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &ReconcileEvent) {
        match event {
            ReconcileEvent::WorkflowStarted {
                operation_id,
                kind,
                source,
            } => debug!(%operation_id, kind = kind.as_str(), %source, "workflow started"),
            ReconcileEvent::WorkflowCompleted {
                operation_id,
                kind,
                success,
                duration_ms,
            } => debug!(
                %operation_id,
                kind = kind.as_str(),
                success,
                duration_ms,
                "workflow completed"
            ),
        }
    }
}

/// Append-only record of one orchestrator invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationAuditEntry {
    pub operation_id: String,
    pub operation: String,
    /// RFC 3339.
    pub timestamp: String,
    pub profile_ids: Vec<String>,
    pub manifest_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mapping: BTreeMap<String, String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

pub(crate) fn rfc3339_now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// JSONL audit log.
#[derive(Clone, Debug)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &ReconciliationAuditEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create audit log directory {}", parent.display())
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        let line = serde_json::to_string(entry)?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to audit log {}", self.path.display()))?;
        Ok(())
    }

    /// Read every entry, skipping lines that no longer parse.
    pub fn read_all(&self) -> Result<Vec<ReconciliationAuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path)
            .with_context(|| format!("failed to open audit log {}", self.path.display()))?;
        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(err) => debug!(%err, "skipping unparseable audit line"),
            }
        }
        Ok(entries)
    }
}
