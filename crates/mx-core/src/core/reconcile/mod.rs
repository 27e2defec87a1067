//! Content reconciliation: the orchestrator and its collaborators.
//!
//! Keeps three stores consistent while content is replaced, removed or
//! updated: profile metadata, the manifest pool, and the CAS reference
//! ledger. Ordering is structural — workflows are fixed lists of named
//! steps, and each step's result gates the next.

use serde::{Deserialize, Serialize};

mod audit;
mod lifecycle;
mod orchestrator;
mod service;

pub use audit::{
    AuditLog, EventSink, NullSink, ReconcileEvent, ReconciliationAuditEntry, TracingSink,
};
pub use lifecycle::CasLifecycle;
pub use orchestrator::{ContentOrchestrator, ReplaceRequest, WorkflowOutcome};
pub use service::{BulkReconcileSummary, LocalUpdateSummary, ReconciliationService};

/// Typed failures crossing the reconciliation boundary.
///
/// Partial failures are not errors: they surface as warnings plus a failed
/// count on the workflow outcome. Ledger write failures surface as
/// [`crate::core::store::cas::StoreError::TrackingFailure`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("[MX121] {kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
    #[error("[MX120] invalid reconciliation input: {0}")]
    Validation(String),
    #[error("[MX130] operation cancelled")]
    Cancelled,
}

impl ReconcileError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => crate::core::tooling::diagnostics::reconcile::NOT_FOUND,
            Self::Validation(_) => crate::core::tooling::diagnostics::reconcile::VALIDATION,
            Self::Cancelled => crate::core::tooling::diagnostics::reconcile::CANCELLED,
        }
    }
}

/// The three orchestrator workflows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowKind {
    Replace,
    Remove,
    Update,
}

impl WorkflowKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Replace => "replace",
            Self::Remove => "remove",
            Self::Update => "update",
        }
    }
}

/// Terminal state of a workflow invocation. Cancellation is an outcome, not
/// an error: completed steps stay in place and the call is re-runnable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    Completed,
    Cancelled,
}

#[cfg(test)]
mod tests;
