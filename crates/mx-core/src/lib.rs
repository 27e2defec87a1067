#![deny(clippy::all, warnings)]

mod core;

pub use crate::core::config::{Config, GcConfig};
pub use crate::core::library::{FileLibrary, ManifestPool, MemoryLibrary, ProfileStore};
pub use crate::core::reconcile::{
    AuditLog, BulkReconcileSummary, CasLifecycle, ContentOrchestrator, EventSink,
    LocalUpdateSummary, NullSink, ReconcileError, ReconcileEvent, ReconciliationAuditEntry,
    ReconciliationService, ReplaceRequest, TracingSink, WorkflowKind, WorkflowOutcome,
    WorkflowStatus,
};
pub use crate::core::store::cas::{
    ConsumerId, ConsumerKind, ConsumerRefs, ContentAddressableStore, GcSummary, LedgerAudit,
    ObjectInfo, StoreError, StoredObject,
};
pub use crate::core::tooling::cancel::CancelToken;
pub use crate::core::tooling::diagnostics;
pub use crate::core::workspace::{
    load_workspace_info, plan_workspace_delta, save_workspace_info, DeltaKind, WorkspaceDelta,
};
