use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, warn};

use mx_domain::{ContentManifest, ManifestId};

use crate::core::library::ManifestPool;
use crate::core::tooling::cancel::CancelToken;

use super::audit::{rfc3339_now, AuditLog, EventSink, ReconcileEvent, ReconciliationAuditEntry};
use super::service::{BulkReconcileSummary, LocalUpdateSummary};
use super::{CasLifecycle, ReconcileError, ReconciliationService, WorkflowKind, WorkflowStatus};

static OPERATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Inputs to the replacement workflow.
#[derive(Clone, Debug)]
pub struct ReplaceRequest {
    pub mapping: BTreeMap<ManifestId, ManifestId>,
    pub remove_old: bool,
    pub run_gc: bool,
    /// Free-form origin tag for events ("cli", "publisher-sync", ...).
    pub source: String,
}

/// Aggregated result of one orchestrator invocation.
#[derive(Clone, Debug)]
pub struct WorkflowOutcome {
    pub operation_id: String,
    pub kind: WorkflowKind,
    pub status: WorkflowStatus,
    pub profiles_updated: usize,
    pub failed_profiles: usize,
    pub affected_profiles: Vec<String>,
    pub references_untracked: u64,
    pub manifests_removed: usize,
    pub objects_reclaimed: usize,
    pub bytes_reclaimed: u64,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

impl WorkflowOutcome {
    fn new(kind: WorkflowKind, operation_id: String) -> Self {
        Self {
            operation_id,
            kind,
            status: WorkflowStatus::Completed,
            profiles_updated: 0,
            failed_profiles: 0,
            affected_profiles: Vec::new(),
            references_untracked: 0,
            manifests_removed: 0,
            objects_reclaimed: 0,
            bytes_reclaimed: 0,
            warnings: Vec::new(),
            duration_ms: 0,
        }
    }

    fn absorb_bulk(&mut self, summary: BulkReconcileSummary) {
        self.profiles_updated += summary.profiles_updated;
        self.failed_profiles += summary.failed_profiles;
        self.affected_profiles.extend(summary.affected_profiles);
        self.warnings.extend(summary.warnings);
        if summary.cancelled {
            self.status = WorkflowStatus::Cancelled;
        }
    }

    fn absorb_local_update(&mut self, summary: LocalUpdateSummary) {
        self.profiles_updated += usize::from(summary.profile_updated);
        self.affected_profiles.extend(summary.affected_profiles);
        self.warnings.extend(summary.warnings);
        if summary.cancelled {
            self.status = WorkflowStatus::Cancelled;
        }
    }
}

/// Ordered, named workflow steps. The list is fixed per workflow; each
/// executed step decides whether the rest may run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkflowStep {
    RewriteProfiles,
    UntrackConsumers,
    RemoveManifests,
    CollectGarbage,
}

impl WorkflowStep {
    fn as_str(self) -> &'static str {
        match self {
            Self::RewriteProfiles => "rewrite-profiles",
            Self::UntrackConsumers => "untrack-consumers",
            Self::RemoveManifests => "remove-manifests",
            Self::CollectGarbage => "collect-garbage",
        }
    }
}

enum StepFlow {
    Continue,
    Halt,
}

/// Top-level entry point for content reconciliation.
///
/// Composes the reconciliation service, the CAS lifecycle manager and the
/// manifest pool into fixed-order workflows, and emits events plus an audit
/// entry for every invocation. Within one invocation, profile rewriting
/// always completes before untracking, and untracking always completes
/// before any collection pass.
pub struct ContentOrchestrator {
    service: ReconciliationService,
    lifecycle: CasLifecycle,
    pool: Arc<dyn ManifestPool>,
    events: Arc<dyn EventSink>,
    audit: AuditLog,
}

impl ContentOrchestrator {
    #[must_use]
    pub fn new(
        service: ReconciliationService,
        lifecycle: CasLifecycle,
        pool: Arc<dyn ManifestPool>,
        events: Arc<dyn EventSink>,
        audit: AuditLog,
    ) -> Self {
        Self {
            service,
            lifecycle,
            pool,
            events,
            audit,
        }
    }

    /// Replace manifests per `mapping`: rewrite profiles, untrack the old
    /// ids, optionally remove the old manifests, optionally collect.
    pub fn replace(
        &self,
        request: &ReplaceRequest,
        cancel: &CancelToken,
    ) -> Result<WorkflowOutcome> {
        let manifest_ids = request
            .mapping
            .iter()
            .flat_map(|(old, new)| [old.to_string(), new.to_string()])
            .collect();
        let mapping = request
            .mapping
            .iter()
            .map(|(old, new)| (old.to_string(), new.to_string()))
            .collect();
        self.execute(
            WorkflowKind::Replace,
            &request.source,
            manifest_ids,
            mapping,
            |orchestrator, outcome| orchestrator.run_replace_steps(request, cancel, outcome),
        )
    }

    /// Remove manifests outright: rewrite profiles to drop the ids, untrack
    /// them, remove them from the pool, collect.
    pub fn remove(&self, ids: &[ManifestId], cancel: &CancelToken) -> Result<WorkflowOutcome> {
        let id_set: BTreeSet<ManifestId> = ids.iter().cloned().collect();
        let manifest_ids = id_set.iter().map(ToString::to_string).collect();
        self.execute(
            WorkflowKind::Remove,
            "removal",
            manifest_ids,
            BTreeMap::new(),
            |orchestrator, outcome| orchestrator.run_remove_steps(&id_set, cancel, outcome),
        )
    }

    /// Register a locally updated manifest; no collection step.
    pub fn update(
        &self,
        old_id: &ManifestId,
        new_manifest: ContentManifest,
        cancel: &CancelToken,
    ) -> Result<WorkflowOutcome> {
        let manifest_ids = vec![old_id.to_string(), new_manifest.id.to_string()];
        self.execute(
            WorkflowKind::Update,
            "local-update",
            manifest_ids,
            BTreeMap::new(),
            |orchestrator, outcome| {
                let summary =
                    orchestrator
                        .service
                        .orchestrate_local_update(old_id, new_manifest, cancel)?;
                outcome.absorb_local_update(summary);
                Ok(())
            },
        )
    }

    fn execute<F>(
        &self,
        kind: WorkflowKind,
        source: &str,
        manifest_ids: Vec<String>,
        mapping: BTreeMap<String, String>,
        run: F,
    ) -> Result<WorkflowOutcome>
    where
        F: FnOnce(&Self, &mut WorkflowOutcome) -> Result<()>,
    {
        let started = Instant::now();
        let timestamp = rfc3339_now();
        let mut outcome = WorkflowOutcome::new(kind, next_operation_id(kind));
        self.events.emit(&ReconcileEvent::WorkflowStarted {
            operation_id: outcome.operation_id.clone(),
            kind,
            source: source.to_string(),
        });

        let result = run(self, &mut outcome);
        outcome.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let success = result.is_ok() && outcome.status == WorkflowStatus::Completed;
        let error = match &result {
            Ok(()) if outcome.status == WorkflowStatus::Cancelled => {
                Some(ReconcileError::Cancelled.to_string())
            }
            Ok(()) => None,
            Err(err) => Some(format!("{err:#}")),
        };
        self.events.emit(&ReconcileEvent::WorkflowCompleted {
            operation_id: outcome.operation_id.clone(),
            kind,
            success,
            duration_ms: outcome.duration_ms,
        });
        let entry = ReconciliationAuditEntry {
            operation_id: outcome.operation_id.clone(),
            operation: kind.as_str().to_string(),
            timestamp,
            profile_ids: outcome.affected_profiles.clone(),
            manifest_ids,
            mapping,
            success,
            error,
            duration_ms: outcome.duration_ms,
        };
        if let Err(err) = self.audit.append(&entry) {
            // Audit is best-effort by contract; never fail the workflow.
            warn!(%err, "failed to append reconciliation audit entry");
        }

        result.map(|()| outcome)
    }

    fn run_replace_steps(
        &self,
        request: &ReplaceRequest,
        cancel: &CancelToken,
        outcome: &mut WorkflowOutcome,
    ) -> Result<()> {
        let steps = [
            WorkflowStep::RewriteProfiles,
            WorkflowStep::UntrackConsumers,
            WorkflowStep::RemoveManifests,
            WorkflowStep::CollectGarbage,
        ];
        for step in steps {
            if cancel.is_cancelled() {
                outcome.status = WorkflowStatus::Cancelled;
                debug!(step = step.as_str(), "replace workflow cancelled");
                break;
            }
            let flow = match step {
                WorkflowStep::RewriteProfiles => {
                    let summary = self
                        .service
                        .reconcile_bulk_replacement(&request.mapping, cancel)?;
                    outcome.absorb_bulk(summary);
                    if outcome.status == WorkflowStatus::Cancelled {
                        StepFlow::Halt
                    } else {
                        StepFlow::Continue
                    }
                }
                WorkflowStep::UntrackConsumers => {
                    let old_ids: Vec<ManifestId> = request.mapping.keys().cloned().collect();
                    outcome.references_untracked += self.lifecycle.untrack_many(&old_ids)?;
                    StepFlow::Continue
                }
                WorkflowStep::RemoveManifests => {
                    if request.remove_old {
                        self.remove_from_pool(request.mapping.keys(), outcome)?;
                    } else {
                        debug!("keeping replaced manifests in the pool");
                    }
                    StepFlow::Continue
                }
                WorkflowStep::CollectGarbage => {
                    if request.run_gc {
                        self.collect_if_clean(outcome)?;
                    }
                    StepFlow::Continue
                }
            };
            if matches!(flow, StepFlow::Halt) {
                break;
            }
        }
        Ok(())
    }

    fn run_remove_steps(
        &self,
        ids: &BTreeSet<ManifestId>,
        cancel: &CancelToken,
        outcome: &mut WorkflowOutcome,
    ) -> Result<()> {
        let steps = [
            WorkflowStep::RewriteProfiles,
            WorkflowStep::UntrackConsumers,
            WorkflowStep::RemoveManifests,
            WorkflowStep::CollectGarbage,
        ];
        for step in steps {
            if cancel.is_cancelled() {
                outcome.status = WorkflowStatus::Cancelled;
                debug!(step = step.as_str(), "remove workflow cancelled");
                break;
            }
            let flow = match step {
                WorkflowStep::RewriteProfiles => {
                    let summary = self.service.reconcile_removal(ids, cancel)?;
                    outcome.absorb_bulk(summary);
                    if outcome.status == WorkflowStatus::Cancelled {
                        StepFlow::Halt
                    } else {
                        StepFlow::Continue
                    }
                }
                WorkflowStep::UntrackConsumers => {
                    let id_list: Vec<ManifestId> = ids.iter().cloned().collect();
                    outcome.references_untracked += self.lifecycle.untrack_many(&id_list)?;
                    StepFlow::Continue
                }
                WorkflowStep::RemoveManifests => {
                    self.remove_from_pool(ids.iter(), outcome)?;
                    StepFlow::Continue
                }
                WorkflowStep::CollectGarbage => {
                    self.collect_if_clean(outcome)?;
                    StepFlow::Continue
                }
            };
            if matches!(flow, StepFlow::Halt) {
                break;
            }
        }
        Ok(())
    }

    fn remove_from_pool<'a>(
        &self,
        ids: impl Iterator<Item = &'a ManifestId>,
        outcome: &mut WorkflowOutcome,
    ) -> Result<()> {
        for id in ids {
            match self.pool.remove_manifest(id) {
                Ok(true) => outcome.manifests_removed += 1,
                Ok(false) => {
                    // Scoped failure: skip just this id.
                    outcome.warnings.push(
                        ReconcileError::NotFound {
                            kind: "manifest",
                            id: id.to_string(),
                        }
                        .to_string(),
                    );
                }
                Err(err) => {
                    warn!(manifest = %id, "manifest removal failed: {err:#}");
                    outcome
                        .warnings
                        .push(format!("manifest '{id}': {err:#}"));
                }
            }
        }
        Ok(())
    }

    /// The terminal collection step is suppressed whenever any profile
    /// rewrite failed: a not-yet-updated profile may still logically depend
    /// on objects the sweep would reclaim.
    fn collect_if_clean(&self, outcome: &mut WorkflowOutcome) -> Result<()> {
        if outcome.failed_profiles > 0 {
            warn!(
                failed = outcome.failed_profiles,
                "skipping garbage collection after partial profile failure"
            );
            outcome.warnings.push(format!(
                "skipped garbage collection: {} profile rewrite(s) failed",
                outcome.failed_profiles
            ));
            return Ok(());
        }
        if let Some(summary) = self.lifecycle.run_garbage_collection(false)? {
            outcome.objects_reclaimed += summary.reclaimed;
            outcome.bytes_reclaimed += summary.reclaimed_bytes;
        }
        Ok(())
    }
}

fn next_operation_id(kind: WorkflowKind) -> String {
    let sequence = OPERATION_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!(
        "{}-{}-{sequence:04}",
        kind.as_str(),
        time::OffsetDateTime::now_utc().unix_timestamp()
    )
}
