use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use tracing::{debug, warn};

use mx_domain::{ContentManifest, ManifestId, ProfileChanges};

use crate::core::library::{ManifestPool, ProfileStore};
use crate::core::tooling::cancel::CancelToken;

use super::{CasLifecycle, ReconcileError};

/// Aggregated result of one profile fan-out.
#[derive(Clone, Debug, Default)]
pub struct BulkReconcileSummary {
    pub profiles_updated: usize,
    pub failed_profiles: usize,
    pub affected_profiles: Vec<String>,
    pub warnings: Vec<String>,
    pub cancelled: bool,
}

/// Result of a local content update.
#[derive(Clone, Debug, Default)]
pub struct LocalUpdateSummary {
    pub hashes_tracked: usize,
    pub manifest_added: bool,
    pub profile_updated: bool,
    pub affected_profiles: Vec<String>,
    pub warnings: Vec<String>,
    pub cancelled: bool,
}

/// Fans manifest-id replacements and removals out across all profiles.
///
/// Bulk operations against one profile store are mutually exclusive for the
/// entire read-modify-write span: a single gate is held from profile
/// enumeration through the last write.
pub struct ReconciliationService {
    pool: Arc<dyn ManifestPool>,
    profiles: Arc<dyn ProfileStore>,
    lifecycle: CasLifecycle,
    bulk_gate: Mutex<()>,
}

impl ReconciliationService {
    #[must_use]
    pub fn new(
        pool: Arc<dyn ManifestPool>,
        profiles: Arc<dyn ProfileStore>,
        lifecycle: CasLifecycle,
    ) -> Self {
        Self {
            pool,
            profiles,
            lifecycle,
            bulk_gate: Mutex::new(()),
        }
    }

    /// Substitute every occurrence of a mapping key — primary reference and
    /// enabled list — across all profiles.
    ///
    /// A primary rewrite first re-resolves the mapped id from the pool and
    /// skips just that rewrite (with a warning) when resolution fails; the
    /// rest of the profile is still reconciled.
    pub fn reconcile_bulk_replacement(
        &self,
        mapping: &BTreeMap<ManifestId, ManifestId>,
        cancel: &CancelToken,
    ) -> Result<BulkReconcileSummary> {
        validate_mapping(mapping)?;
        let _gate = self
            .bulk_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut summary = BulkReconcileSummary::default();
        let profiles = self.profiles.get_all_profiles()?;
        for profile in profiles {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let mut changes = ProfileChanges::default();
            if let Some(primary) = &profile.primary {
                if let Some(target) = mapping.get(primary) {
                    match self.resolve_target(target) {
                        Ok(_) => changes.primary = Some(Some(target.clone())),
                        Err(err) => {
                            warn!(
                                profile = %profile.id,
                                target = %target,
                                "skipping primary rewrite: {err}"
                            );
                            summary
                                .warnings
                                .push(format!("profile '{}': {err}", profile.id));
                        }
                    }
                }
            }

            let rewritten: Vec<ManifestId> = profile
                .enabled
                .iter()
                .map(|id| mapping.get(id).cloned().unwrap_or_else(|| id.clone()))
                .collect();
            if rewritten != profile.enabled {
                changes.enabled = Some(rewritten);
            }

            self.apply_profile_changes(&profile.id, changes, &mut summary);
        }

        debug!(
            updated = summary.profiles_updated,
            failed = summary.failed_profiles,
            "bulk manifest replacement reconciled"
        );
        Ok(summary)
    }

    /// Drop every occurrence of the listed ids across all profiles.
    pub fn reconcile_removal(
        &self,
        ids: &BTreeSet<ManifestId>,
        cancel: &CancelToken,
    ) -> Result<BulkReconcileSummary> {
        if ids.is_empty() {
            return Err(ReconcileError::Validation("removal id list is empty".into()).into());
        }
        let _gate = self
            .bulk_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut summary = BulkReconcileSummary::default();
        let profiles = self.profiles.get_all_profiles()?;
        for profile in profiles {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let mut changes = ProfileChanges::default();
            if let Some(primary) = &profile.primary {
                if ids.contains(primary) {
                    changes.primary = Some(None);
                }
            }
            let retained: Vec<ManifestId> = profile
                .enabled
                .iter()
                .filter(|id| !ids.contains(*id))
                .cloned()
                .collect();
            if retained.len() != profile.enabled.len() {
                changes.enabled = Some(retained);
            }

            self.apply_profile_changes(&profile.id, changes, &mut summary);
        }

        debug!(
            updated = summary.profiles_updated,
            failed = summary.failed_profiles,
            "manifest removal reconciled"
        );
        Ok(summary)
    }

    /// Register a locally updated manifest and repoint the one profile whose
    /// primary reference equals `old_id`.
    ///
    /// Ordering is load-bearing: tracking failure aborts before any pool or
    /// profile mutation; a manifest that fails to re-resolve after a
    /// successful add is tolerated (the content is durably stored) and only
    /// suppresses the profile rewrite. The old manifest is neither untracked
    /// nor removed — local edits are not necessarily 1:1 replacements.
    pub fn orchestrate_local_update(
        &self,
        old_id: &ManifestId,
        new_manifest: ContentManifest,
        cancel: &CancelToken,
    ) -> Result<LocalUpdateSummary> {
        let mut summary = LocalUpdateSummary {
            hashes_tracked: self.lifecycle.track_manifest(&new_manifest)?,
            ..LocalUpdateSummary::default()
        };
        let new_id = new_manifest.id.clone();
        self.pool.add_manifest(new_manifest)?;
        summary.manifest_added = true;

        let resolved = match self.pool.get_manifest(&new_id) {
            Ok(Some(manifest)) => Some(manifest),
            Ok(None) => {
                summary.warnings.push(format!(
                    "manifest '{new_id}' did not re-resolve after add; profiles left untouched"
                ));
                None
            }
            Err(err) => {
                summary.warnings.push(format!(
                    "manifest '{new_id}' failed to re-resolve after add ({err:#}); \
                     profiles left untouched"
                ));
                None
            }
        };
        let Some(resolved) = resolved else {
            return Ok(summary);
        };
        if resolved.id == *old_id {
            debug!(id = %old_id, "local update kept the manifest id; no profile rewrite");
            return Ok(summary);
        }

        let _gate = self
            .bulk_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if cancel.is_cancelled() {
            summary.cancelled = true;
            return Ok(summary);
        }
        let profiles = self.profiles.get_all_profiles()?;
        if let Some(profile) = profiles
            .into_iter()
            .find(|profile| profile.primary.as_ref() == Some(old_id))
        {
            let changes = ProfileChanges::default().set_primary(Some(resolved.id.clone()));
            match self.profiles.update_profile(&profile.id, &changes) {
                Ok(()) => {
                    summary.profile_updated = true;
                    summary.affected_profiles.push(profile.id);
                }
                Err(err) => {
                    summary
                        .warnings
                        .push(format!("profile '{}': {err:#}", profile.id));
                }
            }
        }
        Ok(summary)
    }

    fn resolve_target(&self, target: &ManifestId) -> Result<ContentManifest, ReconcileError> {
        match self.pool.get_manifest(target) {
            Ok(Some(manifest)) => Ok(manifest),
            Ok(None) => Err(ReconcileError::NotFound {
                kind: "manifest",
                id: target.to_string(),
            }),
            Err(err) => Err(ReconcileError::Validation(format!(
                "failed to resolve manifest '{target}': {err:#}"
            ))),
        }
    }

    fn apply_profile_changes(
        &self,
        profile_id: &str,
        changes: ProfileChanges,
        summary: &mut BulkReconcileSummary,
    ) {
        if changes.is_empty() {
            return;
        }
        match self.profiles.update_profile(profile_id, &changes) {
            Ok(()) => {
                summary.profiles_updated += 1;
                summary.affected_profiles.push(profile_id.to_string());
            }
            Err(err) => {
                warn!(profile = %profile_id, "profile rewrite failed: {err:#}");
                summary.failed_profiles += 1;
                summary
                    .warnings
                    .push(format!("profile '{profile_id}': {err:#}"));
            }
        }
    }
}

fn validate_mapping(mapping: &BTreeMap<ManifestId, ManifestId>) -> Result<(), ReconcileError> {
    if mapping.is_empty() {
        return Err(ReconcileError::Validation(
            "replacement mapping is empty".into(),
        ));
    }
    for (old, new) in mapping {
        if old == new {
            return Err(ReconcileError::Validation(format!(
                "identity mapping for '{old}'"
            )));
        }
        if mapping.contains_key(new) {
            return Err(ReconcileError::Validation(format!(
                "mapping is not disjoint: '{new}' is both a source and a target"
            )));
        }
    }
    Ok(())
}
