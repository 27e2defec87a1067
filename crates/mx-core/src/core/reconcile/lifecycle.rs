//! CAS lifecycle manager: a thin composition over the tracker and collector
//! that makes the required ordering — track new, untrack old, collect last —
//! explicit and reusable instead of re-implemented per caller.

use anyhow::Result;
use tracing::debug;

use mx_domain::{ContentManifest, ManifestId};

use crate::core::config::GcConfig;
use crate::core::store::cas::{ConsumerId, ContentAddressableStore, GcSummary};

#[derive(Clone, Debug)]
pub struct CasLifecycle {
    store: ContentAddressableStore,
    gc: GcConfig,
}

impl CasLifecycle {
    #[must_use]
    pub fn new(store: ContentAddressableStore, gc: GcConfig) -> Self {
        Self { store, gc }
    }

    #[must_use]
    pub fn store(&self) -> &ContentAddressableStore {
        &self.store
    }

    /// Record the manifest's CAS dependencies under its own id. Returns the
    /// number of distinct hashes in the reference set.
    pub fn track_manifest(&self, manifest: &ContentManifest) -> Result<usize> {
        let hashes = manifest.cas_hashes();
        if hashes.is_empty() {
            return Ok(0);
        }
        self.store
            .track(&ConsumerId::manifest(&manifest.id), &hashes)?;
        Ok(hashes.len())
    }

    /// Track the replacement before untracking the old consumer, so hashes
    /// shared by both never go unreferenced in between.
    pub fn replace_references(
        &self,
        old: &ManifestId,
        new_manifest: &ContentManifest,
    ) -> Result<()> {
        self.track_manifest(new_manifest)?;
        self.store.untrack(&ConsumerId::manifest(old))?;
        Ok(())
    }

    /// Drop the entire reference set of every listed manifest consumer.
    pub fn untrack_many(&self, ids: &[ManifestId]) -> Result<u64> {
        let mut removed = 0;
        for id in ids {
            removed += self.store.untrack(&ConsumerId::manifest(id))?;
        }
        Ok(removed)
    }

    /// Run a collection pass under the configured policy. Returns `None`
    /// when collection is disabled.
    pub fn run_garbage_collection(&self, force: bool) -> Result<Option<GcSummary>> {
        if self.gc.disabled {
            debug!("garbage collection disabled by configuration");
            return Ok(None);
        }
        self.store.collect(self.gc.grace, force).map(Some)
    }
}
