//! Reconciliation unit tests, split by topic.

use super::*;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tempfile::{tempdir, TempDir};

use mx_domain::{
    AssemblyStrategy, ContentManifest, FileSource, InstallInstructions, InstallTarget,
    ManifestFile, ManifestId, Profile, ProfileChanges, PublisherInfo,
};

use crate::core::config::GcConfig;
use crate::core::library::{ManifestPool, MemoryLibrary, ProfileStore};
use crate::core::store::cas::{ConsumerId, ContentAddressableStore, StoreError};
use crate::core::tooling::cancel::CancelToken;

fn test_gc_config() -> GcConfig {
    GcConfig {
        disabled: false,
        grace: Duration::from_secs(0),
    }
}

fn new_store(temp: &TempDir) -> Result<ContentAddressableStore> {
    ContentAddressableStore::new(Some(temp.path().join("store")))
}

fn id(value: &str) -> ManifestId {
    ManifestId::parse(value).expect("test id")
}

fn manifest(id_str: &str) -> ContentManifest {
    ContentManifest {
        id: id(id_str),
        content_type: None,
        game: "colony".into(),
        publisher: PublisherInfo {
            id: "acme".into(),
            name: "Acme".into(),
        },
        files: vec![],
        dependencies: vec![],
        install: InstallInstructions {
            assembly: AssemblyStrategy::Copy,
            notes: None,
        },
    }
}

/// Build a manifest carrying one CAS-backed file whose blob is ingested into
/// the store.
fn manifest_with_blob(
    id_str: &str,
    store: &ContentAddressableStore,
    content: &[u8],
) -> Result<ContentManifest> {
    let stored = store.insert_bytes(content)?;
    let mut built = manifest(id_str);
    built.files.push(ManifestFile {
        path: format!("data/{}.pak", stored.hash.get(..8).unwrap_or("blob")),
        sha256: Some(stored.hash),
        size: stored.size,
        source: FileSource::Cas,
        target: InstallTarget::Workspace,
        executable: false,
    });
    Ok(built)
}

fn profile(id: &str, primary: Option<&ManifestId>, enabled: &[&ManifestId]) -> Profile {
    Profile {
        id: id.into(),
        name: id.to_uppercase(),
        primary: primary.cloned(),
        enabled: enabled.iter().map(|id| (*id).clone()).collect(),
    }
}

struct Harness {
    _temp: TempDir,
    library: Arc<MemoryLibrary>,
    store: ContentAddressableStore,
    lifecycle: CasLifecycle,
    service: ReconciliationService,
}

fn harness() -> Result<Harness> {
    let temp = tempdir()?;
    let store = new_store(&temp)?;
    let library = Arc::new(MemoryLibrary::new());
    let lifecycle = CasLifecycle::new(store.clone(), test_gc_config());
    let service = ReconciliationService::new(
        library.clone() as Arc<dyn ManifestPool>,
        library.clone() as Arc<dyn ProfileStore>,
        lifecycle.clone(),
    );
    Ok(Harness {
        _temp: temp,
        library,
        store,
        lifecycle,
        service,
    })
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<ReconcileEvent>>,
}

impl CollectingSink {
    fn take(&self) -> Vec<ReconcileEvent> {
        std::mem::take(
            &mut *self
                .events
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: &ReconcileEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

struct OrchestratorHarness {
    _temp: TempDir,
    library: Arc<MemoryLibrary>,
    store: ContentAddressableStore,
    orchestrator: ContentOrchestrator,
    sink: Arc<CollectingSink>,
    audit: AuditLog,
}

fn orchestrator_harness() -> Result<OrchestratorHarness> {
    orchestrator_harness_with(|library| library as Arc<dyn ProfileStore>)
}

/// Variant allowing the profile store to be wrapped (probes, fault
/// injection).
fn orchestrator_harness_with<F>(wrap_profiles: F) -> Result<OrchestratorHarness>
where
    F: FnOnce(Arc<MemoryLibrary>) -> Arc<dyn ProfileStore>,
{
    let temp = tempdir()?;
    let store = new_store(&temp)?;
    let library = Arc::new(MemoryLibrary::new());
    let lifecycle = CasLifecycle::new(store.clone(), test_gc_config());
    let profiles = wrap_profiles(library.clone());
    let service = ReconciliationService::new(
        library.clone() as Arc<dyn ManifestPool>,
        profiles,
        lifecycle.clone(),
    );
    let sink = Arc::new(CollectingSink::default());
    let audit = AuditLog::new(temp.path().join("audit.jsonl"));
    let orchestrator = ContentOrchestrator::new(
        service,
        lifecycle,
        library.clone() as Arc<dyn ManifestPool>,
        sink.clone() as Arc<dyn EventSink>,
        audit.clone(),
    );
    Ok(OrchestratorHarness {
        _temp: temp,
        library,
        store,
        orchestrator,
        sink,
        audit,
    })
}

mod orchestrator;
