use super::*;

fn replace_request(
    old: &ManifestId,
    new: &ManifestId,
    remove_old: bool,
    run_gc: bool,
) -> ReplaceRequest {
    ReplaceRequest {
        mapping: BTreeMap::from([(old.clone(), new.clone())]),
        remove_old,
        run_gc,
        source: "test".into(),
    }
}

#[test]
fn replace_rewrites_untracks_removes_and_collects() -> Result<()> {
    let h = orchestrator_harness()?;
    let old_manifest = manifest_with_blob("v1:1.0.0:acme:mod:alpha", &h.store, b"old-bytes")?;
    let new_manifest = manifest_with_blob("v1:2.0.0:acme:mod:alpha", &h.store, b"new-bytes")?;
    let old = old_manifest.id.clone();
    let new = new_manifest.id.clone();
    let unrelated = id("v1:1.0.0:acme:mod:unrelated");
    let old_hash = old_manifest.cas_hashes().into_iter().next().expect("hash");
    let new_hash = new_manifest.cas_hashes().into_iter().next().expect("hash");

    // Acquisition-time state: both manifests pooled and tracked.
    h.library.add_manifest(old_manifest.clone())?;
    h.library.add_manifest(new_manifest.clone())?;
    h.library.add_manifest(manifest("v1:1.0.0:acme:mod:unrelated"))?;
    let lifecycle = CasLifecycle::new(h.store.clone(), test_gc_config());
    lifecycle.track_manifest(&old_manifest)?;
    lifecycle.track_manifest(&new_manifest)?;

    h.library.create_profile(profile("p1", Some(&old), &[]))?;
    h.library
        .create_profile(profile("p2", Some(&unrelated), &[]))?;

    let outcome = h.orchestrator.replace(
        &replace_request(&old, &new, true, true),
        &CancelToken::new(),
    )?;

    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(outcome.profiles_updated, 1);
    assert_eq!(outcome.failed_profiles, 0);
    assert_eq!(outcome.references_untracked, 1);
    assert_eq!(outcome.manifests_removed, 1);
    assert!(outcome.objects_reclaimed >= 1);
    assert!(outcome.bytes_reclaimed > 0);

    let profiles = h.library.get_all_profiles()?;
    assert_eq!(profiles[0].primary, Some(new.clone()));
    assert_eq!(profiles[1].primary, Some(unrelated), "p2 untouched");
    assert!(!h.library.is_acquired(&old)?, "old manifest left the pool");
    assert!(
        !h.store.contains(&old_hash)?,
        "content referenced solely by the old id is reclaimed"
    );
    assert!(
        h.store.contains(&new_hash)?,
        "the replacement's content stays live"
    );

    let events = h.sink.take();
    assert_eq!(events.len(), 2);
    assert!(matches!(
        &events[0],
        ReconcileEvent::WorkflowStarted { kind: WorkflowKind::Replace, .. }
    ));
    assert!(matches!(
        &events[1],
        ReconcileEvent::WorkflowCompleted { success: true, .. }
    ));

    let entries = h.audit.read_all()?;
    assert_eq!(entries.len(), 1);
    assert!(entries[0].success);
    assert_eq!(entries[0].operation, "replace");
    assert_eq!(entries[0].profile_ids, vec!["p1".to_string()]);
    assert_eq!(
        entries[0].mapping.get(&old.to_string()),
        Some(&new.to_string())
    );
    Ok(())
}

/// Profile store that refuses to rewrite one specific profile.
struct FailingProfiles {
    inner: Arc<MemoryLibrary>,
    poison_id: String,
}

impl ProfileStore for FailingProfiles {
    fn get_all_profiles(&self) -> Result<Vec<Profile>> {
        self.inner.get_all_profiles()
    }

    fn update_profile(&self, id: &str, changes: &ProfileChanges) -> Result<()> {
        if id == self.poison_id {
            return Err(anyhow!("simulated write failure"));
        }
        self.inner.update_profile(id, changes)
    }

    fn create_profile(&self, profile: Profile) -> Result<()> {
        self.inner.create_profile(profile)
    }
}

#[test]
fn partial_profile_failure_suppresses_the_terminal_collection() -> Result<()> {
    let h = orchestrator_harness_with(|library| {
        Arc::new(FailingProfiles {
            inner: library,
            poison_id: "p2".into(),
        }) as Arc<dyn ProfileStore>
    })?;
    let old_manifest = manifest_with_blob("v1:1.0.0:acme:mod:alpha", &h.store, b"old-bytes")?;
    let old = old_manifest.id.clone();
    let new = id("v1:2.0.0:acme:mod:alpha");
    let old_hash = old_manifest.cas_hashes().into_iter().next().expect("hash");
    h.library.add_manifest(old_manifest.clone())?;
    h.library.add_manifest(manifest("v1:2.0.0:acme:mod:alpha"))?;
    let lifecycle = CasLifecycle::new(h.store.clone(), test_gc_config());
    lifecycle.track_manifest(&old_manifest)?;

    h.library.create_profile(profile("p1", Some(&old), &[]))?;
    h.library.create_profile(profile("p2", Some(&old), &[]))?;

    let outcome = h.orchestrator.replace(
        &replace_request(&old, &new, true, true),
        &CancelToken::new(),
    )?;

    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(outcome.profiles_updated, 1);
    assert_eq!(outcome.failed_profiles, 1);
    assert_eq!(outcome.objects_reclaimed, 0, "collection must be suppressed");
    assert!(outcome
        .warnings
        .iter()
        .any(|warning| warning.contains("skipped garbage collection")));
    assert!(
        h.store.contains(&old_hash)?,
        "objects a stale profile may depend on survive the run"
    );

    let entries = h.audit.read_all()?;
    assert!(entries[0].success, "partial failure still reports success");
    Ok(())
}

#[test]
fn remove_drops_profiles_refs_manifests_then_collects() -> Result<()> {
    let h = orchestrator_harness()?;
    let doomed_manifest = manifest_with_blob("v1:1.0.0:acme:map:canyon", &h.store, b"canyon")?;
    let doomed = doomed_manifest.id.clone();
    let kept = id("v1:1.0.0:acme:mod:kept");
    let doomed_hash = doomed_manifest
        .cas_hashes()
        .into_iter()
        .next()
        .expect("hash");
    h.library.add_manifest(doomed_manifest.clone())?;
    h.library.add_manifest(manifest("v1:1.0.0:acme:mod:kept"))?;
    let lifecycle = CasLifecycle::new(h.store.clone(), test_gc_config());
    lifecycle.track_manifest(&doomed_manifest)?;

    h.library
        .create_profile(profile("p1", Some(&doomed), &[&doomed, &kept]))?;

    let outcome = h
        .orchestrator
        .remove(&[doomed.clone()], &CancelToken::new())?;
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(outcome.profiles_updated, 1);
    assert_eq!(outcome.references_untracked, 1);
    assert_eq!(outcome.manifests_removed, 1);
    assert!(outcome.objects_reclaimed >= 1);

    let profiles = h.library.get_all_profiles()?;
    assert_eq!(profiles[0].primary, None);
    assert_eq!(profiles[0].enabled, vec![kept]);
    assert!(!h.library.is_acquired(&doomed)?);
    assert!(!h.store.contains(&doomed_hash)?);
    Ok(())
}

#[test]
fn precancelled_workflows_touch_nothing() -> Result<()> {
    let h = orchestrator_harness()?;
    let old = id("v1:1.0.0:acme:mod:alpha");
    let new = id("v1:2.0.0:acme:mod:alpha");
    h.library.add_manifest(manifest("v1:1.0.0:acme:mod:alpha"))?;
    h.library.add_manifest(manifest("v1:2.0.0:acme:mod:alpha"))?;
    h.library.create_profile(profile("p1", Some(&old), &[]))?;

    let cancel = CancelToken::new();
    cancel.cancel();
    let outcome = h
        .orchestrator
        .replace(&replace_request(&old, &new, true, true), &cancel)?;

    assert_eq!(outcome.status, WorkflowStatus::Cancelled);
    assert_eq!(outcome.profiles_updated, 0);
    assert_eq!(outcome.manifests_removed, 0);
    let profiles = h.library.get_all_profiles()?;
    assert_eq!(profiles[0].primary, Some(old.clone()));
    assert!(h.library.is_acquired(&old)?);

    let entries = h.audit.read_all()?;
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].success);
    assert_eq!(
        entries[0].error.as_deref(),
        Some(ReconcileError::Cancelled.to_string()).as_deref()
    );
    Ok(())
}

#[test]
fn validation_failures_are_still_audited() -> Result<()> {
    let h = orchestrator_harness()?;
    let request = ReplaceRequest {
        mapping: BTreeMap::new(),
        remove_old: false,
        run_gc: false,
        source: "test".into(),
    };
    let err = h
        .orchestrator
        .replace(&request, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ReconcileError>(),
        Some(ReconcileError::Validation(_))
    ));

    let events = h.sink.take();
    assert!(matches!(
        &events[1],
        ReconcileEvent::WorkflowCompleted { success: false, .. }
    ));
    let entries = h.audit.read_all()?;
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].success);
    assert!(entries[0].error.is_some());
    Ok(())
}

#[test]
fn update_workflow_delegates_and_audits_without_collecting() -> Result<()> {
    let h = orchestrator_harness()?;
    let old_manifest = manifest_with_blob("v1:1.0.0:acme:mod:alpha", &h.store, b"old-bytes")?;
    let old = old_manifest.id.clone();
    let old_hash = old_manifest.cas_hashes().into_iter().next().expect("hash");
    h.library.add_manifest(old_manifest)?;
    h.library.create_profile(profile("p1", Some(&old), &[]))?;
    // Deliberately unreferenced: a collection pass would reclaim it.
    // The update workflow must not collect.

    let updated = manifest_with_blob("v1:2.0.0:acme:mod:alpha", &h.store, b"new-bytes")?;
    let new_id = updated.id.clone();
    let outcome = h
        .orchestrator
        .update(&old, updated, &CancelToken::new())?;

    assert_eq!(outcome.kind, WorkflowKind::Update);
    assert_eq!(outcome.status, WorkflowStatus::Completed);
    assert_eq!(outcome.profiles_updated, 1);
    assert_eq!(outcome.objects_reclaimed, 0);
    assert!(
        h.store.contains(&old_hash)?,
        "update never runs a collection pass"
    );

    let profiles = h.library.get_all_profiles()?;
    assert_eq!(profiles[0].primary, Some(new_id));

    let entries = h.audit.read_all()?;
    assert_eq!(entries[0].operation, "update");
    assert_eq!(entries[0].manifest_ids.len(), 2);
    Ok(())
}
