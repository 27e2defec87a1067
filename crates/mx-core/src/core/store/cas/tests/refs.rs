use super::*;

#[test]
fn track_is_idempotent_and_additive() -> Result<()> {
    let (_temp, store) = new_store()?;
    let a = store.insert_bytes(b"a")?;
    let b = store.insert_bytes(b"b")?;
    let consumer = ConsumerId::workspace("ws-1");

    store.track(&consumer, &hashes_of(&[&a]))?;
    store.track(&consumer, &hashes_of(&[&a]))?;
    store.track(&consumer, &hashes_of(&[&b]))?;

    let audit = store.ledger_audit()?;
    assert_eq!(audit.live, hashes_of(&[&a, &b]));
    assert_eq!(audit.consumers.len(), 1);
    assert_eq!(audit.consumers[0].consumer, consumer);
    assert_eq!(audit.consumers[0].hashes, hashes_of(&[&a, &b]));
    Ok(())
}

#[test]
fn untrack_removes_the_whole_consumer_set() -> Result<()> {
    let (_temp, store) = new_store()?;
    let a = store.insert_bytes(b"a")?;
    let b = store.insert_bytes(b"b")?;
    let keeper = ConsumerId::workspace("keeper");
    let leaver = ConsumerId::workspace("leaver");
    store.track(&keeper, &hashes_of(&[&a]))?;
    store.track(&leaver, &hashes_of(&[&a, &b]))?;

    assert_eq!(store.untrack(&leaver)?, 2);
    assert_eq!(store.untrack(&leaver)?, 0, "untrack is idempotent");

    let audit = store.ledger_audit()?;
    assert_eq!(audit.live, hashes_of(&[&a]), "keeper's refs survive");
    Ok(())
}

#[test]
fn manifest_consumer_ids_are_case_insensitive() -> Result<()> {
    let (_temp, store) = new_store()?;
    let blob = store.insert_bytes(b"blob")?;
    let lower = mx_domain::ManifestId::parse("v1:1.0.0:acme:mod:alpha")?;
    let upper = mx_domain::ManifestId::parse("V1:1.0.0:ACME:MOD:ALPHA")?;

    store.track(&ConsumerId::manifest(&lower), &hashes_of(&[&blob]))?;
    assert_eq!(
        store.untrack(&ConsumerId::manifest(&upper))?,
        1,
        "differently-cased spellings address the same ledger entry"
    );
    Ok(())
}

#[test]
fn tracking_accepts_hashes_not_yet_stored() -> Result<()> {
    let (_temp, store) = new_store()?;
    let pending = "ab".repeat(32);
    store.track(&ConsumerId::workspace("ws"), &BTreeSet::from([pending.clone()]))?;
    let audit = store.ledger_audit()?;
    assert!(audit.live.contains(&pending));
    Ok(())
}

#[test]
fn tracking_rejects_malformed_hashes_before_writing() -> Result<()> {
    let (_temp, store) = new_store()?;
    let err = store
        .track(
            &ConsumerId::workspace("ws"),
            &BTreeSet::from(["not-a-hash".to_string()]),
        )
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::InvalidHash(_))
    ));
    assert!(store.ledger_audit()?.live.is_empty());
    Ok(())
}

#[test]
fn refs_for_lists_all_consumers() -> Result<()> {
    let (_temp, store) = new_store()?;
    let blob = store.insert_bytes(b"shared")?;
    let ws = ConsumerId::workspace("ws");
    let id = mx_domain::ManifestId::parse("v1:1.0.0:acme:mod:alpha")?;
    let manifest = ConsumerId::manifest(&id);
    store.track(&ws, &hashes_of(&[&blob]))?;
    store.track(&manifest, &hashes_of(&[&blob]))?;

    let mut consumers = store.refs_for(&blob.hash)?;
    consumers.sort();
    assert_eq!(consumers, vec![ws, manifest]);
    Ok(())
}
