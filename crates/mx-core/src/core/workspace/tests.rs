use super::*;

use mx_domain::{
    AssemblyStrategy, ContentType, FileSource, InstallInstructions, InstallTarget, ManifestPin,
    PublisherInfo,
};
use tempfile::tempdir;

fn hashed_file(path: &str, content: &[u8]) -> ManifestFile {
    ManifestFile {
        path: path.to_string(),
        sha256: Some(hex::encode(Sha256::digest(content))),
        size: content.len() as u64,
        source: FileSource::Cas,
        target: InstallTarget::Workspace,
        executable: false,
    }
}

fn manifest(id: &str, content_type: ContentType, files: Vec<ManifestFile>) -> ContentManifest {
    ContentManifest {
        id: ManifestId::parse(id).expect("test id"),
        content_type: Some(content_type),
        game: "colony".into(),
        publisher: PublisherInfo {
            id: "acme".into(),
            name: "Acme".into(),
        },
        files,
        dependencies: vec![],
        install: InstallInstructions {
            assembly: AssemblyStrategy::Copy,
            notes: None,
        },
    }
}

fn kinds_for<'a>(deltas: &'a [WorkspaceDelta], kind: DeltaKind) -> Vec<&'a str> {
    deltas
        .iter()
        .filter(|delta| delta.kind == kind)
        .map(|delta| delta.file.as_str())
        .collect()
}

#[test]
fn fresh_root_plans_all_adds() -> Result<()> {
    let temp = tempdir()?;
    let root = temp.path().join("workspace");
    let manifests = vec![manifest(
        "v1:1.0.0:acme:mod:alpha",
        ContentType::Mod,
        vec![hashed_file("data/a.pak", b"alpha"), hashed_file("bin/run", b"run")],
    )];

    let deltas = plan_workspace_delta(&root, &manifests, &PriorityTable::default())?;
    assert_eq!(deltas.len(), 2);
    assert!(deltas.iter().all(|delta| delta.kind == DeltaKind::Add));
    assert_eq!(deltas[0].path, root.join("bin/run"));
    Ok(())
}

#[test]
fn change_detection_scenario_covers_all_kinds() -> Result<()> {
    let temp = tempdir()?;
    let root = temp.path().to_path_buf();

    // A: current on disk. B: declared but missing. C: present with the same
    // size but different bytes (only the hash check can catch it). D: on
    // disk but no longer declared.
    fs::write(root.join("a.txt"), b"alpha")?;
    fs::write(root.join("c.txt"), b"CCCC")?;
    fs::write(root.join("d.txt"), b"stale")?;

    let manifests = vec![manifest(
        "v1:1.0.0:acme:mod:alpha",
        ContentType::Mod,
        vec![
            hashed_file("a.txt", b"alpha"),
            hashed_file("b.txt", b"beta"),
            hashed_file("c.txt", b"cccc"),
        ],
    )];

    let deltas = plan_workspace_delta(&root, &manifests, &PriorityTable::default())?;
    assert_eq!(kinds_for(&deltas, DeltaKind::Skip), vec!["a.txt"]);
    assert_eq!(kinds_for(&deltas, DeltaKind::Add), vec!["b.txt"]);
    assert_eq!(kinds_for(&deltas, DeltaKind::Update), vec!["c.txt"]);
    assert_eq!(kinds_for(&deltas, DeltaKind::Remove), vec!["d.txt"]);

    let update = deltas
        .iter()
        .find(|delta| delta.kind == DeltaKind::Update)
        .expect("update delta");
    assert_eq!(update.reason, "content hash changed");
    Ok(())
}

#[test]
fn matching_tree_plans_all_skips_twice() -> Result<()> {
    let temp = tempdir()?;
    let root = temp.path().to_path_buf();
    fs::create_dir_all(root.join("data"))?;
    fs::write(root.join("data/a.pak"), b"alpha")?;
    fs::write(root.join("readme.md"), b"docs")?;

    let manifests = vec![manifest(
        "v1:1.0.0:acme:mod:alpha",
        ContentType::Mod,
        vec![
            hashed_file("data/a.pak", b"alpha"),
            hashed_file("readme.md", b"docs"),
        ],
    )];

    for _ in 0..2 {
        let deltas = plan_workspace_delta(&root, &manifests, &PriorityTable::default())?;
        assert_eq!(deltas.len(), 2);
        assert!(
            deltas.iter().all(|delta| delta.kind == DeltaKind::Skip),
            "unchanged tree must replan to all-Skip"
        );
    }
    Ok(())
}

#[test]
fn conflict_winner_is_independent_of_enumeration_order() -> Result<()> {
    let temp = tempdir()?;
    let root = temp.path().join("workspace");
    let client = manifest(
        "v1:1.0.0:acme:client:base",
        ContentType::Client,
        vec![hashed_file("Data/Core.pak", b"client-core")],
    );
    let gameplay_mod = manifest(
        "v1:1.0.0:acme:mod:overhaul",
        ContentType::Mod,
        vec![hashed_file("data/core.pak", b"mod-core")],
    );

    for manifests in [
        vec![client.clone(), gameplay_mod.clone()],
        vec![gameplay_mod.clone(), client.clone()],
    ] {
        let deltas = plan_workspace_delta(&root, &manifests, &PriorityTable::default())?;
        assert_eq!(deltas.len(), 1, "case-insensitive paths collapse to one");
        assert_eq!(deltas[0].kind, DeltaKind::Add);
        // The client's declared spelling wins along with its bytes.
        assert_eq!(deltas[0].file, "Data/Core.pak");
    }
    Ok(())
}

#[test]
fn equal_priority_ties_break_by_manifest_id() -> Result<()> {
    let temp = tempdir()?;
    let root = temp.path().to_path_buf();
    // Disk matches the lexically-smaller manifest's declaration; if the
    // winner ever flipped with enumeration order, this would become Update.
    fs::create_dir_all(root.join("data"))?;
    fs::write(root.join("data/core.pak"), b"first")?;

    let first = manifest(
        "v1:1.0.0:acme:mod:aardvark",
        ContentType::Mod,
        vec![hashed_file("data/core.pak", b"first")],
    );
    let second = manifest(
        "v1:1.0.0:acme:mod:zebra",
        ContentType::Mod,
        vec![hashed_file("data/core.pak", b"second!")],
    );

    for manifests in [
        vec![first.clone(), second.clone()],
        vec![second.clone(), first.clone()],
    ] {
        let deltas = plan_workspace_delta(&root, &manifests, &PriorityTable::default())?;
        assert_eq!(deltas.len(), 1);
        assert_eq!(
            deltas[0].kind,
            DeltaKind::Skip,
            "the lexically-smaller id must win regardless of order"
        );
    }
    Ok(())
}

#[cfg(unix)]
#[test]
fn broken_symlinks_need_update() -> Result<()> {
    use std::os::unix::fs::symlink;

    let temp = tempdir()?;
    let root = temp.path().to_path_buf();
    symlink(root.join("gone"), root.join("linked.pak"))?;

    let manifests = vec![manifest(
        "v1:1.0.0:acme:mod:alpha",
        ContentType::Mod,
        vec![hashed_file("linked.pak", b"target-bytes")],
    )];
    let deltas = plan_workspace_delta(&root, &manifests, &PriorityTable::default())?;
    assert_eq!(deltas.len(), 1);
    assert_eq!(deltas[0].kind, DeltaKind::Update);
    assert_eq!(deltas[0].reason, "symlink target is broken");
    Ok(())
}

#[cfg(unix)]
#[test]
fn healthy_symlinks_compare_against_target_size() -> Result<()> {
    use std::os::unix::fs::symlink;

    let temp = tempdir()?;
    let root = temp.path().to_path_buf();
    let target = temp.path().join("store-blob");
    fs::write(&target, b"target-bytes")?;
    symlink(&target, root.join("linked.pak"))?;

    let manifests = vec![manifest(
        "v1:1.0.0:acme:mod:alpha",
        ContentType::Mod,
        // Deliberately wrong hash: symlinks stop at the size check.
        vec![ManifestFile {
            sha256: Some("0".repeat(64)),
            ..hashed_file("linked.pak", b"target-bytes")
        }],
    )];
    let deltas = plan_workspace_delta(&root, &manifests, &PriorityTable::default())?;
    // The walk sees both the link and the target blob; the blob is Removed.
    let linked = deltas
        .iter()
        .find(|delta| delta.file == "linked.pak")
        .expect("linked entry");
    assert_eq!(linked.kind, DeltaKind::Skip);
    Ok(())
}

#[test]
fn internal_records_are_not_swept() -> Result<()> {
    let temp = tempdir()?;
    let root = temp.path().to_path_buf();
    let info = WorkspaceInfo {
        path: root.clone(),
        strategy: AssemblyStrategy::Copy,
        manifests: vec![ManifestPin {
            id: ManifestId::parse("v1:1.0.0:acme:mod:alpha")?,
            content_version: "1.0.0".into(),
        }],
        file_count: 0,
        built_at: None,
    };
    save_workspace_info(&info)?;

    let deltas = plan_workspace_delta(&root, &[], &PriorityTable::default())?;
    assert!(
        deltas.is_empty(),
        "workspace bookkeeping must not be planned for removal"
    );

    let loaded = load_workspace_info(&root)?.expect("record round-trips");
    assert_eq!(loaded, info);
    Ok(())
}
