//! Workspace delta reconciler: turns a target manifest set plus the current
//! on-disk state into an ordered Add/Update/Remove/Skip plan.
//!
//! Pure planning only — execution belongs to the workspace strategy
//! collaborator. The plan is a deterministic function of its inputs: same
//! manifests and same tree always produce the same deltas in the same order.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::debug;

use mx_domain::{ContentManifest, ManifestFile, ManifestId, PriorityTable, WorkspaceInfo};

const WORKSPACE_INFO_FILENAME: &str = ".mx-workspace.json";
const INTERNAL_FILE_PREFIX: &str = ".mx-";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaKind {
    Add,
    Update,
    Remove,
    Skip,
}

impl DeltaKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::Skip => "skip",
        }
    }
}

/// One planned file operation. Ephemeral: recomputed each reconciliation,
/// never persisted.
#[derive(Clone, Debug)]
pub struct WorkspaceDelta {
    pub kind: DeltaKind,
    /// Path relative to the workspace root.
    pub file: String,
    /// Resolved absolute path.
    pub path: PathBuf,
    pub reason: String,
}

struct ExpectedEntry<'a> {
    file: &'a ManifestFile,
    owner: &'a ManifestId,
    rank: u32,
}

/// Compute the delta plan bringing `root` in line with `manifests`.
///
/// A missing root means no workspace exists yet: every expected entry
/// becomes an Add.
pub fn plan_workspace_delta(
    root: &Path,
    manifests: &[ContentManifest],
    priorities: &PriorityTable,
) -> Result<Vec<WorkspaceDelta>> {
    let expected = expected_entries(manifests, priorities);
    let existing = if root.exists() {
        enumerate_existing(root)?
    } else {
        BTreeMap::new()
    };

    let mut deltas = Vec::with_capacity(expected.len());
    for (key, entry) in &expected {
        let declared = entry.file.path.trim_start_matches("./");
        match existing.get(key) {
            None => deltas.push(WorkspaceDelta {
                kind: DeltaKind::Add,
                file: declared.to_string(),
                path: root.join(declared),
                reason: "not present in workspace".to_string(),
            }),
            Some(actual) => match change_reason(actual, entry.file)? {
                Some(reason) => deltas.push(WorkspaceDelta {
                    kind: DeltaKind::Update,
                    file: declared.to_string(),
                    path: actual.clone(),
                    reason,
                }),
                None => deltas.push(WorkspaceDelta {
                    kind: DeltaKind::Skip,
                    file: declared.to_string(),
                    path: actual.clone(),
                    reason: "up to date".to_string(),
                }),
            },
        }
    }

    for (key, actual) in &existing {
        if expected.contains_key(key) {
            continue;
        }
        let rel = actual
            .strip_prefix(root)
            .unwrap_or(actual)
            .to_string_lossy()
            .replace('\\', "/");
        deltas.push(WorkspaceDelta {
            kind: DeltaKind::Remove,
            file: rel,
            path: actual.clone(),
            reason: "no longer provided by any manifest".to_string(),
        });
    }

    Ok(deltas)
}

/// Group workspace-target files by case-insensitive relative path and elect
/// one contributor per path: highest content-type rank wins, ties broken by
/// case-insensitive manifest-id order. Losers are superseded, not errors.
fn expected_entries<'a>(
    manifests: &'a [ContentManifest],
    priorities: &PriorityTable,
) -> BTreeMap<String, ExpectedEntry<'a>> {
    let mut by_path: BTreeMap<String, Vec<ExpectedEntry<'a>>> = BTreeMap::new();
    for manifest in manifests {
        let rank = priorities.rank(manifest.effective_content_type());
        for file in manifest.workspace_files() {
            by_path
                .entry(normalize_rel_path(&file.path))
                .or_default()
                .push(ExpectedEntry {
                    file,
                    owner: &manifest.id,
                    rank,
                });
        }
    }

    let mut expected = BTreeMap::new();
    for (key, mut contributors) in by_path {
        contributors.sort_by(|a, b| b.rank.cmp(&a.rank).then_with(|| a.owner.cmp(b.owner)));
        let mut contributors = contributors.into_iter();
        let Some(winner) = contributors.next() else {
            continue;
        };
        for superseded in contributors {
            debug!(
                path = %key,
                winner = %winner.owner,
                superseded = %superseded.owner,
                "workspace file conflict resolved by content-type priority"
            );
        }
        expected.insert(key, winner);
    }
    expected
}

fn enumerate_existing(root: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let mut existing = BTreeMap::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1) {
        let entry =
            entry.with_context(|| format!("failed to enumerate workspace {}", root.display()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(INTERNAL_FILE_PREFIX)
        {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        existing.insert(normalize_rel_path(&rel), entry.path().to_path_buf());
    }
    Ok(existing)
}

/// Change-detection chain, cheapest first, short-circuiting on the first
/// verdict. Hashing is deliberately last and is skipped whenever size alone
/// decides, so large workspaces stay cheap to re-validate.
fn change_reason(path: &Path, file: &ManifestFile) -> Result<Option<String>> {
    let metadata = match fs::symlink_metadata(path) {
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(Some("missing from disk".to_string()));
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to inspect workspace file {}", path.display()));
        }
        Ok(metadata) => metadata,
    };

    if metadata.file_type().is_symlink() {
        return match fs::metadata(path) {
            Err(_) => Ok(Some("symlink target is broken".to_string())),
            Ok(target) if target.len() != file.size => Ok(Some(format!(
                "symlink target size changed ({} -> {})",
                file.size,
                target.len()
            ))),
            Ok(_) => Ok(None),
        };
    }

    if metadata.len() != file.size {
        return Ok(Some(format!(
            "size changed ({} -> {})",
            file.size,
            metadata.len()
        )));
    }

    if let Some(declared) = &file.sha256 {
        let actual = hash_file(path)?;
        if !actual.eq_ignore_ascii_case(declared) {
            return Ok(Some("content hash changed".to_string()));
        }
    }

    Ok(None)
}

fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("failed to open {} for hashing", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    std::io::copy(&mut reader, &mut hasher)
        .with_context(|| format!("failed to hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

fn normalize_rel_path(path: &str) -> String {
    path.trim_start_matches("./")
        .replace('\\', "/")
        .to_ascii_lowercase()
}

/// Load the persisted workspace record, if any.
pub fn load_workspace_info(root: &Path) -> Result<Option<WorkspaceInfo>> {
    let path = root.join(WORKSPACE_INFO_FILENAME);
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("failed to read workspace record {}", path.display()))?;
    let info = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse workspace record {}", path.display()))?;
    Ok(Some(info))
}

/// Persist the workspace record inside the workspace itself.
pub fn save_workspace_info(info: &WorkspaceInfo) -> Result<()> {
    fs::create_dir_all(&info.path)
        .with_context(|| format!("failed to create workspace {}", info.path.display()))?;
    let path = info.path.join(WORKSPACE_INFO_FILENAME);
    let rendered = serde_json::to_string_pretty(info)?;
    fs::write(&path, rendered)
        .with_context(|| format!("failed to write workspace record {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests;
