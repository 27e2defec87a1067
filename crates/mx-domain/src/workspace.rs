use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::manifest::{AssemblyStrategy, ContentManifest, ManifestId};

/// Pinned manifest identity captured when a workspace was assembled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPin {
    pub id: ManifestId,
    pub content_version: String,
}

/// Persisted record of an assembled workspace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub path: PathBuf,
    pub strategy: AssemblyStrategy,
    pub manifests: Vec<ManifestPin>,
    pub file_count: usize,
    /// RFC 3339, recorded at assembly time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub built_at: Option<String>,
}

impl WorkspaceInfo {
    /// Whether the workspace was built from exactly the target manifest set
    /// (same ids at the same content versions) and can be reused without a
    /// rebuild.
    #[must_use]
    pub fn can_reuse(&self, target: &[ContentManifest]) -> bool {
        let pinned: BTreeSet<(String, String)> = self
            .manifests
            .iter()
            .map(|pin| {
                (
                    pin.id.to_string().to_ascii_lowercase(),
                    pin.content_version.to_ascii_lowercase(),
                )
            })
            .collect();
        let wanted: BTreeSet<(String, String)> = target
            .iter()
            .map(|manifest| {
                (
                    manifest.id.to_string().to_ascii_lowercase(),
                    manifest.id.content_version().to_ascii_lowercase(),
                )
            })
            .collect();
        pinned == wanted
    }

    #[must_use]
    pub fn pin_for(manifest: &ContentManifest) -> ManifestPin {
        ManifestPin {
            id: manifest.id.clone(),
            content_version: manifest.id.content_version().to_string(),
        }
    }
}
