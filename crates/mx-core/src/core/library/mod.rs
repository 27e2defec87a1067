//! External collaborator seams: the manifest pool and the profile manager.
//!
//! The reconciliation engine never owns this storage; it receives explicit
//! handles at construction time. `MemoryLibrary` backs unit tests,
//! `FileLibrary` backs the CLI.

use anyhow::Result;

use mx_domain::{ContentManifest, ManifestId, Profile, ProfileChanges};

mod file;
mod memory;

pub use file::FileLibrary;
pub use memory::MemoryLibrary;

/// Owner of content manifests (create/update/delete); read-shared by the
/// reconciliation engine.
pub trait ManifestPool: Send + Sync {
    fn add_manifest(&self, manifest: ContentManifest) -> Result<()>;

    /// Returns whether a manifest was actually removed.
    fn remove_manifest(&self, id: &ManifestId) -> Result<bool>;

    fn get_manifest(&self, id: &ManifestId) -> Result<Option<ContentManifest>>;

    fn get_all_manifests(&self) -> Result<Vec<ContentManifest>>;

    /// Whether the pool holds content for this id.
    fn is_acquired(&self, id: &ManifestId) -> Result<bool>;
}

/// Profile CRUD owner. Updates are partial: only fields present in
/// [`ProfileChanges`] are rewritten.
pub trait ProfileStore: Send + Sync {
    fn get_all_profiles(&self) -> Result<Vec<Profile>>;

    fn update_profile(&self, id: &str, changes: &ProfileChanges) -> Result<()>;

    fn create_profile(&self, profile: Profile) -> Result<()>;
}
