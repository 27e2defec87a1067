use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::{anyhow, Result};

use mx_domain::{ContentManifest, ManifestId, Profile, ProfileChanges};

use super::{ManifestPool, ProfileStore};

/// In-memory manifest pool + profile store, primarily for tests.
#[derive(Debug, Default)]
pub struct MemoryLibrary {
    manifests: RwLock<HashMap<ManifestId, ContentManifest>>,
    profiles: RwLock<BTreeMap<String, Profile>>,
}

impl MemoryLibrary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ManifestPool for MemoryLibrary {
    fn add_manifest(&self, manifest: ContentManifest) -> Result<()> {
        let mut manifests = self
            .manifests
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        manifests.insert(manifest.id.clone(), manifest);
        Ok(())
    }

    fn remove_manifest(&self, id: &ManifestId) -> Result<bool> {
        let mut manifests = self
            .manifests
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(manifests.remove(id).is_some())
    }

    fn get_manifest(&self, id: &ManifestId) -> Result<Option<ContentManifest>> {
        let manifests = self
            .manifests
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(manifests.get(id).cloned())
    }

    fn get_all_manifests(&self) -> Result<Vec<ContentManifest>> {
        let manifests = self
            .manifests
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut all: Vec<ContentManifest> = manifests.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    fn is_acquired(&self, id: &ManifestId) -> Result<bool> {
        Ok(self.get_manifest(id)?.is_some())
    }
}

impl ProfileStore for MemoryLibrary {
    fn get_all_profiles(&self) -> Result<Vec<Profile>> {
        let profiles = self
            .profiles
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(profiles.values().cloned().collect())
    }

    fn update_profile(&self, id: &str, changes: &ProfileChanges) -> Result<()> {
        let mut profiles = self
            .profiles
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let profile = profiles
            .get_mut(id)
            .ok_or_else(|| anyhow!("profile '{id}' not found"))?;
        changes.apply_to(profile);
        Ok(())
    }

    fn create_profile(&self, profile: Profile) -> Result<()> {
        let mut profiles = self
            .profiles
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if profiles.contains_key(&profile.id) {
            return Err(anyhow!("profile '{}' already exists", profile.id));
        }
        profiles.insert(profile.id.clone(), profile);
        Ok(())
    }
}
