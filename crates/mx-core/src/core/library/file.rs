use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};

use mx_domain::{ContentManifest, ManifestId, Profile, ProfileChanges};

use super::{ManifestPool, ProfileStore};

const MANIFESTS_FILENAME: &str = "manifests.json";
const PROFILES_FILENAME: &str = "profiles.json";

/// JSON-document-backed library under a root directory. Each mutation is a
/// whole-document read-modify-write guarded by a process-local lock.
#[derive(Debug)]
pub struct FileLibrary {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileLibrary {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create library root {}", root.display()))?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn manifests_path(&self) -> PathBuf {
        self.root.join(MANIFESTS_FILENAME)
    }

    fn profiles_path(&self) -> PathBuf {
        self.root.join(PROFILES_FILENAME)
    }

    fn read_manifests(&self) -> Result<Vec<ContentManifest>> {
        read_document(&self.manifests_path())
    }

    fn read_profiles(&self) -> Result<Vec<Profile>> {
        read_document(&self.profiles_path())
    }

    fn write_manifests(&self, manifests: &[ContentManifest]) -> Result<()> {
        write_document(&self.manifests_path(), manifests)
    }

    fn write_profiles(&self, profiles: &[Profile]) -> Result<()> {
        write_document(&self.profiles_path(), profiles)
    }
}

fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}

fn write_document<T: serde::Serialize>(path: &Path, values: &[T]) -> Result<()> {
    let rendered = serde_json::to_string_pretty(values)?;
    let tmp = path.with_extension("json.partial");
    fs::write(&tmp, rendered).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move document into {}", path.display()))?;
    Ok(())
}

impl ManifestPool for FileLibrary {
    fn add_manifest(&self, manifest: ContentManifest) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut manifests = self.read_manifests()?;
        manifests.retain(|existing| existing.id != manifest.id);
        manifests.push(manifest);
        manifests.sort_by(|a, b| a.id.cmp(&b.id));
        self.write_manifests(&manifests)
    }

    fn remove_manifest(&self, id: &ManifestId) -> Result<bool> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut manifests = self.read_manifests()?;
        let before = manifests.len();
        manifests.retain(|existing| existing.id != *id);
        if manifests.len() == before {
            return Ok(false);
        }
        self.write_manifests(&manifests)?;
        Ok(true)
    }

    fn get_manifest(&self, id: &ManifestId) -> Result<Option<ContentManifest>> {
        Ok(self
            .read_manifests()?
            .into_iter()
            .find(|manifest| manifest.id == *id))
    }

    fn get_all_manifests(&self) -> Result<Vec<ContentManifest>> {
        self.read_manifests()
    }

    fn is_acquired(&self, id: &ManifestId) -> Result<bool> {
        Ok(self.get_manifest(id)?.is_some())
    }
}

impl ProfileStore for FileLibrary {
    fn get_all_profiles(&self) -> Result<Vec<Profile>> {
        self.read_profiles()
    }

    fn update_profile(&self, id: &str, changes: &ProfileChanges) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut profiles = self.read_profiles()?;
        let profile = profiles
            .iter_mut()
            .find(|profile| profile.id == id)
            .ok_or_else(|| anyhow!("profile '{id}' not found"))?;
        changes.apply_to(profile);
        self.write_profiles(&profiles)
    }

    fn create_profile(&self, profile: Profile) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut profiles = self.read_profiles()?;
        if profiles.iter().any(|existing| existing.id == profile.id) {
            return Err(anyhow!("profile '{}' already exists", profile.id));
        }
        profiles.push(profile);
        self.write_profiles(&profiles)
    }
}
