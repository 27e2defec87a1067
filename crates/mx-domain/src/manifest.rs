use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

const ID_SEPARATOR: char = ':';
const ID_SEGMENTS: usize = 5;

/// Schema version pinned onto legacy four-segment ids.
pub const DEFAULT_SCHEMA_VERSION: &str = "v1";

/// Identifier of one unit of installable content.
///
/// Five ordered segments — schema version, content version, publisher id,
/// content type, content name — serialized as a `:`-delimited string.
/// Equality, ordering and hashing are case-insensitive over the whole value;
/// the original spelling is preserved for display.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ManifestId {
    schema_version: String,
    content_version: String,
    publisher: String,
    type_segment: String,
    name: String,
}

impl ManifestId {
    /// Parse an id from its delimited string form.
    ///
    /// The five-segment form is authoritative. Four-segment ids are a
    /// documented legacy format: they carry no schema version and are pinned
    /// to [`DEFAULT_SCHEMA_VERSION`].
    pub fn parse(value: &str) -> Result<Self> {
        let segments: Vec<&str> = value.split(ID_SEPARATOR).collect();
        let segments: Vec<&str> = match segments.len() {
            ID_SEGMENTS => segments,
            // Legacy fallback: no schema-version segment.
            4 => {
                let mut with_schema = vec![DEFAULT_SCHEMA_VERSION];
                with_schema.extend(segments);
                with_schema
            }
            found => bail!(
                "manifest id '{value}' has {found} segments, expected {ID_SEGMENTS} \
                 (schema:version:publisher:type:name)"
            ),
        };
        for (pos, segment) in segments.iter().enumerate() {
            if segment.trim().is_empty() {
                bail!("manifest id '{value}' has an empty segment at position {pos}");
            }
        }
        Ok(Self {
            schema_version: segments[0].to_string(),
            content_version: segments[1].to_string(),
            publisher: segments[2].to_string(),
            type_segment: segments[3].to_string(),
            name: segments[4].to_string(),
        })
    }

    #[must_use]
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    #[must_use]
    pub fn content_version(&self) -> &str {
        &self.content_version
    }

    #[must_use]
    pub fn publisher(&self) -> &str {
        &self.publisher
    }

    #[must_use]
    pub fn type_segment(&self) -> &str {
        &self.type_segment
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rebuild the same id with a different content version.
    #[must_use]
    pub fn with_content_version(&self, version: &str) -> Self {
        Self {
            content_version: version.to_string(),
            ..self.clone()
        }
    }

    fn lowered(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }
}

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}{sep}{}",
            self.schema_version,
            self.content_version,
            self.publisher,
            self.type_segment,
            self.name,
            sep = ID_SEPARATOR
        )
    }
}

impl FromStr for ManifestId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl TryFrom<String> for ManifestId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ManifestId> for String {
    fn from(id: ManifestId) -> Self {
        id.to_string()
    }
}

impl PartialEq for ManifestId {
    fn eq(&self, other: &Self) -> bool {
        self.schema_version
            .eq_ignore_ascii_case(&other.schema_version)
            && self
                .content_version
                .eq_ignore_ascii_case(&other.content_version)
            && self.publisher.eq_ignore_ascii_case(&other.publisher)
            && self.type_segment.eq_ignore_ascii_case(&other.type_segment)
            && self.name.eq_ignore_ascii_case(&other.name)
    }
}

impl Eq for ManifestId {}

impl Hash for ManifestId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.lowered().hash(state);
    }
}

impl PartialOrd for ManifestId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ManifestId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lowered().cmp(&other.lowered())
    }
}

/// Installable content categories, ordered by workspace precedence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    Mod,
    Map,
    Patch,
    Client,
}

impl ContentType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mod => "mod",
            Self::Map => "map",
            Self::Patch => "patch",
            Self::Client => "client",
        }
    }

    /// Legacy fallback: derive a content type from an id when the manifest
    /// carries no authoritative tag. Checks the id's type segment first,
    /// then `-map`/`-patch` style name suffixes.
    #[must_use]
    pub fn infer(id: &ManifestId) -> Option<Self> {
        if let Ok(parsed) = Self::try_from(id.type_segment()) {
            return Some(parsed);
        }
        let name = id.name().to_ascii_lowercase();
        [Self::Client, Self::Patch, Self::Map, Self::Mod]
            .into_iter()
            .find(|candidate| name.ends_with(&format!("-{}", candidate.as_str())))
    }
}

impl TryFrom<&str> for ContentType {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "mod" => Ok(Self::Mod),
            "map" => Ok(Self::Map),
            "patch" => Ok(Self::Patch),
            "client" => Ok(Self::Client),
            other => bail!("unknown content type '{other}'"),
        }
    }
}

/// Total order over content types used to resolve workspace file conflicts.
/// Higher rank wins. External input to the reconciler; the default ranking
/// puts clients above patches above maps above mods.
#[derive(Clone, Debug)]
pub struct PriorityTable {
    ranks: [(ContentType, u32); 4],
}

impl Default for PriorityTable {
    fn default() -> Self {
        Self {
            ranks: [
                (ContentType::Client, 40),
                (ContentType::Patch, 30),
                (ContentType::Map, 20),
                (ContentType::Mod, 10),
            ],
        }
    }
}

impl PriorityTable {
    #[must_use]
    pub fn rank(&self, content_type: ContentType) -> u32 {
        self.ranks
            .iter()
            .find(|(candidate, _)| *candidate == content_type)
            .map_or(0, |(_, rank)| *rank)
    }

    #[must_use]
    pub fn with_rank(mut self, content_type: ContentType, rank: u32) -> Self {
        for entry in &mut self.ranks {
            if entry.0 == content_type {
                entry.1 = rank;
            }
        }
        self
    }
}

/// Where a file's bytes come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileSource {
    Cas,
    DirectDownload,
}

/// Where a file is installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallTarget {
    Workspace,
    GameRoot,
}

/// How an assembled workspace materializes its files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AssemblyStrategy {
    Copy,
    Symlink,
    HardLink,
}

impl AssemblyStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Symlink => "symlink",
            Self::HardLink => "hard-link",
        }
    }
}

/// One file declared by a manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    /// Path relative to the install target root.
    pub path: String,
    /// Content address. Absent for files the publisher never hashed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    pub size: u64,
    pub source: FileSource,
    pub target: InstallTarget,
    #[serde(default)]
    pub executable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherInfo {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallInstructions {
    pub assembly: AssemblyStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Structured descriptor of one unit of installable content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentManifest {
    pub id: ManifestId,
    /// Authoritative content-type tag. Legacy manifests may omit it; see
    /// [`ContentManifest::effective_content_type`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<ContentType>,
    pub game: String,
    pub publisher: PublisherInfo,
    #[serde(default)]
    pub files: Vec<ManifestFile>,
    #[serde(default)]
    pub dependencies: Vec<ManifestId>,
    pub install: InstallInstructions,
}

impl ContentManifest {
    /// Two-tier content-type lookup: the tag is authoritative, id parsing is
    /// the legacy fallback, mods are the final default.
    #[must_use]
    pub fn effective_content_type(&self) -> ContentType {
        self.content_type
            .or_else(|| ContentType::infer(&self.id))
            .unwrap_or(ContentType::Mod)
    }

    /// Content addresses of every CAS-sourced file.
    #[must_use]
    pub fn cas_hashes(&self) -> BTreeSet<String> {
        self.files
            .iter()
            .filter(|file| file.source == FileSource::Cas)
            .filter_map(|file| file.sha256.clone())
            .collect()
    }

    /// Files destined for the assembled workspace.
    pub fn workspace_files(&self) -> impl Iterator<Item = &ManifestFile> {
        self.files
            .iter()
            .filter(|file| file.target == InstallTarget::Workspace)
    }
}
