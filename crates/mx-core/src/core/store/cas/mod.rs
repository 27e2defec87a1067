use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    env,
    fs::{self, File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use fs4::FileExt;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use mx_domain::ManifestId;

const OBJECTS_DIR: &str = "objects";
const LOCKS_DIR: &str = "locks";
const TMP_DIR: &str = "tmp";
const INDEX_FILENAME: &str = "index.sqlite";
const CAS_FORMAT_VERSION: u32 = 1;
const SCHEMA_VERSION: u32 = 1;
const META_KEY_CAS_FORMAT_VERSION: &str = "cas_format_version";
const META_KEY_SCHEMA_VERSION: &str = "schema_version";
const META_KEY_CREATED_BY: &str = "created_by_mx_version";
const MX_VERSION: &str = env!("CARGO_PKG_VERSION");

mod gc;
mod refs;
mod store_impl;

/// Errors surfaced by the CAS.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("[MX800] CAS object {hash} is missing")]
    MissingObject { hash: String },
    #[error("[MX800] CAS object {hash} digest mismatch (found {actual})")]
    DigestMismatch { hash: String, actual: String },
    #[error("[MX800] CAS object {hash} size mismatch (expected {expected}, found {found})")]
    SizeMismatch {
        hash: String,
        expected: u64,
        found: u64,
    },
    #[error("[MX800] invalid content hash '{0}'")]
    InvalidHash(String),
    #[error("[MX800] unknown consumer kind '{0}'")]
    UnknownConsumerKind(String),
    #[error("[MX810] CAS store write failed: {0}")]
    StoreWriteFailure(String),
    #[error("[MX811] CAS index is corrupt: {0}")]
    IndexCorrupt(String),
    #[error("[MX812] CAS metadata is missing required key '{0}'")]
    MissingMeta(String),
    #[error(
        "[MX812] CAS format/schema incompatible for {key}: expected {expected}, found {found}"
    )]
    IncompatibleFormat {
        key: String,
        expected: String,
        found: String,
    },
    #[error("[MX813] reference ledger write failed: {0}")]
    TrackingFailure(String),
}

impl StoreError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingObject { .. }
            | Self::DigestMismatch { .. }
            | Self::SizeMismatch { .. }
            | Self::InvalidHash(_)
            | Self::UnknownConsumerKind(_) => crate::core::tooling::diagnostics::cas::MISSING_OR_CORRUPT,
            Self::StoreWriteFailure(_) => {
                crate::core::tooling::diagnostics::cas::STORE_WRITE_FAILURE
            }
            Self::IndexCorrupt(_) => crate::core::tooling::diagnostics::cas::INDEX_CORRUPT,
            Self::MissingMeta(_) | Self::IncompatibleFormat { .. } => {
                crate::core::tooling::diagnostics::cas::FORMAT_INCOMPATIBLE
            }
            Self::TrackingFailure(_) => crate::core::tooling::diagnostics::cas::TRACKING_FAILURE,
        }
    }
}

/// High-level consumer categories that keep objects live.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsumerKind {
    Workspace,
    Manifest,
}

impl ConsumerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workspace => "workspace",
            Self::Manifest => "manifest",
        }
    }
}

impl TryFrom<&str> for ConsumerKind {
    type Error = StoreError;

    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        match value {
            "workspace" => Ok(Self::Workspace),
            "manifest" => Ok(Self::Manifest),
            other => Err(StoreError::UnknownConsumerKind(other.to_string())),
        }
    }
}

/// Concrete consumer identifier in the reference ledger.
///
/// Ids are normalized to lowercase so that track/untrack pairs match under
/// the case-insensitive id rules.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId {
    pub kind: ConsumerKind,
    pub id: String,
}

impl ConsumerId {
    #[must_use]
    pub fn manifest(id: &ManifestId) -> Self {
        Self {
            kind: ConsumerKind::Manifest,
            id: id.to_string().to_ascii_lowercase(),
        }
    }

    #[must_use]
    pub fn workspace(id: &str) -> Self {
        Self {
            kind: ConsumerKind::Workspace,
            id: id.to_ascii_lowercase(),
        }
    }
}

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Metadata persisted alongside an object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub hash: String,
    pub size: u64,
    pub created_at: u64,
    pub last_accessed: u64,
}

/// A stored object on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub hash: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcSummary {
    pub scanned: usize,
    pub reclaimed: usize,
    pub reclaimed_bytes: u64,
}

/// One consumer's slice of the reference ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerRefs {
    pub consumer: ConsumerId,
    pub hashes: BTreeSet<String>,
}

/// Full ledger snapshot for diagnostics: the live-hash union plus the
/// per-consumer breakdown it was computed from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAudit {
    pub live: BTreeSet<String>,
    pub consumers: Vec<ConsumerRefs>,
}

#[derive(Debug, Default)]
struct StoreHealth {
    index_validated: AtomicBool,
}

/// Content-addressable store persisting immutable blobs and the reference
/// ledger tying consumers to the hashes they depend on.
#[derive(Clone)]
pub struct ContentAddressableStore {
    root: PathBuf,
    health: Arc<StoreHealth>,
}

impl std::fmt::Debug for ContentAddressableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentAddressableStore")
            .field("root", &self.root)
            .field(
                "index_validated",
                &self.health.index_validated.load(Ordering::Relaxed),
            )
            .finish()
    }
}

/// Normalize a sha-256 hex digest, rejecting anything else.
pub(crate) fn normalize_hash(hash: &str) -> Result<String> {
    let lowered = hash.to_ascii_lowercase();
    if lowered.len() != 64 || !lowered.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StoreError::InvalidHash(hash.to_string()).into());
    }
    Ok(lowered)
}

fn store_write_error(err: anyhow::Error) -> anyhow::Error {
    if err.is::<StoreError>() {
        err
    } else {
        StoreError::StoreWriteFailure(err.to_string()).into()
    }
}

fn fsync_dir(dir: &Path) -> Result<()> {
    let file = File::open(dir)?;
    file.sync_all()?;
    Ok(())
}

fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn file_modified_secs(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .ok()?
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_secs())
}

fn default_root() -> Result<PathBuf> {
    if let Some(path) = env::var_os("MX_STORE_PATH") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs_next::home_dir().context("failed to resolve HOME for CAS")?;
    Ok(home.join(".mx").join("store"))
}

#[cfg(test)]
mod tests;
