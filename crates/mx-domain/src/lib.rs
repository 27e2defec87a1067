#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod manifest;
pub mod profile;
pub mod workspace;

pub use manifest::{
    AssemblyStrategy, ContentManifest, ContentType, FileSource, InstallInstructions,
    InstallTarget, ManifestFile, ManifestId, PriorityTable, PublisherInfo,
    DEFAULT_SCHEMA_VERSION,
};
pub use profile::{Profile, ProfileChanges};
pub use workspace::{ManifestPin, WorkspaceInfo};
