use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

const DEFAULT_GC_GRACE_SECS: u64 = 86_400;

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn flag_is_enabled(&self, key: &str) -> bool {
        matches!(
            self.vars.get(key).map(String::as_str),
            Some("1") | Some("true")
        )
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// Garbage-collection policy.
#[derive(Debug, Clone)]
pub struct GcConfig {
    pub disabled: bool,
    /// Minimum age before an unreferenced object becomes eligible.
    pub grace: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            grace: Duration::from_secs(DEFAULT_GC_GRACE_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_root: PathBuf,
    pub library_root: PathBuf,
    pub audit_log: PathBuf,
    pub gc: GcConfig,
}

impl Config {
    /// Builds a configuration snapshot from the current process environment.
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be resolved.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let home = || {
            dirs_next::home_dir()
                .context("failed to resolve HOME for mx")
                .map(|home| home.join(".mx"))
        };
        let store_root = match snapshot.var("MX_STORE_PATH") {
            Some(path) => PathBuf::from(path),
            None => home()?.join("store"),
        };
        let library_root = match snapshot.var("MX_LIBRARY_PATH") {
            Some(path) => PathBuf::from(path),
            None => home()?.join("library"),
        };
        let audit_log = match snapshot.var("MX_AUDIT_LOG") {
            Some(path) => PathBuf::from(path),
            None => home()?.join("audit.jsonl"),
        };
        let grace_secs = snapshot
            .var("MX_GC_GRACE_SECS")
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_GC_GRACE_SECS);
        Ok(Self {
            store_root,
            library_root,
            audit_log,
            gc: GcConfig {
                disabled: snapshot.flag_is_enabled("MX_GC_DISABLE"),
                grace: Duration::from_secs(grace_secs),
            },
        })
    }
}
