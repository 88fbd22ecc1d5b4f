// src/lockfile/mod.rs

//! Lockfile for reproducible bakes
//!
//! The lockfile (`tdx.lock`) captures the recipe digest plus the resolved
//! identity of every external input, enabling frozen bakes that refuse to
//! resolve anything not already pinned.
//!
//! # Format
//!
//! TOML, version 1:
//!
//! ```toml
//! version = 1
//! recipe_digest = "sha256:..."
//!
//! [[module]]
//! name = "secret-delivery"
//! version = "0.3.0"
//! source = "builtin"
//! url = ""
//! integrity = ""
//!
//! [[fetch]]
//! url = "https://example.com/tool.tar.gz"
//! integrity = "sha256:..."
//! final_url = "https://cdn.example.com/tool.tar.gz"
//!
//! [[git]]
//! url = "https://example.com/repo.git"
//! requested_ref = "v1.2.0"
//! resolved_commit = "0123..."
//! tree_hash = "4567..."
//! ```

use crate::error::{Error, Result};
use crate::hash::canonical_digest;
use crate::models::{Fetch, FetchKind, RecipeState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Current lockfile format version.
pub const LOCKFILE_VERSION: u32 = 1;

/// Default lockfile name.
pub const LOCKFILE_NAME: &str = "tdx.lock";

/// A locked module (SDK-provided configuration bundle).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedModule {
    pub name: String,
    pub version: String,
    pub source: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub integrity: String,
}

/// A locked HTTP fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedFetch {
    pub url: String,
    pub integrity: String,
    #[serde(default)]
    pub final_url: String,
}

/// A locked git checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedGit {
    pub url: String,
    pub requested_ref: String,
    pub resolved_commit: String,
    pub tree_hash: String,
}

/// Lockfile root structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lockfile {
    pub version: u32,
    pub recipe_digest: String,
    #[serde(default, rename = "module")]
    pub modules: Vec<LockedModule>,
    #[serde(default, rename = "fetch")]
    pub fetches: Vec<LockedFetch>,
    #[serde(default, rename = "git")]
    pub gits: Vec<LockedGit>,
}

impl Lockfile {
    pub fn new(recipe_digest: impl Into<String>) -> Self {
        Self {
            version: LOCKFILE_VERSION,
            recipe_digest: recipe_digest.into(),
            modules: Vec::new(),
            fetches: Vec::new(),
            gits: Vec::new(),
        }
    }

    /// Parse from TOML, rejecting newer format versions.
    pub fn parse(content: &str) -> Result<Self> {
        let lockfile: Lockfile = toml::from_str(content).map_err(|e| {
            Error::lockfile(format!("Failed to parse lockfile: {e}")).with_operation("lock")
        })?;
        if lockfile.version > LOCKFILE_VERSION {
            return Err(Error::lockfile(format!(
                "Lockfile version {} is newer than supported version {LOCKFILE_VERSION}.",
                lockfile.version
            ))
            .with_hint("Upgrade the SDK or regenerate the lockfile.")
            .with_operation("lock"));
        }
        Ok(lockfile)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            Error::lockfile(format!("Failed to serialize lockfile: {e}")).with_operation("lock")
        })
    }

    pub fn read_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|_| {
            Error::lockfile(format!("Lockfile does not exist at {}.", path.display()))
                .with_hint("Run lock() before using frozen mode.")
                .with_operation("lock")
        })?;
        Self::parse(&content)
    }

    /// Atomic write: temp file in the same directory, then rename.
    pub fn write_file(&self, path: &Path) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = self.to_toml()?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(content.as_bytes())?;
        temp.persist(path)
            .map_err(|e| Error::lockfile(format!("Failed to persist lockfile: {e}")).with_operation("lock"))?;
        info!(path = %path.display(), "lockfile written");
        Ok(path.to_path_buf())
    }

    /// All URLs covered by this lockfile (for locked network mode).
    pub fn locked_urls(&self) -> BTreeSet<String> {
        let mut urls: BTreeSet<String> = self.fetches.iter().map(|f| f.url.clone()).collect();
        urls.extend(self.gits.iter().map(|g| g.url.clone()));
        urls
    }

    /// Whether a declared fetch has a lock entry.
    pub fn covers(&self, fetch: &Fetch) -> bool {
        match fetch.kind {
            FetchKind::Http => self.fetches.iter().any(|f| f.url == fetch.url),
            FetchKind::Git => self.gits.iter().any(|g| g.url == fetch.url),
        }
    }

    /// Frozen-mode staleness check against the current recipe digest and
    /// declared fetches.
    pub fn assert_fresh(&self, current_digest: &str, fetches: &[Fetch]) -> Result<()> {
        if self.recipe_digest != current_digest {
            return Err(Error::lockfile("Lockfile is stale for the current recipe state.")
                .with_hint("Re-run lock() and commit the updated lockfile.")
                .with_operation("bake"));
        }
        for fetch in fetches {
            if !self.covers(fetch) {
                return Err(Error::lockfile(format!(
                    "Fetch of `{}` has no lockfile entry.",
                    fetch.url
                ))
                .with_hint("Re-run lock() so every external input is pinned.")
                .with_operation("bake"));
            }
        }
        Ok(())
    }
}

/// SHA-256 digest of the recipe state's canonical JSON, prefixed `sha256:`.
pub fn recipe_digest(state: &RecipeState) -> Result<String> {
    Ok(format!("sha256:{}", canonical_digest(state)?))
}
