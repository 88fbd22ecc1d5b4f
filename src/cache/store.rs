// src/cache/store.rs

//! On-disk cache store with manifest verification and atomic inserts
//!
//! Writers stage a complete entry (artifact files + manifest) in a
//! temporary directory and rename it into the final key path, so readers
//! never observe a partial entry. Readers verify the stored manifest inputs
//! against the current inputs byte-for-byte; a mismatch is a miss, never a
//! silent reuse.

use crate::cache::keys::{cache_key, BuildCacheInput};
use crate::error::{Error, Result};
use crate::hash::{canonical_json, hash_file};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MANIFEST_NAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Manifest {
    key: String,
    inputs: BuildCacheInput,
    /// File name -> sha256.
    files: BTreeMap<String, String>,
}

/// A cache hit: the entry directory plus its verified artifact files.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub path: PathBuf,
    /// File name -> absolute path.
    pub files: BTreeMap<String, PathBuf>,
}

/// Content-addressed artifact store rooted at a cache directory.
#[derive(Debug, Clone)]
pub struct BuildCacheStore {
    root: PathBuf,
}

impl BuildCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entry directory for a key: `<root>/<first-2-hex>/<key>/`.
    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(&key[..2]).join(key)
    }

    /// Look up an entry. Returns `None` on miss, including the case where
    /// a stored manifest does not match the current inputs.
    pub fn load(&self, inputs: &BuildCacheInput) -> Result<Option<CacheEntry>> {
        let key = cache_key(inputs)?;
        let entry = self.entry_path(&key);
        let manifest_path = entry.join(MANIFEST_NAME);
        if !manifest_path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&manifest_path)?;
        let manifest: Manifest = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(key, error = %e, "cache manifest is not valid JSON; treating as miss");
                return Ok(None);
            }
        };

        // Byte-for-byte input comparison via canonical JSON.
        if manifest.key != key || canonical_json(&manifest.inputs)? != canonical_json(inputs)? {
            warn!(key, "cache manifest inputs do not match; treating as miss");
            return Ok(None);
        }

        let mut files = BTreeMap::new();
        for (name, expected_digest) in &manifest.files {
            let file_path = entry.join(name);
            if !file_path.exists() {
                warn!(key, file = %name, "cache entry file missing; treating as miss");
                return Ok(None);
            }
            let actual = hash_file(&file_path)?;
            if &actual != expected_digest {
                return Err(Error::reproducibility(format!(
                    "Cache artifact `{name}` digest mismatch under key {key}."
                ))
                .with_hint("Invalidate the cache entry and rebuild.")
                .with_operation("cache_load"));
            }
            files.insert(name.clone(), file_path);
        }

        debug!(key, files = files.len(), "cache hit");
        Ok(Some(CacheEntry {
            key,
            path: entry,
            files,
        }))
    }

    /// Insert artifacts under the key derived from `inputs`. Staging is
    /// done in a temp dir that is renamed into place.
    pub fn save(&self, inputs: &BuildCacheInput, artifacts: &BTreeMap<String, Vec<u8>>) -> Result<String> {
        let key = cache_key(inputs)?;
        let entry = self.entry_path(&key);
        if entry.exists() {
            debug!(key, "cache entry already present");
            return Ok(key);
        }
        let shard = self.root.join(&key[..2]);
        fs::create_dir_all(&shard)?;

        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&shard)?;
        let mut files = BTreeMap::new();
        for (name, payload) in artifacts {
            let file_path = staging.path().join(name);
            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&file_path, payload)?;
            files.insert(name.clone(), crate::hash::hash_bytes(payload));
        }

        let manifest = Manifest {
            key: key.clone(),
            inputs: inputs.clone(),
            files,
        };
        let manifest_json = serde_json::to_string_pretty(&manifest).map_err(|e| {
            Error::validation(format!("Failed to serialize cache manifest: {e}"))
                .with_operation("cache_save")
        })?;
        fs::write(staging.path().join(MANIFEST_NAME), manifest_json + "\n")?;

        match fs::rename(staging.into_path(), &entry) {
            Ok(()) => {}
            // A concurrent writer published the same key first; their entry
            // is equivalent by construction.
            Err(_) if entry.exists() => {}
            Err(e) => return Err(e.into()),
        }
        debug!(key, "cache entry stored");
        Ok(key)
    }
}
