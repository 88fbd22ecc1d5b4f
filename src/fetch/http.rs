// src/fetch/http.rs

//! HTTP artifact fetch with mandatory integrity verification
//!
//! Downloads are staged to a temporary path and renamed into a
//! content-addressed cache keyed by the artifact's SHA-256. Cached entries
//! are re-verified before reuse. The final URL after redirects is captured
//! so the lockfile can record where the bytes actually came from.

use crate::error::{Error, Result};
use crate::hash::hash_bytes;
use crate::policy::{ensure_integrity_present, ensure_network_allowed, Policy};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Outcome of a resolved HTTP fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFetchResult {
    /// Content-addressed path of the verified artifact.
    pub path: PathBuf,
    /// SHA-256 of the artifact bytes.
    pub sha256: String,
    /// URL after following redirects.
    pub final_url: String,
}

/// Fetch `url`, verify it against `sha256`, and return the cached path.
///
/// With an empty `sha256` the fetch is only permitted when
/// `policy.require_integrity` is relaxed; the artifact is then cached
/// under its observed digest.
pub fn fetch_http(
    url: &str,
    sha256: &str,
    cache_dir: &Path,
    policy: &Policy,
    locked_urls: Option<&BTreeSet<String>>,
) -> Result<HttpFetchResult> {
    ensure_network_allowed(policy, "fetch_http", url, locked_urls)?;
    ensure_integrity_present(
        policy,
        "fetch_http",
        url,
        if sha256.is_empty() { None } else { Some(sha256) },
    )?;

    fs::create_dir_all(cache_dir)?;

    if !sha256.is_empty() {
        let cached = cache_dir.join(sha256);
        if cached.exists() {
            debug!(url, path = %cached.display(), "using cached http artifact");
            assert_cached_digest(&cached, sha256)?;
            return Ok(HttpFetchResult {
                path: cached,
                sha256: sha256.to_string(),
                final_url: url.to_string(),
            });
        }
    }

    info!(url, "downloading");
    let (payload, final_url) = download(url)?;

    let actual = hash_bytes(&payload);
    if !sha256.is_empty() && actual != sha256 {
        return Err(Error::reproducibility(format!(
            "Fetched content hash mismatch for {url}: expected {sha256}, got {actual}"
        ))
        .with_hint("Update the expected hash or point at a trusted immutable artifact.")
        .with_operation("fetch_http"));
    }

    let artifact_path = cache_dir.join(&actual);
    if !artifact_path.exists() {
        let temp_path = cache_dir.join(format!("{actual}.tmp"));
        fs::write(&temp_path, &payload)?;
        fs::rename(&temp_path, &artifact_path)?;
    }

    Ok(HttpFetchResult {
        path: artifact_path,
        sha256: actual,
        final_url,
    })
}

fn download(url: &str) -> Result<(Vec<u8>, String)> {
    // file:// is supported for hermetic tests and pre-staged mirrors.
    if let Some(path) = url.strip_prefix("file://") {
        let payload = fs::read(path)?;
        return Ok((payload, url.to_string()));
    }

    let client = reqwest::blocking::Client::builder()
        .build()
        .map_err(|e| Error::backend(format!("Failed to build http client: {e}")).with_operation("fetch_http"))?;
    let response = client
        .get(url)
        .send()
        .map_err(|e| Error::backend(format!("Failed to fetch {url}: {e}")).with_operation("fetch_http"))?;
    let final_url = response.url().to_string();
    if !response.status().is_success() {
        return Err(Error::backend(format!(
            "Fetch of {url} failed with status {}",
            response.status()
        ))
        .with_operation("fetch_http"));
    }
    let payload = response
        .bytes()
        .map_err(|e| Error::backend(format!("Failed to read body of {url}: {e}")).with_operation("fetch_http"))?
        .to_vec();
    Ok((payload, final_url))
}

fn assert_cached_digest(path: &Path, expected: &str) -> Result<()> {
    let payload = fs::read(path)?;
    let actual = hash_bytes(&payload);
    if actual != expected {
        return Err(Error::reproducibility(format!(
            "Cached artifact hash mismatch at {}: expected {expected}, got {actual}",
            path.display()
        ))
        .with_hint("Clear the cache entry and refetch with trusted inputs.")
        .with_operation("fetch_http"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::NetworkMode;

    fn file_url(path: &Path) -> String {
        format!("file://{}", path.display())
    }

    #[test]
    fn test_fetch_verifies_and_caches_by_digest() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        fs::write(&source, b"payload").unwrap();
        let digest = hash_bytes(b"payload");

        let cache = dir.path().join("cache");
        let result =
            fetch_http(&file_url(&source), &digest, &cache, &Policy::default(), None).unwrap();
        assert_eq!(result.sha256, digest);
        assert_eq!(result.path, cache.join(&digest));
        assert!(result.path.exists());

        // Second fetch hits the cache
        let again =
            fetch_http(&file_url(&source), &digest, &cache, &Policy::default(), None).unwrap();
        assert_eq!(again.path, result.path);
    }

    #[test]
    fn test_fetch_rejects_hash_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        fs::write(&source, b"payload").unwrap();

        let err = fetch_http(
            &file_url(&source),
            &"0".repeat(64),
            &dir.path().join("cache"),
            &Policy::default(),
            None,
        )
        .unwrap_err();
        assert_eq!(err.code(), "E_REPRODUCIBILITY");
    }

    #[test]
    fn test_fetch_without_integrity_requires_relaxed_policy() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        fs::write(&source, b"payload").unwrap();

        let strict_err = fetch_http(
            &file_url(&source),
            "",
            &dir.path().join("cache"),
            &Policy::default(),
            None,
        )
        .unwrap_err();
        assert_eq!(strict_err.code(), "E_POLICY");

        let relaxed = Policy {
            require_integrity: false,
            ..Default::default()
        };
        let result = fetch_http(
            &file_url(&source),
            "",
            &dir.path().join("cache-relaxed"),
            &relaxed,
            None,
        )
        .unwrap();
        assert_eq!(result.sha256, hash_bytes(b"payload"));
    }

    #[test]
    fn test_offline_mode_blocks_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.bin");
        fs::write(&source, b"payload").unwrap();
        let policy = Policy {
            network_mode: NetworkMode::Offline,
            ..Default::default()
        };

        let err = fetch_http(
            &file_url(&source),
            &hash_bytes(b"payload"),
            &dir.path().join("cache"),
            &policy,
            None,
        )
        .unwrap_err();
        assert_eq!(err.code(), "E_POLICY");
    }
}
