// src/hash.rs

//! SHA-256 helpers and canonical-JSON digests
//!
//! Everything that influences build outputs is digested through this module
//! so the recipe digest, cache keys, and integrity checks all agree on one
//! canonical form: compact JSON with lexicographically sorted object keys,
//! hashed with SHA-256 and rendered as lowercase hex.

use crate::error::{Error, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io;
use std::path::Path;

/// SHA-256 over raw bytes, as lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 over a string, as lowercase hex.
pub fn hash_str(data: &str) -> String {
    hash_bytes(data.as_bytes())
}

/// SHA-256 over a file's contents, streamed.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Serialize a value to canonical JSON: compact separators, sorted keys.
///
/// `serde_json`'s default map representation keeps keys sorted, so any
/// value built from `BTreeMap`s (or plain structs) serializes canonically.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| {
        Error::validation(format!("Failed to serialize canonical JSON: {e}"))
            .with_operation("canonical_json")
    })
}

/// SHA-256 of a value's canonical JSON form, as lowercase hex.
pub fn canonical_digest<T: Serialize>(value: &T) -> Result<String> {
    Ok(hash_str(&canonical_json(value)?))
}

/// Verify a file matches an expected SHA-256 hex digest.
pub fn verify_file(path: &Path, expected: &str) -> Result<()> {
    let actual = hash_file(path)?;
    if actual != expected {
        return Err(Error::reproducibility(format!(
            "Digest mismatch for {}: expected {expected}, got {actual}",
            path.display()
        ))
        .with_hint("Clear the cached artifact and refetch from a trusted source.")
        .with_operation("verify_file"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_hash_bytes_known_vector() {
        // sha256("hi\n")
        assert_eq!(
            hash_bytes(b"hi\n"),
            "98ea6e4f216f2fb4b69fff9b3a44842c38686ca685f3f55dc48c5d3fb1107be4"
        );
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let mut map = BTreeMap::new();
        map.insert("zeta", 1);
        map.insert("alpha", 2);
        assert_eq!(canonical_json(&map).unwrap(), r#"{"alpha":2,"zeta":1}"#);
    }

    #[test]
    fn test_canonical_digest_is_order_insensitive_for_maps() {
        let mut a = BTreeMap::new();
        a.insert("x", "1");
        a.insert("y", "2");
        let mut b = BTreeMap::new();
        b.insert("y", "2");
        b.insert("x", "1");
        assert_eq!(canonical_digest(&a).unwrap(), canonical_digest(&b).unwrap());
    }

    #[test]
    fn test_verify_file_detects_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact");
        std::fs::write(&path, b"payload").unwrap();

        let good = hash_bytes(b"payload");
        assert!(verify_file(&path, &good).is_ok());

        let err = verify_file(&path, "0000").unwrap_err();
        assert_eq!(err.code(), "E_REPRODUCIBILITY");
    }
}
