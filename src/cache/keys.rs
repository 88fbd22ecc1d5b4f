// src/cache/keys.rs

//! Canonical cache-key derivation

use crate::error::Result;
use crate::hash::canonical_digest;
use crate::models::Arch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Every input that can change a built artifact. Two inputs differing in
/// any field produce different keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildCacheInput {
    pub builder: String,
    pub src_tree_hash: String,
    pub toolchain: String,
    pub target_arch: Arch,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub build_deps: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub sdk_version: Option<String>,
}

/// SHA-256 of the canonical JSON serialization of the inputs.
pub fn cache_key(inputs: &BuildCacheInput) -> Result<String> {
    canonical_digest(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> BuildCacheInput {
        BuildCacheInput {
            builder: "go".to_string(),
            src_tree_hash: "a".repeat(40),
            toolchain: "go1.22.3".to_string(),
            target_arch: Arch::X86_64,
            flags: vec!["-trimpath".to_string()],
            build_deps: vec!["golang".to_string()],
            env: BTreeMap::new(),
            sdk_version: None,
        }
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        let key_a = cache_key(&base_input()).unwrap();
        let key_b = cache_key(&base_input()).unwrap();
        assert_eq!(key_a, key_b);
        assert_eq!(key_a.len(), 64);
    }

    #[test]
    fn test_cache_key_changes_with_every_input() {
        let base = cache_key(&base_input()).unwrap();

        let mut builder = base_input();
        builder.builder = "rust".to_string();
        assert_ne!(cache_key(&builder).unwrap(), base);

        let mut tree = base_input();
        tree.src_tree_hash = "b".repeat(40);
        assert_ne!(cache_key(&tree).unwrap(), base);

        let mut toolchain = base_input();
        toolchain.toolchain = "go1.21.0".to_string();
        assert_ne!(cache_key(&toolchain).unwrap(), base);

        let mut arch = base_input();
        arch.target_arch = Arch::Aarch64;
        assert_ne!(cache_key(&arch).unwrap(), base);

        let mut flags = base_input();
        flags.flags.push("-race".to_string());
        assert_ne!(cache_key(&flags).unwrap(), base);

        let mut deps = base_input();
        deps.build_deps.push("git".to_string());
        assert_ne!(cache_key(&deps).unwrap(), base);

        let mut env = base_input();
        env.env.insert("CGO_ENABLED".to_string(), "0".to_string());
        assert_ne!(cache_key(&env).unwrap(), base);

        let mut sdk = base_input();
        sdk.sdk_version = Some("8.0".to_string());
        assert_ne!(cache_key(&sdk).unwrap(), base);
    }

    #[test]
    fn test_cache_key_env_order_insensitive() {
        let mut a = base_input();
        a.env.insert("A".to_string(), "1".to_string());
        a.env.insert("B".to_string(), "2".to_string());
        let mut b = base_input();
        b.env.insert("B".to_string(), "2".to_string());
        b.env.insert("A".to_string(), "1".to_string());
        assert_eq!(cache_key(&a).unwrap(), cache_key(&b).unwrap());
    }
}
