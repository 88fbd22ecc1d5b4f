// src/policy.rs

//! Policy engine gating network, integrity, and lock decisions
//!
//! A single [`Policy`] value rides on the `Image` and is consulted at every
//! side-effecting operation. Every decision (allow or deny) is logged with
//! the operation, the policy option consulted, and the reason, so CI logs
//! show exactly why a bake was refused.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// How git refs that are not commit SHAs are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MutableRefPolicy {
    #[default]
    Warn,
    Error,
    Allow,
}

/// Network access mode for fetch resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Online,
    /// All network access is refused.
    Offline,
    /// Only URLs already present in the lockfile may be fetched.
    Locked,
}

/// Central policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Refuse `bake()` unless invoked with `frozen=true`.
    pub require_frozen_lock: bool,
    pub mutable_ref_policy: MutableRefPolicy,
    /// Reject HTTP fetches without an explicit integrity value.
    pub require_integrity: bool,
    pub network_mode: NetworkMode,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            require_frozen_lock: false,
            mutable_ref_policy: MutableRefPolicy::Warn,
            require_integrity: true,
            network_mode: NetworkMode::Online,
        }
    }
}

impl Policy {
    /// Strictest preset: frozen lock, integrity, pinned refs, locked network.
    pub fn strict() -> Self {
        Self {
            require_frozen_lock: true,
            mutable_ref_policy: MutableRefPolicy::Error,
            require_integrity: true,
            network_mode: NetworkMode::Locked,
        }
    }
}

fn log_decision(operation: &str, policy_option: &str, decision: &str, reason: &str) {
    if decision == "deny" {
        warn!(operation, policy_option, decision, reason, "policy decision");
    } else {
        info!(operation, policy_option, decision, reason, "policy decision");
    }
}

/// Enforce `require_frozen_lock` at bake time.
pub fn ensure_bake_allowed(policy: &Policy, frozen: bool) -> Result<()> {
    if policy.require_frozen_lock && !frozen {
        log_decision("bake", "require_frozen_lock", "deny", "frozen flag not set");
        return Err(Error::policy("Frozen lock mode is required by policy.")
            .with_hint("Call bake with frozen=true or relax policy.require_frozen_lock.")
            .with_operation("bake"));
    }
    log_decision("bake", "require_frozen_lock", "allow", "frozen requirement satisfied");
    Ok(())
}

/// Enforce the network mode for a fetch of `url`. In `Locked` mode the
/// caller passes the set of URLs present in the lockfile.
pub fn ensure_network_allowed(
    policy: &Policy,
    operation: &str,
    url: &str,
    locked_urls: Option<&BTreeSet<String>>,
) -> Result<()> {
    match policy.network_mode {
        NetworkMode::Online => {
            log_decision(operation, "network_mode", "allow", "network_mode=online");
            Ok(())
        }
        NetworkMode::Offline => {
            log_decision(operation, "network_mode", "deny", "network_mode=offline");
            Err(Error::policy("Network operations are disabled by policy.")
                .with_hint("Switch policy.network_mode to online for this operation.")
                .with_operation(operation))
        }
        NetworkMode::Locked => {
            let allowed = locked_urls.map(|urls| urls.contains(url)).unwrap_or(false);
            if allowed {
                log_decision(operation, "network_mode", "allow", "url present in lockfile");
                Ok(())
            } else {
                log_decision(operation, "network_mode", "deny", "url absent from lockfile");
                Err(Error::policy(format!(
                    "Locked network mode permits only lockfile URLs; `{url}` is not locked."
                ))
                .with_hint("Run lock() while online, or switch network_mode to online.")
                .with_operation(operation))
            }
        }
    }
}

/// Enforce `require_integrity` for an HTTP fetch.
pub fn ensure_integrity_present(policy: &Policy, operation: &str, url: &str, integrity: Option<&str>) -> Result<()> {
    if integrity.map(|v| !v.is_empty()).unwrap_or(false) {
        log_decision(operation, "require_integrity", "allow", "integrity value present");
        return Ok(());
    }
    if !policy.require_integrity {
        log_decision(operation, "require_integrity", "allow", "integrity requirement relaxed");
        return Ok(());
    }
    log_decision(operation, "require_integrity", "deny", "integrity value missing");
    Err(Error::policy(format!("Fetch of `{url}` has no integrity value."))
        .with_hint("Pin an expected sha256, or relax policy.require_integrity.")
        .with_operation(operation))
}

/// Enforce `mutable_ref_policy` for a git ref that is not a commit SHA.
pub fn ensure_ref_allowed(policy: &Policy, operation: &str, reference: &str, mutable: bool) -> Result<()> {
    if !mutable {
        log_decision(operation, "mutable_ref_policy", "allow", "ref is an immutable commit");
        return Ok(());
    }
    match policy.mutable_ref_policy {
        MutableRefPolicy::Allow => {
            log_decision(operation, "mutable_ref_policy", "allow", "mutable refs allowed");
            Ok(())
        }
        MutableRefPolicy::Warn => {
            log_decision(operation, "mutable_ref_policy", "allow", "mutable ref warned");
            warn!(
                operation,
                reference, "mutable git ref requested; result is not inherently reproducible"
            );
            Ok(())
        }
        MutableRefPolicy::Error => {
            log_decision(operation, "mutable_ref_policy", "deny", "mutable refs forbidden");
            Err(Error::policy(format!(
                "Mutable git ref `{reference}` is not allowed by policy."
            ))
            .with_hint("Use a full 40-char commit SHA or relax mutable_ref_policy.")
            .with_operation(operation))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_permissive_but_integral() {
        let policy = Policy::default();
        assert!(!policy.require_frozen_lock);
        assert!(policy.require_integrity);
        assert_eq!(policy.network_mode, NetworkMode::Online);
    }

    #[test]
    fn test_require_frozen_lock_rejects_unfrozen_bake() {
        let policy = Policy {
            require_frozen_lock: true,
            ..Default::default()
        };
        let err = ensure_bake_allowed(&policy, false).unwrap_err();
        assert_eq!(err.code(), "E_POLICY");
        assert!(ensure_bake_allowed(&policy, true).is_ok());
    }

    #[test]
    fn test_offline_mode_blocks_all_urls() {
        let policy = Policy {
            network_mode: NetworkMode::Offline,
            ..Default::default()
        };
        let err = ensure_network_allowed(&policy, "fetch", "https://example.com/x", None).unwrap_err();
        assert_eq!(err.code(), "E_POLICY");
    }

    #[test]
    fn test_locked_mode_permits_only_lockfile_urls() {
        let policy = Policy {
            network_mode: NetworkMode::Locked,
            ..Default::default()
        };
        let mut locked = BTreeSet::new();
        locked.insert("https://example.com/pinned.tar.gz".to_string());

        assert!(ensure_network_allowed(
            &policy,
            "fetch",
            "https://example.com/pinned.tar.gz",
            Some(&locked)
        )
        .is_ok());
        assert!(ensure_network_allowed(
            &policy,
            "fetch",
            "https://example.com/other.tar.gz",
            Some(&locked)
        )
        .is_err());
    }

    #[test]
    fn test_integrity_requirement() {
        let policy = Policy::default();
        assert!(ensure_integrity_present(&policy, "fetch", "u", Some("abc")).is_ok());
        assert!(ensure_integrity_present(&policy, "fetch", "u", None).is_err());
        assert!(ensure_integrity_present(&policy, "fetch", "u", Some("")).is_err());

        let relaxed = Policy {
            require_integrity: false,
            ..Default::default()
        };
        assert!(ensure_integrity_present(&relaxed, "fetch", "u", None).is_ok());
    }

    #[test]
    fn test_mutable_ref_policy_modes() {
        let warn = Policy::default();
        assert!(ensure_ref_allowed(&warn, "fetch_git", "main", true).is_ok());

        let error = Policy {
            mutable_ref_policy: MutableRefPolicy::Error,
            ..Default::default()
        };
        assert!(ensure_ref_allowed(&error, "fetch_git", "main", true).is_err());
        // Immutable refs always pass
        assert!(ensure_ref_allowed(&error, "fetch_git", &"a".repeat(40), false).is_ok());
    }
}
