// src/fetch/git.rs

//! Git fetch with immutable resolution and tree-hash verification
//!
//! Refs are resolved to a commit with `git ls-remote`, checkouts are cached
//! under `<commit>-<tree>` and re-verified on reuse. A ref that is neither
//! a full commit SHA nor a tag is a *mutable ref* (branch, `HEAD`, `main`,
//! `master`) and is subject to the mutable-ref policy.

use crate::error::{Error, Result};
use crate::policy::{ensure_network_allowed, ensure_ref_allowed, Policy};
use regex::Regex;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use tracing::{debug, info};

/// Outcome of a resolved git fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitFetchResult {
    /// Cached checkout path, keyed `<commit>-<tree>`.
    pub path: PathBuf,
    pub commit: String,
    pub tree_hash: String,
    /// Whether the requested ref was mutable (branch/HEAD).
    pub mutable_ref: bool,
}

fn commit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[0-9a-f]{40}$").unwrap())
}

/// Whether `reference` is a full 40-char commit SHA.
pub fn is_commit_sha(reference: &str) -> bool {
    commit_pattern().is_match(reference)
}

/// Fetch git content, verify the tree hash, and cache by commit identity.
///
/// `expected_tree_hash=None` is accepted only when integrity is relaxed by
/// policy; the resolved tree hash is returned either way so the caller can
/// pin it into the lockfile.
pub fn fetch_git(
    repo: &str,
    reference: &str,
    expected_tree_hash: Option<&str>,
    cache_dir: &Path,
    policy: &Policy,
    locked_urls: Option<&BTreeSet<String>>,
) -> Result<GitFetchResult> {
    ensure_network_allowed(policy, "fetch_git", repo, locked_urls)?;
    if reference.is_empty() {
        return Err(Error::validation("fetch_git requires a ref.").with_operation("fetch_git"));
    }
    let expected_tree = expected_tree_hash.unwrap_or("");
    if expected_tree.is_empty() && policy.require_integrity {
        return Err(Error::validation(
            "fetch_git requires an expected tree hash when integrity policy is enabled.",
        )
        .with_hint("Pin the tree hash, or relax policy.require_integrity.")
        .with_operation("fetch_git"));
    }

    let (resolved_commit, mutable_ref) = resolve_commit(repo, reference)?;
    ensure_ref_allowed(policy, "fetch_git", reference, mutable_ref)?;

    fs::create_dir_all(cache_dir)?;
    if !expected_tree.is_empty() {
        let cached = cache_dir.join(format!("{resolved_commit}-{expected_tree}"));
        if cached.exists() {
            verify_cached_checkout(&cached, &resolved_commit, expected_tree)?;
            debug!(repo, commit = %resolved_commit, "using cached git checkout");
            return Ok(GitFetchResult {
                path: cached,
                commit: resolved_commit,
                tree_hash: expected_tree.to_string(),
                mutable_ref,
            });
        }
    }

    info!(repo, reference, commit = %resolved_commit, "cloning");
    let staging = tempfile::Builder::new()
        .prefix("tdxvm-git-")
        .tempdir_in(cache_dir)?;
    run_git(&["clone", "--quiet", repo, "."], Some(staging.path()))?;
    run_git(&["checkout", "--quiet", &resolved_commit], Some(staging.path()))?;
    let actual_tree = run_git(&["rev-parse", "HEAD^{tree}"], Some(staging.path()))?;

    if !expected_tree.is_empty() && actual_tree != expected_tree {
        return Err(Error::reproducibility(format!(
            "Git tree hash mismatch for {repo}@{reference}: expected {expected_tree}, got {actual_tree}"
        ))
        .with_hint("Pin the expected tree hash to the resolved immutable revision.")
        .with_operation("fetch_git"));
    }

    let final_path = cache_dir.join(format!("{resolved_commit}-{actual_tree}"));
    if final_path.exists() {
        verify_cached_checkout(&final_path, &resolved_commit, &actual_tree)?;
    } else {
        // Atomic publish: the staging dir moves into its final key path.
        fs::rename(staging.into_path(), &final_path)?;
    }

    Ok(GitFetchResult {
        path: final_path,
        commit: resolved_commit,
        tree_hash: actual_tree,
        mutable_ref,
    })
}

/// Resolve a ref to a commit. Returns `(commit, mutable_ref)`.
fn resolve_commit(repo: &str, reference: &str) -> Result<(String, bool)> {
    if is_commit_sha(reference) {
        return Ok((reference.to_string(), false));
    }

    let output = run_git(&["ls-remote", repo, reference], None)?;
    let mut resolved: Option<(String, String)> = None;
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        if let (Some(commit), Some(name)) = (fields.next(), fields.next()) {
            resolved = Some((commit.to_string(), name.to_string()));
            break;
        }
    }
    let (commit, ref_name) = resolved.ok_or_else(|| {
        Error::validation(format!("Unable to resolve git ref `{reference}` in {repo}."))
            .with_hint("Ensure the repository and ref are valid and reachable.")
            .with_operation("fetch_git")
    })?;

    // Tags are immutable identities; branches and HEAD are not.
    let mutable = !ref_name.starts_with("refs/tags/");
    Ok((commit, mutable))
}

fn verify_cached_checkout(path: &Path, commit: &str, tree_hash: &str) -> Result<()> {
    let cached_commit = run_git(&["rev-parse", "HEAD"], Some(path))?;
    let cached_tree = run_git(&["rev-parse", "HEAD^{tree}"], Some(path))?;
    if cached_commit != commit || cached_tree != tree_hash {
        return Err(Error::reproducibility(format!(
            "Cached git checkout at {} does not match expected commit/tree.",
            path.display()
        ))
        .with_hint("Delete the cache entry and refetch the immutable source.")
        .with_operation("fetch_git"));
    }
    Ok(())
}

fn run_git(argv: &[&str], cwd: Option<&Path>) -> Result<String> {
    let mut command = Command::new("git");
    command.args(argv);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    let output = command
        .output()
        .map_err(|e| Error::backend(format!("Failed to spawn git: {e}")).with_operation("fetch_git"))?;
    if !output.status.success() {
        return Err(Error::validation(format!(
            "git {} failed: {}",
            argv.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ))
        .with_hint("Inspect repository/ref inputs and the git installation.")
        .with_operation("fetch_git"));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::MutableRefPolicy;

    fn create_repo(path: &Path) -> (String, String) {
        fs::create_dir_all(path).unwrap();
        for args in [
            vec!["init", "--quiet"],
            vec!["checkout", "--quiet", "-b", "main"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
        ] {
            run_git(&args, Some(path)).unwrap();
        }
        fs::write(path.join("README.md"), "hello repo\n").unwrap();
        run_git(&["add", "README.md"], Some(path)).unwrap();
        run_git(&["commit", "--quiet", "-m", "initial"], Some(path)).unwrap();
        let commit = run_git(&["rev-parse", "HEAD"], Some(path)).unwrap();
        let tree = run_git(&["rev-parse", "HEAD^{tree}"], Some(path)).unwrap();
        (commit, tree)
    }

    #[test]
    fn test_commit_sha_detection() {
        assert!(is_commit_sha(&"a".repeat(40)));
        assert!(!is_commit_sha("main"));
        assert!(!is_commit_sha("v1.2.3"));
        assert!(!is_commit_sha(&"A".repeat(40)));
    }

    #[test]
    fn test_fetch_git_by_commit_verifies_tree() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let (commit, tree) = create_repo(&repo);

        let result = fetch_git(
            repo.to_str().unwrap(),
            &commit,
            Some(&tree),
            &dir.path().join("cache"),
            &Policy::default(),
            None,
        )
        .unwrap();
        assert_eq!(result.commit, commit);
        assert_eq!(result.tree_hash, tree);
        assert!(!result.mutable_ref);
        assert!(result.path.join("README.md").exists());

        // Cached reuse goes through verification
        let again = fetch_git(
            repo.to_str().unwrap(),
            &commit,
            Some(&tree),
            &dir.path().join("cache"),
            &Policy::default(),
            None,
        )
        .unwrap();
        assert_eq!(again.path, result.path);
    }

    #[test]
    fn test_fetch_git_tree_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let (commit, _) = create_repo(&repo);

        let err = fetch_git(
            repo.to_str().unwrap(),
            &commit,
            Some(&"0".repeat(40)),
            &dir.path().join("cache"),
            &Policy::default(),
            None,
        )
        .unwrap_err();
        assert_eq!(err.code(), "E_REPRODUCIBILITY");
    }

    #[test]
    fn test_mutable_ref_policy_error_blocks_branch() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let (_, tree) = create_repo(&repo);
        let policy = Policy {
            mutable_ref_policy: MutableRefPolicy::Error,
            ..Default::default()
        };

        let err = fetch_git(
            repo.to_str().unwrap(),
            "main",
            Some(&tree),
            &dir.path().join("cache"),
            &policy,
            None,
        )
        .unwrap_err();
        assert_eq!(err.code(), "E_POLICY");
    }

    #[test]
    fn test_tags_are_immutable_refs() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let (_, tree) = create_repo(&repo);
        run_git(&["tag", "v1.0.0"], Some(&repo)).unwrap();
        let policy = Policy {
            mutable_ref_policy: MutableRefPolicy::Error,
            ..Default::default()
        };

        let result = fetch_git(
            repo.to_str().unwrap(),
            "v1.0.0",
            Some(&tree),
            &dir.path().join("cache"),
            &policy,
            None,
        )
        .unwrap();
        assert!(!result.mutable_ref);
    }

    #[test]
    fn test_missing_tree_hash_requires_relaxed_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let (commit, tree) = create_repo(&repo);

        let err = fetch_git(
            repo.to_str().unwrap(),
            &commit,
            None,
            &dir.path().join("cache"),
            &Policy::default(),
            None,
        )
        .unwrap_err();
        assert_eq!(err.code(), "E_VALIDATION");

        let relaxed = Policy {
            require_integrity: false,
            ..Default::default()
        };
        let result = fetch_git(
            repo.to_str().unwrap(),
            &commit,
            None,
            &dir.path().join("cache2"),
            &relaxed,
            None,
        )
        .unwrap();
        assert_eq!(result.tree_hash, tree);
    }
}
