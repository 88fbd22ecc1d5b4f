// src/ir/mod.rs

//! Intermediate representation: frozen, normalized recipe snapshots
//!
//! Every explicit output operation (lock, compile, bake, measure, deploy)
//! starts by taking an [`ImageIr`] snapshot of the recipe state for the
//! selected profiles. Snapshotting normalizes collections (dedupes
//! repositories, resolves file conflicts) and then runs the cross-phase
//! validator, so downstream consumers only ever see consistent state.

pub mod validate;

use crate::error::{Error, Result};
use crate::models::{Arch, FileEntry, ProfileState, RecipeState};
use serde::Serialize;
use std::collections::BTreeMap;

/// A frozen, normalized view of the recipe for one output operation.
#[derive(Debug, Clone, Serialize)]
pub struct ImageIr {
    pub base: String,
    pub arch: Arch,
    pub default_profile: String,
    /// Selected profiles, normalized.
    pub profiles: BTreeMap<String, ProfileState>,
}

impl ImageIr {
    /// Snapshot the selected profiles, normalize, and validate.
    pub fn snapshot(state: &RecipeState, profile_names: &[String]) -> Result<Self> {
        let mut profiles = BTreeMap::new();
        for name in profile_names {
            let profile = state.profiles.get(name).ok_or_else(|| {
                Error::validation(format!("Profile `{name}` does not exist."))
                    .with_hint("Create the profile before requesting an output operation.")
                    .with_profile(name.clone())
                    .with_operation("snapshot")
            })?;
            let normalized = normalize_profile(profile)?;
            profiles.insert(name.clone(), normalized);
        }

        let ir = Self {
            base: state.base.clone(),
            arch: state.arch,
            default_profile: state.default_profile.clone(),
            profiles,
        };
        validate::validate(&ir)?;
        Ok(ir)
    }
}

/// Normalize a profile: collapse duplicate repositories, resolve file
/// destination conflicts, sort init scripts.
fn normalize_profile(profile: &ProfileState) -> Result<ProfileState> {
    let mut normalized = profile.clone();
    normalized.repositories = collapse_repositories(profile)?;
    normalized.files = resolve_file_conflicts(&profile.name, &profile.files)?;
    normalized.skeleton_files = resolve_file_conflicts(&profile.name, &profile.skeleton_files)?;
    normalized
        .init_scripts
        .sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));
    Ok(normalized)
}

fn collapse_repositories(
    profile: &ProfileState,
) -> Result<Vec<crate::models::RepositorySpec>> {
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    let mut collapsed: Vec<crate::models::RepositorySpec> = Vec::new();
    for repo in &profile.repositories {
        match seen.get(&repo.url) {
            None => {
                seen.insert(repo.url.clone(), collapsed.len());
                collapsed.push(repo.clone());
            }
            Some(&index) => {
                if collapsed[index] != *repo {
                    return Err(Error::validation(format!(
                        "Repository `{}` declared twice with conflicting fields.",
                        repo.url
                    ))
                    .with_hint("Declare each repository URL once, or make the declarations agree.")
                    .with_profile(profile.name.clone())
                    .with_operation("snapshot"));
                }
                // Identical re-declaration collapses silently.
            }
        }
    }
    Ok(collapsed)
}

fn resolve_file_conflicts(profile_name: &str, files: &[FileEntry]) -> Result<Vec<FileEntry>> {
    let mut by_path: BTreeMap<String, usize> = BTreeMap::new();
    let mut resolved: Vec<FileEntry> = Vec::new();
    for entry in files {
        match by_path.get(&entry.path) {
            None => {
                by_path.insert(entry.path.clone(), resolved.len());
                resolved.push(entry.clone());
            }
            Some(&index) => {
                let existing = &resolved[index];
                if existing == entry {
                    continue;
                }
                if !(existing.allow_overwrite && entry.allow_overwrite) {
                    return Err(Error::validation(format!(
                        "Duplicate file destination `{}`.",
                        entry.path
                    ))
                    .with_hint("Set allow_overwrite on every declaration of this destination.")
                    .with_profile(profile_name.to_string())
                    .with_operation("snapshot"));
                }
                // allow_overwrite on both sides: last declaration wins.
                resolved[index] = entry.clone();
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RepositorySpec;

    fn state_with_default() -> RecipeState {
        RecipeState::initialize("debian/bookworm", Arch::X86_64, "default")
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_snapshot_unknown_profile_fails() {
        let state = state_with_default();
        let err = ImageIr::snapshot(&state, &names(&["missing"])).unwrap_err();
        assert_eq!(err.code(), "E_VALIDATION");
    }

    #[test]
    fn test_identical_repositories_collapse() {
        let mut state = state_with_default();
        let repo = RepositorySpec {
            name: "extra".to_string(),
            url: "https://repo.example.com".to_string(),
            suite: Some("bookworm".to_string()),
            components: vec!["main".to_string()],
            keyring: None,
            priority: 100,
        };
        {
            let profile = state.ensure_profile("default");
            profile.repositories.push(repo.clone());
            profile.repositories.push(repo);
        }
        let ir = ImageIr::snapshot(&state, &names(&["default"])).unwrap();
        assert_eq!(ir.profiles["default"].repositories.len(), 1);
    }

    #[test]
    fn test_conflicting_repositories_fail() {
        let mut state = state_with_default();
        {
            let profile = state.ensure_profile("default");
            let mut a = RepositorySpec {
                name: "extra".to_string(),
                url: "https://repo.example.com".to_string(),
                suite: Some("bookworm".to_string()),
                components: vec![],
                keyring: None,
                priority: 100,
            };
            profile.repositories.push(a.clone());
            a.suite = Some("trixie".to_string());
            profile.repositories.push(a);
        }
        let err = ImageIr::snapshot(&state, &names(&["default"])).unwrap_err();
        assert_eq!(err.code(), "E_VALIDATION");
    }

    #[test]
    fn test_duplicate_file_destination_fails_without_overwrite() {
        let mut state = state_with_default();
        {
            let profile = state.ensure_profile("default");
            profile.files.push(FileEntry::new("/etc/motd", "one\n"));
            profile.files.push(FileEntry::new("/etc/motd", "two\n"));
        }
        let err = ImageIr::snapshot(&state, &names(&["default"])).unwrap_err();
        assert_eq!(err.code(), "E_VALIDATION");
    }

    #[test]
    fn test_duplicate_file_destination_last_wins_with_overwrite() {
        let mut state = state_with_default();
        {
            let profile = state.ensure_profile("default");
            let mut first = FileEntry::new("/etc/motd", "one\n");
            first.allow_overwrite = true;
            let mut second = FileEntry::new("/etc/motd", "two\n");
            second.allow_overwrite = true;
            profile.files.push(first);
            profile.files.push(second);
        }
        let ir = ImageIr::snapshot(&state, &names(&["default"])).unwrap();
        let files = &ir.profiles["default"].files;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].content, "two\n");
    }

    #[test]
    fn test_init_scripts_sorted_by_priority_then_id() {
        use crate::models::InitScriptEntry;
        let mut state = state_with_default();
        {
            let profile = state.ensure_profile("default");
            for (id, priority) in [("zeta", 10), ("alpha", 10), ("early", 5)] {
                profile.init_scripts.push(InitScriptEntry {
                    id: id.to_string(),
                    priority,
                    exec: format!("/usr/bin/{id}"),
                    preconditions: vec![],
                });
            }
        }
        let ir = ImageIr::snapshot(&state, &names(&["default"])).unwrap();
        let ids: Vec<&str> = ir.profiles["default"]
            .init_scripts
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(ids, vec!["early", "alpha", "zeta"]);
    }
}
