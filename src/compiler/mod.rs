// src/compiler/mod.rs

//! Deterministic mkosi project tree emission
//!
//! The emitter renders the whole project tree in memory first (a sorted
//! map of relative path -> content + mode), then writes it with LF line
//! endings, fixed modes, and mtimes pinned to the `SOURCE_DATE_EPOCH=0`
//! epoch. After writing, the tree is rendered a second time and compared;
//! any divergence is a reproducibility failure and the partial tree is
//! removed. Two emissions from the same recipe digest are byte-identical.

pub mod debloat;
mod emit;
pub mod scripts;
pub mod units;

use crate::error::{Error, Result};
use crate::hash::canonical_digest;
use crate::ir::ImageIr;
use crate::models::{Kernel, Phase};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};
use uuid::Uuid;

/// Tree layout flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmitMode {
    /// `<root>/<profile>/mkosi.conf` per profile.
    #[default]
    PerDirectory,
    /// Root `mkosi.conf` plus `mkosi.profiles/<name>/mkosi.conf`.
    NativeProfiles,
}

/// Image-level emission settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitConfig {
    pub reproducible: bool,
    pub with_network: bool,
    pub emit_mode: EmitMode,
    pub environment: BTreeMap<String, String>,
    pub environment_passthrough: Vec<String>,
    pub kernel: Option<Kernel>,
    pub generate_version_script: bool,
    /// Explicit partition seed; derived from the recipe digest when unset.
    pub seed: Option<String>,
}

impl Default for EmitConfig {
    fn default() -> Self {
        Self {
            reproducible: true,
            with_network: true,
            emit_mode: EmitMode::PerDirectory,
            environment: BTreeMap::new(),
            environment_passthrough: Vec::new(),
            kernel: None,
            generate_version_script: true,
            seed: None,
        }
    }
}

/// One rendered file: content plus permission bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RenderedFile {
    pub content: String,
    pub mode: u32,
}

/// The fully rendered tree, keyed by path relative to the emission root.
pub(crate) type RenderedTree = BTreeMap<PathBuf, RenderedFile>;

/// Metadata about an emitted tree.
#[derive(Debug, Clone)]
pub struct MkosiEmission {
    pub root: PathBuf,
    /// Profile -> mkosi.conf path.
    pub profile_confs: BTreeMap<String, PathBuf>,
    /// Profile -> phase -> emitted script path.
    pub script_paths: BTreeMap<String, BTreeMap<Phase, PathBuf>>,
}

/// Emit the project tree for an IR snapshot. The destination directory is
/// replaced wholesale so no stale files from earlier emissions survive.
pub fn emit_tree(ir: &ImageIr, destination: &Path, config: &EmitConfig) -> Result<MkosiEmission> {
    let seed = match &config.seed {
        Some(seed) => seed.clone(),
        None => derive_seed(ir)?,
    };
    let rendered = emit::render_tree(ir, config, &seed)?;

    if destination.exists() {
        fs::remove_dir_all(destination)?;
    }
    if let Err(e) = write_tree(destination, &rendered) {
        let _ = fs::remove_dir_all(destination);
        return Err(e);
    }

    // Post-emit determinism self-check: a second render must agree with
    // what was written.
    let rerendered = emit::render_tree(ir, config, &seed)?;
    if rerendered != rendered {
        let _ = fs::remove_dir_all(destination);
        return Err(Error::reproducibility(
            "Emission self-check failed: repeated render diverged.",
        )
        .with_operation("emit"));
    }

    info!(root = %destination.display(), files = rendered.len(), "mkosi tree emitted");
    Ok(collect_emission(destination, ir, config, &rendered))
}

/// Partition seed derived from the recipe digest: stable per recipe,
/// different across recipes.
fn derive_seed(ir: &ImageIr) -> Result<String> {
    let digest = canonical_digest(ir)?;
    let mut bytes = [0u8; 16];
    for (index, chunk) in digest.as_bytes().chunks(2).take(16).enumerate() {
        let pair = std::str::from_utf8(chunk).unwrap_or("00");
        bytes[index] = u8::from_str_radix(pair, 16).unwrap_or(0);
    }
    Ok(Uuid::from_bytes(bytes).to_string())
}

fn write_tree(destination: &Path, rendered: &RenderedTree) -> Result<()> {
    for (relative, file) in rendered {
        let path = destination.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, file.content.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(file.mode))?;
        }
        // Pin mtimes to the reproducibility epoch.
        let handle = fs::File::options().write(true).open(&path)?;
        handle.set_modified(SystemTime::UNIX_EPOCH)?;
        debug!(path = %path.display(), mode = format!("{:o}", file.mode), "emitted");
    }
    Ok(())
}

fn collect_emission(
    destination: &Path,
    ir: &ImageIr,
    config: &EmitConfig,
    rendered: &RenderedTree,
) -> MkosiEmission {
    let mut profile_confs = BTreeMap::new();
    let mut script_paths: BTreeMap<String, BTreeMap<Phase, PathBuf>> = BTreeMap::new();

    for profile_name in ir.profiles.keys() {
        let profile_prefix = match config.emit_mode {
            EmitMode::PerDirectory => PathBuf::from(profile_name),
            EmitMode::NativeProfiles => PathBuf::from("mkosi.profiles").join(profile_name),
        };
        profile_confs.insert(
            profile_name.clone(),
            destination.join(profile_prefix.join("mkosi.conf")),
        );

        let mut phases = BTreeMap::new();
        for phase in crate::models::PHASE_ORDER {
            let relative = profile_prefix.join("scripts").join(phase.script_name());
            if rendered.contains_key(&relative) {
                phases.insert(phase, destination.join(relative));
            }
        }
        script_paths.insert(profile_name.clone(), phases);
    }

    MkosiEmission {
        root: destination.to_path_buf(),
        profile_confs,
        script_paths,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Arch, CommandSpec, FileEntry, RecipeState};
    use walkdir::WalkDir;

    fn sample_ir() -> ImageIr {
        let mut state = RecipeState::initialize("debian/bookworm", Arch::X86_64, "default");
        {
            let profile = state.ensure_profile("default");
            profile.packages.insert("systemd".to_string());
            profile.packages.insert("curl".to_string());
            profile.files.push(FileEntry::new("/etc/motd", "hi\n"));
            profile
                .phases
                .entry(Phase::Prepare)
                .or_default()
                .push(CommandSpec::new(["echo", "prep"]));
        }
        ImageIr::snapshot(&state, &["default".to_string()]).unwrap()
    }

    fn snapshot_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
        let mut snapshot = BTreeMap::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                let relative = entry
                    .path()
                    .strip_prefix(root)
                    .unwrap()
                    .to_string_lossy()
                    .to_string();
                snapshot.insert(relative, fs::read(entry.path()).unwrap());
            }
        }
        snapshot
    }

    #[test]
    fn test_emit_twice_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let ir = sample_ir();
        let config = EmitConfig::default();

        emit_tree(&ir, &dir.path().join("a"), &config).unwrap();
        emit_tree(&ir, &dir.path().join("b"), &config).unwrap();

        assert_eq!(
            snapshot_tree(&dir.path().join("a")),
            snapshot_tree(&dir.path().join("b"))
        );
    }

    #[test]
    fn test_emission_metadata_points_at_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let emission = emit_tree(&sample_ir(), dir.path(), &EmitConfig::default()).unwrap();
        let conf = &emission.profile_confs["default"];
        assert!(conf.exists());
        let prepare = &emission.script_paths["default"][&Phase::Prepare];
        assert!(prepare.ends_with("default/scripts/03-prepare.sh"));
        assert!(prepare.exists());
    }

    #[test]
    fn test_mtimes_pinned_to_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let emission = emit_tree(&sample_ir(), dir.path(), &EmitConfig::default()).unwrap();
        let metadata = fs::metadata(&emission.profile_confs["default"]).unwrap();
        let mtime = metadata.modified().unwrap();
        assert_eq!(mtime, SystemTime::UNIX_EPOCH);
    }

    #[test]
    fn test_seed_is_stable_per_recipe_and_differs_across_recipes() {
        let seed_a = derive_seed(&sample_ir()).unwrap();
        let seed_b = derive_seed(&sample_ir()).unwrap();
        assert_eq!(seed_a, seed_b);

        let mut state = RecipeState::initialize("debian/bookworm", Arch::X86_64, "default");
        state.ensure_profile("default").packages.insert("jq".to_string());
        let other = ImageIr::snapshot(&state, &["default".to_string()]).unwrap();
        assert_ne!(seed_a, derive_seed(&other).unwrap());
        // Parses as a UUID
        assert!(Uuid::parse_str(&seed_a).is_ok());
    }

    #[test]
    fn test_stale_files_do_not_survive_reemission() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("mkosi");
        emit_tree(&sample_ir(), &root, &EmitConfig::default()).unwrap();
        fs::write(root.join("stale.txt"), "junk").unwrap();

        emit_tree(&sample_ir(), &root, &EmitConfig::default()).unwrap();
        assert!(!root.join("stale.txt").exists());
    }
}
