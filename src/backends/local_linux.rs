// src/backends/local_linux.rs

//! Direct Linux backend: invoke mkosi on the host
//!
//! Preflight verifies a Linux host, mkosi in `PATH`, and a minimum mkosi
//! version. Privilege escalation defaults to `sudo` (mkosi needs root or
//! user namespaces); `unshare` selects rootless `unshare --map-auto`, and
//! `none` runs mkosi as the invoking user.

use crate::backends::{collect_artifacts, BuildBackend};
use crate::error::{Error, Result};
use crate::models::{BakeRequest, BakeResult, ProfileBuildResult};
use std::fs;
use std::process::Command;
use tracing::{debug, info};

/// Minimum supported mkosi version.
pub const MINIMUM_MKOSI_VERSION: (u32, u32) = (25, 0);

/// Privilege escalation strategy for the mkosi invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Privilege {
    #[default]
    Sudo,
    Unshare,
    None,
}

/// Backend running mkosi directly on the host.
#[derive(Debug, Clone, Default)]
pub struct LocalLinuxBackend {
    pub privilege: Privilege,
    /// Extra arguments appended before the `build` verb.
    pub mkosi_args: Vec<String>,
}

impl LocalLinuxBackend {
    fn ensure_prerequisites(&self) -> Result<()> {
        if !cfg!(target_os = "linux") {
            return Err(Error::backend("Local Linux backend requires a Linux host.")
                .with_hint("Use a VM-hosted backend on other platforms.")
                .with_operation("prepare"));
        }
        if which("mkosi").is_none() {
            return Err(Error::backend("Local Linux backend requires `mkosi` in PATH.")
                .with_hint("Install mkosi and ensure it is available before running bake.")
                .with_operation("prepare"));
        }
        self.check_mkosi_version()
    }

    fn check_mkosi_version(&self) -> Result<()> {
        let output = Command::new("mkosi").arg("--version").output();
        let Ok(output) = output else {
            return Ok(()); // let mkosi itself fail later
        };
        if !output.status.success() {
            return Ok(());
        }
        let version_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let Some(version) = parse_mkosi_version(&version_str) else {
            return Ok(());
        };
        if version < MINIMUM_MKOSI_VERSION {
            return Err(Error::backend(format!(
                "mkosi version {version_str} is below minimum {}.{}.",
                MINIMUM_MKOSI_VERSION.0, MINIMUM_MKOSI_VERSION.1
            ))
            .with_hint("Upgrade mkosi to a supported release.")
            .with_operation("prepare"));
        }
        debug!(version = %version_str, "mkosi version ok");
        Ok(())
    }
}

fn parse_mkosi_version(version_str: &str) -> Option<(u32, u32)> {
    let cleaned = version_str.replace("mkosi", "");
    let mut parts = cleaned.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some((major, minor))
}

fn which(binary: &str) -> Option<std::path::PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

impl BuildBackend for LocalLinuxBackend {
    fn name(&self) -> &str {
        "local_linux"
    }

    fn prepare(&self, request: &BakeRequest) -> Result<()> {
        self.ensure_prerequisites()?;
        for mount in self.mount_plan(request) {
            fs::create_dir_all(&mount.source)?;
        }
        Ok(())
    }

    fn execute(&self, request: &BakeRequest) -> Result<BakeResult> {
        self.ensure_prerequisites()?;

        // Native-profiles trees run from the emission root with
        // --profile; per-directory trees run from the profile subdir.
        let native_profile_dir = request
            .emit_dir
            .join("mkosi.profiles")
            .join(&request.profile);
        let (mkosi_dir, native) = if native_profile_dir.exists() {
            (request.emit_dir.clone(), true)
        } else {
            let per_dir = request.emit_dir.join(&request.profile);
            if per_dir.exists() {
                (per_dir, false)
            } else {
                (request.emit_dir.clone(), false)
            }
        };

        let output_dir = request.build_dir.join(&request.profile).join("output");
        fs::create_dir_all(&output_dir)?;

        let mkosi_bin = which("mkosi").unwrap_or_else(|| "mkosi".into());
        let mut command: Vec<String> = Vec::new();
        match self.privilege {
            Privilege::Unshare if which("unshare").is_some() => {
                command.extend(["unshare", "--map-auto", "--map-current-user"].map(String::from));
            }
            Privilege::Sudo => {
                command.push("sudo".to_string());
            }
            _ => {}
        }
        command.push(mkosi_bin.display().to_string());
        command.push("--force".to_string());
        command.push(format!("--image-id={}", request.profile));
        command.push(format!("--output-dir={}", output_dir.display()));
        if native {
            command.push(format!("--profile={}", request.profile));
        }
        command.extend(self.mkosi_args.iter().cloned());
        command.push("build".to_string());

        info!(profile = %request.profile, dir = %mkosi_dir.display(), "running mkosi");
        let output = Command::new(&command[0])
            .args(&command[1..])
            .current_dir(&mkosi_dir)
            .envs(request.env.iter())
            .output()
            .map_err(|e| {
                Error::backend(format!("Failed to spawn mkosi: {e}")).with_operation("execute")
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.chars().take(2000).collect();
            return Err(Error::backend(format!(
                "mkosi build failed with status {:?}: {excerpt}",
                output.status.code()
            ))
            .with_hint("Check mkosi output for details.")
            .with_profile(request.profile.clone())
            .with_operation("execute"));
        }

        let mut profile_result = ProfileBuildResult::new(&request.profile);
        profile_result.artifacts = collect_artifacts(&output_dir)?;
        let mut result = BakeResult::default();
        result.profiles.insert(request.profile.clone(), profile_result);
        Ok(result)
    }

    fn cleanup(&self, _request: &BakeRequest) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mkosi_version() {
        assert_eq!(parse_mkosi_version("mkosi 25.3"), Some((25, 3)));
        assert_eq!(parse_mkosi_version("26"), Some((26, 0)));
        assert_eq!(parse_mkosi_version("garbage"), None);
    }

    #[test]
    fn test_version_ordering_against_minimum() {
        assert!((24, 9) < MINIMUM_MKOSI_VERSION);
        assert!((25, 0) >= MINIMUM_MKOSI_VERSION);
        assert!((26, 1) > MINIMUM_MKOSI_VERSION);
    }
}
