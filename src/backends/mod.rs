// src/backends/mod.rs

//! Execution backend contract
//!
//! A backend takes a [`BakeRequest`] pointing at an emitted project tree
//! and produces artifacts. The contract is three narrow phases: `prepare`
//! (preflight probes), `execute` (the actual mkosi run), and `cleanup`.
//! `mount_plan` documents the host paths a sandboxing backend must map.
//! Concrete VM-hosted backends (Lima and friends) live outside this
//! crate; the bundled implementations are the in-process stub used by
//! tests and the direct-Linux runner.

mod inprocess;
mod local_linux;

pub use inprocess::InProcessBackend;
pub use local_linux::{LocalLinuxBackend, Privilege, MINIMUM_MKOSI_VERSION};

use crate::error::Result;
use crate::hash::hash_file;
use crate::models::{ArtifactRef, BakeRequest, BakeResult, OutputTarget};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One host path a backend must make visible to the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Contract every execution backend satisfies.
pub trait BuildBackend {
    fn name(&self) -> &str;

    /// Deterministic host/guest mount mapping for this request.
    fn mount_plan(&self, request: &BakeRequest) -> Vec<MountSpec> {
        vec![
            MountSpec {
                source: request.build_dir.clone(),
                target: request.build_dir.display().to_string(),
                read_only: false,
            },
            MountSpec {
                source: request.emit_dir.clone(),
                target: request.emit_dir.display().to_string(),
                read_only: true,
            },
        ]
    }

    /// Preflight probes; fails fast before any side effects.
    fn prepare(&self, request: &BakeRequest) -> Result<()>;

    /// Run the bake and return per-profile artifacts.
    fn execute(&self, request: &BakeRequest) -> Result<BakeResult>;

    /// Release backend resources. Must be safe to call after a failed
    /// execute.
    fn cleanup(&self, request: &BakeRequest) -> Result<()>;
}

/// Scan an output directory for conventional artifact filenames and
/// digest whatever is present.
pub fn collect_artifacts(output_dir: &Path) -> Result<BTreeMap<OutputTarget, ArtifactRef>> {
    let mut artifacts = BTreeMap::new();
    for target in [OutputTarget::Qemu, OutputTarget::Azure, OutputTarget::Gcp] {
        let path = output_dir.join(target.artifact_filename());
        if path.exists() {
            let digest = hash_file(&path)?;
            artifacts.insert(
                target,
                ArtifactRef {
                    target,
                    path,
                    digest: Some(digest),
                },
            );
        }
    }
    Ok(artifacts)
}
