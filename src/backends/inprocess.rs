// src/backends/inprocess.rs

//! In-process backend: deterministic placeholder artifacts
//!
//! Produces the same artifact layout as a real bake without invoking
//! mkosi or any external tool. Suitable for unit tests of the pipeline,
//! development machines without mkosi, and CI without privileges. The
//! artifact bytes are a pure function of `(profile, target)`, so repeated
//! bakes have stable digests.

use crate::backends::BuildBackend;
use crate::error::Result;
use crate::hash::hash_str;
use crate::models::{ArtifactRef, BakeRequest, BakeResult, ProfileBuildResult};
use std::fs;
use tracing::debug;

/// Backend that fabricates deterministic artifacts in-process.
#[derive(Debug, Clone, Default)]
pub struct InProcessBackend;

impl BuildBackend for InProcessBackend {
    fn name(&self) -> &str {
        "inprocess"
    }

    fn prepare(&self, request: &BakeRequest) -> Result<()> {
        fs::create_dir_all(&request.build_dir)?;
        fs::create_dir_all(&request.emit_dir)?;
        Ok(())
    }

    fn execute(&self, request: &BakeRequest) -> Result<BakeResult> {
        let profile_dir = request.build_dir.join(&request.profile);
        fs::create_dir_all(&profile_dir)?;

        let mut profile_result = ProfileBuildResult::new(&request.profile);
        for target in &request.output_targets {
            let path = profile_dir.join(target.artifact_filename());
            let content = format!(
                "tdxvm-artifact: profile={} target={target}\ndigest={}\n",
                request.profile,
                hash_str(&format!("{}:{target}", request.profile)),
            );
            fs::write(&path, &content)?;
            debug!(profile = %request.profile, %target, path = %path.display(), "placeholder artifact");
            profile_result.artifacts.insert(
                *target,
                ArtifactRef {
                    target: *target,
                    path,
                    digest: Some(hash_str(&content)),
                },
            );
        }

        let mut result = BakeResult::default();
        result.profiles.insert(request.profile.clone(), profile_result);
        Ok(result)
    }

    fn cleanup(&self, _request: &BakeRequest) -> Result<()> {
        Ok(())
    }
}
