// src/deploy/mod.rs

//! Deploy adapter seam
//!
//! Target adapters sit behind one narrow trait. The bundled adapters only
//! *plan* a launch (validating the artifact and describing the exact
//! command or upload the operator would run); actually driving QEMU or
//! cloud APIs belongs to external adapter crates.

use crate::error::{Error, Result};
use crate::hash::hash_file;
use crate::models::{DeployRequest, DeployResult, OutputTarget};
use std::collections::BTreeMap;
use tracing::info;

/// Contract for a deploy target adapter.
pub trait DeployAdapter {
    fn target(&self) -> OutputTarget;
    fn deploy(&self, request: &DeployRequest) -> Result<DeployResult>;
}

/// Bundled planning adapter for any target.
#[derive(Debug, Clone)]
pub struct PlanAdapter {
    target: OutputTarget,
}

impl PlanAdapter {
    pub fn new(target: OutputTarget) -> Self {
        Self { target }
    }
}

/// Adapter lookup for a target.
pub fn adapter_for(target: OutputTarget) -> Box<dyn DeployAdapter> {
    Box::new(PlanAdapter::new(target))
}

impl DeployAdapter for PlanAdapter {
    fn target(&self) -> OutputTarget {
        self.target
    }

    fn deploy(&self, request: &DeployRequest) -> Result<DeployResult> {
        if !request.artifact_path.exists() {
            return Err(Error::deployment(format!(
                "Artifact {} does not exist.",
                request.artifact_path.display()
            ))
            .with_hint("Run bake() before deploy().")
            .with_profile(request.profile.clone())
            .with_operation("deploy"));
        }
        let digest = hash_file(&request.artifact_path)?;
        let deployment_id = format!(
            "{}-{}-{}",
            request.profile,
            self.target,
            &digest[..12]
        );

        let mut metadata: BTreeMap<String, String> = request.parameters.clone();
        metadata.insert("artifact_sha256".to_string(), digest);
        match self.target {
            OutputTarget::Qemu => {
                let memory = request.parameters.get("memory").cloned().unwrap_or_else(|| "8G".to_string());
                let cpus = request.parameters.get("cpus").cloned().unwrap_or_else(|| "4".to_string());
                metadata.insert(
                    "launch_command".to_string(),
                    format!(
                        "qemu-system-x86_64 -machine q35,confidential-guest-support=tdx0 \
                         -object tdx-guest,id=tdx0 -m {memory} -smp {cpus} \
                         -drive file={},format=qcow2",
                        request.artifact_path.display()
                    ),
                );
            }
            OutputTarget::Azure => {
                metadata.insert(
                    "upload_hint".to_string(),
                    format!(
                        "az disk create --upload-type Upload --security-type ConfidentialVM_NonPersistedTPM --source {}",
                        request.artifact_path.display()
                    ),
                );
            }
            OutputTarget::Gcp => {
                metadata.insert(
                    "upload_hint".to_string(),
                    format!(
                        "gcloud compute images create --guest-os-features=TDX_CAPABLE --source-uri {}",
                        request.artifact_path.display()
                    ),
                );
            }
        }

        info!(profile = %request.profile, target = %self.target, id = %deployment_id, "deploy planned");
        Ok(DeployResult {
            target: self.target,
            deployment_id,
            endpoint: None,
            metadata,
        })
    }
}
