// src/modules/disk_encryption.rs

//! Boot-time LUKS2 disk encryption
//!
//! Configures the guest init binary to unlock (and on explicit opt-in,
//! reformat) the persistent disk, and registers the step after key
//! generation in runtime-init ordering. Reformatting on mount failure is
//! destructive, so the default policy refuses to mount rather than wipe.

use crate::error::Result;
use crate::modules::{ensure_guest_init_build, Module, GUEST_INIT_DEFAULT_REF, GUEST_INIT_DEFAULT_REPO};
use crate::recipe::Image;
use serde::{Deserialize, Serialize};

const CONFIG_PATH: &str = "/etc/tdx-init/config.d/20-disks.yaml";
const INIT_PRIORITY: i32 = 20;

/// Behavior when the encrypted disk fails to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MountFailurePolicy {
    /// Abort boot; operator intervention required.
    #[default]
    Fail,
    /// Reformat and remount. Destroys existing data.
    Reformat,
}

/// LUKS2 disk encryption at boot time.
#[derive(Debug, Clone)]
pub struct DiskEncryption {
    pub device: String,
    pub mapper_name: String,
    pub key_path: String,
    pub mount_point: String,
    pub on_mount_failure: MountFailurePolicy,
    pub source_repo: String,
    pub source_ref: String,
}

impl Default for DiskEncryption {
    fn default() -> Self {
        Self {
            device: "/dev/vda3".to_string(),
            mapper_name: "cryptroot".to_string(),
            key_path: "/persistent/key".to_string(),
            mount_point: "/persistent".to_string(),
            on_mount_failure: MountFailurePolicy::Fail,
            source_repo: GUEST_INIT_DEFAULT_REPO.to_string(),
            source_ref: GUEST_INIT_DEFAULT_REF.to_string(),
        }
    }
}

impl DiskEncryption {
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit opt-in to the destructive reformat-on-failure behavior.
    pub fn reformat_on_mount_failure(mut self) -> Self {
        self.on_mount_failure = MountFailurePolicy::Reformat;
        self
    }

    fn render_config(&self) -> String {
        let format = match self.on_mount_failure {
            MountFailurePolicy::Fail => "never",
            MountFailurePolicy::Reformat => "on_fail",
        };
        format!(
            concat!(
                "disks:\n",
                "  disk_persistent:\n",
                "    strategy: \"pathglob\"\n",
                "    strategy_config:\n",
                "      path_glob: \"{device}\"\n",
                "    format: \"{format}\"\n",
                "    encryption_key: \"key_persistent\"\n",
                "    mount_at: \"{mount}\"\n",
            ),
            device = self.device,
            format = format,
            mount = self.mount_point,
        )
    }
}

impl Module for DiskEncryption {
    fn name(&self) -> &str {
        "disk-encryption"
    }

    fn setup(&self, image: &mut Image) -> Result<()> {
        ensure_guest_init_build(image, &self.source_repo, &self.source_ref)?;
        image.install(&["cryptsetup"])?;
        Ok(())
    }

    fn install(&self, image: &mut Image) -> Result<()> {
        image.file(CONFIG_PATH, &self.render_config())?;
        image.add_init_script(
            "disk-encryption",
            INIT_PRIORITY,
            &format!(
                "/usr/bin/tdx-init disk --device {} --mapper {} --key {} --mount {}",
                self.device, self.mapper_name, self.key_path, self.mount_point
            ),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::KeyGeneration;

    #[test]
    fn test_default_policy_never_reformats() {
        let module = DiskEncryption::new();
        assert_eq!(module.on_mount_failure, MountFailurePolicy::Fail);
        assert!(module.render_config().contains("format: \"never\""));
    }

    #[test]
    fn test_reformat_requires_explicit_opt_in() {
        let module = DiskEncryption::new().reformat_on_mount_failure();
        assert!(module.render_config().contains("format: \"on_fail\""));
    }

    #[test]
    fn test_apply_orders_after_key_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mut img = Image::new("debian/bookworm").with_build_dir(dir.path());
        let keys = KeyGeneration::default();
        let disks = DiskEncryption::new();
        img.use_modules(&[&keys, &disks]).unwrap();

        let profile = &img.state().profiles["default"];
        assert!(profile.packages.contains("cryptsetup"));
        let key_step = profile.init_scripts.iter().find(|s| s.id == "key-generation").unwrap();
        let disk_step = profile
            .init_scripts
            .iter()
            .find(|s| s.id == "disk-encryption")
            .unwrap();
        assert!(key_step.priority < disk_step.priority);
        // Shared guest init build declared once
        assert_eq!(
            profile.builds.iter().filter(|b| b.name == "tdx-init").count(),
            1
        );
    }
}
