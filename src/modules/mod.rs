// src/modules/mod.rs

//! Reusable configuration bundles
//!
//! A module is a small record with `setup` (build/package declarations)
//! and `install` (runtime configuration) hooks, bound to an image through
//! [`Image::use_modules`](crate::recipe::Image::use_modules). Host-command
//! prerequisites are checked against `PATH` before any module mutates the
//! recipe, so a missing tool never leaves a half-applied image.

mod disk_encryption;
mod key_generation;
mod secret_delivery;

pub use disk_encryption::{DiskEncryption, MountFailurePolicy};
pub use key_generation::{KeyGeneration, KeyStrategy};
pub use secret_delivery::SecretDelivery;

use crate::error::Result;
use crate::models::{Arch, BuildKind, BuildSource, BuildSpec, Fetch};
use crate::recipe::Image;
use std::collections::BTreeMap;

/// Packages every guest-init build needs at build time.
pub const GUEST_INIT_BUILD_PACKAGES: &[&str] = &["build-essential", "git", "golang"];

/// Default source of the guest init binary.
pub const GUEST_INIT_DEFAULT_REPO: &str = "https://github.com/tundralabs/tdx-guest-tools";
pub const GUEST_INIT_DEFAULT_REF: &str = "main";

/// A reusable configuration bundle.
pub trait Module {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    /// Host commands that must be on `PATH` before the module applies.
    fn required_host_commands(&self) -> &[&str] {
        &[]
    }

    /// One-time build/package setup.
    fn setup(&self, _image: &mut Image) -> Result<()> {
        Ok(())
    }

    /// Per-image runtime configuration.
    fn install(&self, image: &mut Image) -> Result<()>;

    /// Convenience: `setup` then `install`.
    fn apply(&self, image: &mut Image) -> Result<()> {
        self.setup(image)?;
        self.install(image)
    }
}

/// Ensure `/usr/bin/tdx-init` is built exactly once per profile from the
/// given source. Shared by the modules that configure the guest init
/// binary.
pub(crate) fn ensure_guest_init_build(
    image: &mut Image,
    source_repo: &str,
    source_ref: &str,
) -> Result<()> {
    image.build_install(GUEST_INIT_BUILD_PACKAGES)?;

    let already_declared = image
        .active_profiles()
        .iter()
        .all(|name| {
            image
                .state()
                .profiles
                .get(name)
                .map(|profile| profile.builds.iter().any(|b| b.name == "tdx-init"))
                .unwrap_or(false)
        });
    if already_declared {
        return Ok(());
    }

    image.build(vec![BuildSpec {
        name: "tdx-init".to_string(),
        kind: BuildKind::Go { ldflags: None },
        src: BuildSource::Fetch {
            fetch: Fetch::git(source_repo, source_ref),
        },
        output: "/usr/bin/tdx-init".to_string(),
        toolchain: "go1.22".to_string(),
        target_arch: Arch::X86_64,
        flags: Vec::new(),
        build_deps: GUEST_INIT_BUILD_PACKAGES.iter().map(|s| s.to_string()).collect(),
        env: BTreeMap::new(),
        artifacts: BTreeMap::new(),
    }])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct NeedsGhostTool;

    impl Module for NeedsGhostTool {
        fn name(&self) -> &str {
            "needs-ghost-tool"
        }

        fn required_host_commands(&self) -> &[&str] {
            &["definitely-not-a-real-binary-name"]
        }

        fn install(&self, image: &mut Image) -> Result<()> {
            image.install(&["should-never-land"])?;
            Ok(())
        }
    }

    struct AddsPackage;

    impl Module for AddsPackage {
        fn name(&self) -> &str {
            "adds-package"
        }

        fn install(&self, image: &mut Image) -> Result<()> {
            image.install(&["jq"])?;
            Ok(())
        }
    }

    struct FailsInInstall;

    impl Module for FailsInInstall {
        fn name(&self) -> &str {
            "fails"
        }

        fn install(&self, _image: &mut Image) -> Result<()> {
            Err(Error::validation("intentional"))
        }
    }

    #[test]
    fn test_missing_host_command_blocks_before_any_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let mut img = Image::new("debian/bookworm").with_build_dir(dir.path());

        let err = img
            .use_modules(&[&AddsPackage, &NeedsGhostTool])
            .unwrap_err();
        assert_eq!(err.code(), "E_VALIDATION");
        // Neither module ran
        assert!(!img.state().profiles["default"].packages.contains("jq"));
        assert!(!img.state().profiles["default"]
            .packages
            .contains("should-never-land"));
    }

    #[test]
    fn test_modules_apply_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut img = Image::new("debian/bookworm").with_build_dir(dir.path());
        img.use_modules(&[&AddsPackage]).unwrap();
        assert!(img.state().profiles["default"].packages.contains("jq"));
    }

    #[test]
    fn test_module_errors_propagate() {
        let dir = tempfile::tempdir().unwrap();
        let mut img = Image::new("debian/bookworm").with_build_dir(dir.path());
        assert!(img.use_modules(&[&FailsInInstall]).is_err());
    }

    #[test]
    fn test_guest_init_build_is_declared_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut img = Image::new("debian/bookworm").with_build_dir(dir.path());
        ensure_guest_init_build(&mut img, GUEST_INIT_DEFAULT_REPO, GUEST_INIT_DEFAULT_REF).unwrap();
        ensure_guest_init_build(&mut img, GUEST_INIT_DEFAULT_REPO, GUEST_INIT_DEFAULT_REF).unwrap();

        let builds = &img.state().profiles["default"].builds;
        assert_eq!(builds.iter().filter(|b| b.name == "tdx-init").count(), 1);
        assert!(img.state().profiles["default"]
            .build_packages
            .contains("golang"));
    }
}
