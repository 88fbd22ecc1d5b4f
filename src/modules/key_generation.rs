// src/modules/key_generation.rs

//! Boot-time key generation
//!
//! Configures the guest init binary to derive a disk key (TPM-sealed or
//! random) and registers the step early in runtime-init ordering so the
//! key exists before disk encryption mounts anything.

use crate::error::Result;
use crate::modules::{ensure_guest_init_build, Module, GUEST_INIT_DEFAULT_REF, GUEST_INIT_DEFAULT_REPO};
use crate::recipe::Image;
use serde::{Deserialize, Serialize};

const CONFIG_PATH: &str = "/etc/tdx-init/config.d/10-keys.yaml";
const INIT_PRIORITY: i32 = 10;

/// How the key material is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    #[default]
    Tpm,
    Random,
}

impl KeyStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tpm => "tpm",
            Self::Random => "random",
        }
    }
}

/// Generate a cryptographic key at boot time.
#[derive(Debug, Clone)]
pub struct KeyGeneration {
    pub strategy: KeyStrategy,
    pub output: String,
    pub source_repo: String,
    pub source_ref: String,
}

impl Default for KeyGeneration {
    fn default() -> Self {
        Self {
            strategy: KeyStrategy::Tpm,
            output: "/persistent/key".to_string(),
            source_repo: GUEST_INIT_DEFAULT_REPO.to_string(),
            source_ref: GUEST_INIT_DEFAULT_REF.to_string(),
        }
    }
}

impl KeyGeneration {
    pub fn new(strategy: KeyStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    fn render_config(&self) -> String {
        format!(
            "keys:\n  key_persistent:\n    strategy: \"random\"\n    tpm: {}\n",
            self.strategy == KeyStrategy::Tpm
        )
    }
}

impl Module for KeyGeneration {
    fn name(&self) -> &str {
        "key-generation"
    }

    fn setup(&self, image: &mut Image) -> Result<()> {
        ensure_guest_init_build(image, &self.source_repo, &self.source_ref)
    }

    fn install(&self, image: &mut Image) -> Result<()> {
        image.file(CONFIG_PATH, &self.render_config())?;
        image.add_init_script(
            "key-generation",
            INIT_PRIORITY,
            &format!(
                "/usr/bin/tdx-init key --strategy {} --output {}",
                self.strategy.as_str(),
                self.output
            ),
        )?;
        Ok(())
    }
}
