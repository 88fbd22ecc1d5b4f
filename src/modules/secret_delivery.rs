// src/modules/secret_delivery.rs

//! Secret delivery module
//!
//! Builds the guest delivery agent from source, serializes the declared
//! secrets (names, schemas, targets — never values) into
//! `/etc/tdx/secrets.json` so the agent knows what to expect at boot, and
//! registers the agent as a runtime-init step. The agent itself runs the
//! delivery state machine from [`crate::secrets`].

use crate::error::{Error, Result};
use crate::models::{
    Arch, BuildKind, BuildSource, BuildSpec, CompletionMode, Fetch, SecretSpec,
    SecretsDeliveryConfig,
};
use crate::modules::{Module, GUEST_INIT_BUILD_PACKAGES};
use crate::recipe::Image;
use serde_json::json;
use std::collections::BTreeMap;

/// Where the agent reads its expectations at boot.
pub const SECRETS_CONFIG_PATH: &str = "/etc/tdx/secrets.json";

const AGENT_BINARY: &str = "/usr/bin/secret-delivery";
const DEFAULT_REPO: &str = "https://github.com/tundralabs/tdx-guest-tools";
const DEFAULT_REF: &str = "main";
const INIT_PRIORITY: i32 = 30;

/// Boot-time secret delivery over HTTP POST.
#[derive(Debug, Clone)]
pub struct SecretDelivery {
    pub port: u16,
    pub completion: CompletionMode,
    pub reject_unknown: bool,
    pub source_repo: String,
    pub source_ref: String,
    secrets: Vec<SecretSpec>,
}

impl Default for SecretDelivery {
    fn default() -> Self {
        Self {
            port: 8081,
            completion: CompletionMode::AllRequired,
            reject_unknown: true,
            source_repo: DEFAULT_REPO.to_string(),
            source_ref: DEFAULT_REF.to_string(),
            secrets: Vec::new(),
        }
    }
}

impl SecretDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an expected secret.
    pub fn secret(mut self, spec: SecretSpec) -> Result<Self> {
        if spec.name.is_empty() {
            return Err(Error::validation("secret() requires a non-empty secret name."));
        }
        if spec.targets.is_empty() {
            return Err(Error::validation(
                "secret() requires at least one delivery target.",
            ));
        }
        self.secrets.push(spec);
        Ok(self)
    }

    fn render_config(&self) -> Result<String> {
        let mut secrets = self.secrets.clone();
        secrets.sort_by(|a, b| a.name.cmp(&b.name));
        let payload = json!({
            "method": "http_post",
            "port": self.port,
            "completion": self.completion,
            "reject_unknown": self.reject_unknown,
            "secrets": secrets,
        });
        let encoded = serde_json::to_string_pretty(&payload).map_err(|e| {
            Error::validation(format!("Failed to encode secrets config: {e}"))
        })?;
        Ok(encoded + "\n")
    }
}

impl Module for SecretDelivery {
    fn name(&self) -> &str {
        "secret-delivery"
    }

    fn setup(&self, image: &mut Image) -> Result<()> {
        image.build_install(GUEST_INIT_BUILD_PACKAGES)?;
        image.build(vec![BuildSpec {
            name: "secret-delivery".to_string(),
            kind: BuildKind::Go { ldflags: None },
            src: BuildSource::Fetch {
                fetch: Fetch::git(&self.source_repo, &self.source_ref),
            },
            output: AGENT_BINARY.to_string(),
            toolchain: "go1.22".to_string(),
            target_arch: Arch::X86_64,
            flags: Vec::new(),
            build_deps: GUEST_INIT_BUILD_PACKAGES.iter().map(|s| s.to_string()).collect(),
            env: BTreeMap::new(),
            artifacts: BTreeMap::new(),
        }])?;
        Ok(())
    }

    fn install(&self, image: &mut Image) -> Result<()> {
        for spec in &self.secrets {
            image.secret(spec.clone())?;
        }
        image.secrets_delivery(SecretsDeliveryConfig {
            method: "http_post".to_string(),
            port: self.port,
            completion: self.completion,
            reject_unknown: self.reject_unknown,
        })?;
        image.file(SECRETS_CONFIG_PATH, &self.render_config()?)?;
        image.add_init_script(
            "secret-delivery",
            INIT_PRIORITY,
            &format!(
                "{AGENT_BINARY} --config {SECRETS_CONFIG_PATH} --method http_post --port {}",
                self.port
            ),
        )?;
        Ok(())
    }
}
