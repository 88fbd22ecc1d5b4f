// src/secrets/mod.rs

//! Secrets delivery state machine and runtime materialization
//!
//! The guest-side engine accepts JSON payloads of the form
//! `{"secrets": {name: value}}`, validates them against the declared
//! schemas, tracks the required set, and on completion materializes every
//! target atomically before signalling `secrets-ready.target`.
//!
//! State machine: `Listening -> Partial -> Complete -> Sealed`, with
//! `Rejected` as the unrecoverable terminal state. Validation failures
//! never advance state; delivery can be retried until sealed.
//!
//! Secret *values* exist only in process memory and in the materialized
//! runtime targets. They are never serialized, logged, or debugged —
//! only names and schemas are.

#[cfg(feature = "agent")]
pub mod agent;

use crate::error::{Error, Result};
use crate::models::{
    CompletionMode, EnvScope, SecretKind, SecretSchema, SecretSpec, SecretTarget,
    SecretsDeliveryConfig,
};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Relative path of the global env file under the runtime root.
pub const GLOBAL_ENV_RELATIVE_PATH: &str = "run/tdx-secrets/global.env";

/// Relative path of the readiness sentinel under the runtime root.
pub const READY_SENTINEL_RELATIVE_PATH: &str = "run/tdx-secrets/.ready";

/// Delivery lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Listening,
    Partial,
    Complete,
    Sealed,
    Rejected,
}

/// Outcome of one delivery attempt, mapped to HTTP status by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// All required secrets validated and materialized (HTTP 204).
    Complete,
    /// Accepted, required set still incomplete (HTTP 202).
    Partial { missing_required: Vec<String> },
    /// Schema violation; names only, never values (HTTP 400).
    SchemaViolation { names: Vec<String> },
    /// Unknown keys while `reject_unknown` is set (HTTP 422).
    UnknownKeys { names: Vec<String> },
    /// Already sealed (HTTP 409).
    Sealed,
}

/// Guest-side delivery engine. Single-threaded by contract; the HTTP
/// agent serializes access behind a mutex.
pub struct DeliveryEngine {
    expected: BTreeMap<String, SecretSpec>,
    config: SecretsDeliveryConfig,
    runtime_root: PathBuf,
    received: BTreeMap<String, String>,
    state: DeliveryState,
}

impl fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Values are intentionally absent.
        f.debug_struct("DeliveryEngine")
            .field("expected", &self.expected.keys().collect::<Vec<_>>())
            .field("received", &self.received.keys().collect::<Vec<_>>())
            .field("state", &self.state)
            .finish()
    }
}

impl DeliveryEngine {
    pub fn new(
        secrets: impl IntoIterator<Item = SecretSpec>,
        config: SecretsDeliveryConfig,
        runtime_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            expected: secrets.into_iter().map(|s| (s.name.clone(), s)).collect(),
            config,
            runtime_root: runtime_root.into(),
            received: BTreeMap::new(),
            state: DeliveryState::Listening,
        }
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Names of required secrets without a validated value yet.
    pub fn missing_required(&self) -> Vec<String> {
        self.expected
            .values()
            .filter(|s| s.required && !self.received.contains_key(&s.name))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Handle one delivery payload. Validation failures leave all state
    /// untouched; a payload is stored all-or-nothing.
    pub fn deliver(&mut self, payload: &BTreeMap<String, String>) -> Result<DeliveryOutcome> {
        if matches!(self.state, DeliveryState::Sealed) {
            debug!("delivery rejected: already sealed");
            return Ok(DeliveryOutcome::Sealed);
        }
        if matches!(self.state, DeliveryState::Rejected) {
            return Err(Error::validation("Secret delivery is in the rejected terminal state.")
                .with_operation("deliver"));
        }

        let expected_names: BTreeSet<&String> = self.expected.keys().collect();
        let unknown: Vec<String> = payload
            .keys()
            .filter(|name| !expected_names.contains(name))
            .cloned()
            .collect();
        if !unknown.is_empty() && self.config.reject_unknown {
            warn!(names = ?unknown, "delivery rejected: unknown secrets");
            return Ok(DeliveryOutcome::UnknownKeys { names: unknown });
        }

        // Validate the whole payload before storing any of it.
        let mut violations: Vec<String> = Vec::new();
        for (name, value) in payload {
            let Some(spec) = self.expected.get(name) else {
                continue; // unknown but tolerated
            };
            if let Some(existing) = self.received.get(name) {
                if existing == value {
                    continue; // idempotent re-delivery
                }
                if spec.required {
                    violations.push(name.clone());
                    continue;
                }
            }
            if let Some(reason) = validate_value(spec.schema.as_ref(), value) {
                debug!(name = %name, reason = %reason, "secret failed schema validation");
                violations.push(name.clone());
            }
        }
        if !violations.is_empty() {
            warn!(names = ?violations, "delivery rejected: schema violations");
            return Ok(DeliveryOutcome::SchemaViolation { names: violations });
        }

        for (name, value) in payload {
            if self.expected.contains_key(name) {
                self.received.insert(name.clone(), value.clone());
            }
        }

        let missing = self.missing_required();
        let complete = match self.config.completion {
            CompletionMode::AllRequired => missing.is_empty(),
            CompletionMode::Any => !self.received.is_empty(),
        };
        if !complete {
            self.state = DeliveryState::Partial;
            info!(missing = ?missing, "delivery partial");
            return Ok(DeliveryOutcome::Partial {
                missing_required: missing,
            });
        }

        self.state = DeliveryState::Complete;
        if let Err(e) = self.materialize() {
            // Materialization is the unrecoverable failure mode: state on
            // disk may be partial, so no retry can be trusted.
            self.state = DeliveryState::Rejected;
            return Err(e);
        }
        self.signal_ready();
        self.state = DeliveryState::Sealed;
        info!("delivery complete and sealed");
        Ok(DeliveryOutcome::Complete)
    }

    /// Write every target atomically: files as `<dest>.tmp` + rename with
    /// mode applied, env targets collected into one sorted global.env.
    fn materialize(&self) -> Result<()> {
        let mut global_env: BTreeMap<String, String> = BTreeMap::new();

        for (name, spec) in &self.expected {
            let Some(value) = self.received.get(name) else {
                continue;
            };
            for target in &spec.targets {
                match target {
                    SecretTarget::File {
                        dest,
                        mode,
                        owner,
                        group,
                    } => {
                        let path = self.rooted(dest);
                        write_atomic(&path, value.as_bytes(), mode)?;
                        apply_ownership(&path, owner.as_deref(), group.as_deref());
                        debug!(name = %name, dest = %dest, "secret file target materialized");
                    }
                    SecretTarget::Env { name: env_name, scope } => {
                        if *scope == EnvScope::Global {
                            global_env.insert(env_name.clone(), value.clone());
                        }
                    }
                }
            }
        }

        if !global_env.is_empty() {
            let lines: String = global_env
                .iter()
                .map(|(k, v)| format!("{k}={v}\n"))
                .collect();
            let path = self.rooted(GLOBAL_ENV_RELATIVE_PATH);
            write_atomic(&path, lines.as_bytes(), "0400")?;
            debug!(entries = global_env.len(), "global env materialized");
        }
        Ok(())
    }

    /// Reach `secrets-ready.target`: drop the sentinel, then ask systemd
    /// to start the target when running inside a booted guest.
    fn signal_ready(&self) {
        let sentinel = self.rooted(READY_SENTINEL_RELATIVE_PATH);
        if let Some(parent) = sentinel.parent() {
            let _ = fs::create_dir_all(parent);
        }
        if let Err(e) = fs::write(&sentinel, b"ready\n") {
            warn!(error = %e, "failed to write readiness sentinel");
        }
        let started = Command::new("systemctl")
            .args(["start", "--no-block", "secrets-ready.target"])
            .status();
        match started {
            Ok(status) if status.success() => info!("secrets-ready.target signalled"),
            Ok(status) => warn!(code = ?status.code(), "systemctl start secrets-ready.target failed"),
            Err(_) => debug!("systemctl unavailable; sentinel only"),
        }
    }

    fn rooted(&self, dest: &str) -> PathBuf {
        self.runtime_root.join(dest.trim_start_matches('/'))
    }
}

/// Validate a value against a schema. Returns a reason string on failure;
/// the reason names the constraint, never the value.
pub fn validate_value(schema: Option<&SecretSchema>, value: &str) -> Option<String> {
    let Some(schema) = schema else {
        return None;
    };
    match schema.kind {
        SecretKind::String | SecretKind::Bytes => {}
        SecretKind::Hex => {
            if value.is_empty() || !value.chars().all(|c| c.is_ascii_hexdigit()) {
                return Some("value is not hex".to_string());
            }
        }
    }
    if let Some(min) = schema.min_len {
        if value.len() < min {
            return Some(format!("minimum length is {min}"));
        }
    }
    if let Some(max) = schema.max_len {
        if value.len() > max {
            return Some(format!("maximum length is {max}"));
        }
    }
    if let Some(ref pattern) = schema.pattern {
        match Regex::new(pattern) {
            Ok(regex) => {
                if !regex.is_match(value) {
                    return Some(format!("value does not match pattern {pattern}"));
                }
            }
            Err(_) => return Some(format!("invalid pattern {pattern}")),
        }
    }
    None
}

fn write_atomic(path: &Path, payload: &[u8], mode: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = PathBuf::from(format!("{}.tmp", path.display()));
    fs::write(&temp_path, payload)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let bits = u32::from_str_radix(mode.trim_start_matches("0o"), 8).map_err(|_| {
            Error::validation(format!("Invalid file mode `{mode}`.")).with_operation("materialize")
        })?;
        fs::set_permissions(&temp_path, fs::Permissions::from_mode(bits))?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Numeric uid/gid are applied directly; symbolic names are resolved by
/// the init tooling inside the guest and skipped here.
fn apply_ownership(path: &Path, owner: Option<&str>, group: Option<&str>) {
    #[cfg(unix)]
    {
        let uid = owner.and_then(|o| o.parse::<u32>().ok());
        let gid = group.and_then(|g| g.parse::<u32>().ok());
        if uid.is_some() || gid.is_some() {
            if let Err(e) = std::os::unix::fs::chown(path, uid, gid) {
                warn!(path = %path.display(), error = %e, "failed to apply ownership");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, owner, group);
    }
}
