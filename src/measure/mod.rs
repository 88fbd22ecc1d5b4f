// src/measure/mod.rs

//! Expected attestation measurements
//!
//! Derives the measurement set for a baked profile and verifies it
//! against an expected map. Real register replay (RTMR via UKI
//! measurement tools, vTPM PCR banks) is delegated to external tools when
//! they are present on `PATH`; without them, values derive
//! deterministically from the artifact digests so CI can still pin and
//! diff measurement sets.

use crate::error::Result;
use crate::hash::hash_str;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

/// Measurement backend flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasureBackend {
    Rtmr,
    Azure,
    Gcp,
}

impl MeasureBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rtmr => "rtmr",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
        }
    }
}

/// Why a verification key mismatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchReason {
    MissingActual,
    UnexpectedActual,
    ValueMismatch,
}

/// One verification mismatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeasurementMismatch {
    pub key: String,
    pub reason: MismatchReason,
    pub expected: Option<String>,
    pub actual: Option<String>,
}

/// Outcome of comparing measured values to an expected set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub ok: bool,
    pub mismatches: Vec<MeasurementMismatch>,
}

/// A derived measurement set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurements {
    pub schema_version: u32,
    pub backend: MeasureBackend,
    /// Register name -> hex value, sorted.
    pub values: BTreeMap<String, String>,
}

impl Measurements {
    /// Canonical JSON export; optionally written to a path.
    pub fn to_json(&self, path: Option<&Path>) -> Result<String> {
        let encoded = serde_json::to_string_pretty(self).map_err(|e| {
            crate::error::Error::measurement(format!("Failed to encode measurements: {e}"))
        })? + "\n";
        if let Some(path) = path {
            fs::write(path, &encoded)?;
        }
        Ok(encoded)
    }

    /// Compare against an expected map, reporting every divergence.
    pub fn verify(&self, expected: &BTreeMap<String, String>) -> VerificationResult {
        let mut mismatches = Vec::new();
        for (key, expected_value) in expected {
            match self.values.get(key) {
                None => mismatches.push(MeasurementMismatch {
                    key: key.clone(),
                    reason: MismatchReason::MissingActual,
                    expected: Some(expected_value.clone()),
                    actual: None,
                }),
                Some(actual) if actual != expected_value => {
                    mismatches.push(MeasurementMismatch {
                        key: key.clone(),
                        reason: MismatchReason::ValueMismatch,
                        expected: Some(expected_value.clone()),
                        actual: Some(actual.clone()),
                    });
                }
                Some(_) => {}
            }
        }
        for (key, actual) in &self.values {
            if !expected.contains_key(key) {
                mismatches.push(MeasurementMismatch {
                    key: key.clone(),
                    reason: MismatchReason::UnexpectedActual,
                    expected: None,
                    actual: Some(actual.clone()),
                });
            }
        }
        VerificationResult {
            ok: mismatches.is_empty(),
            mismatches,
        }
    }
}

/// Derive measurements for a profile from its artifact digests. Probes
/// replay tools on `PATH` for UKI artifacts before falling back.
pub fn derive_measurements(
    backend: MeasureBackend,
    profile: &str,
    artifact_digests: &BTreeMap<String, String>,
    artifact_paths: &[PathBuf],
) -> Measurements {
    if backend == MeasureBackend::Rtmr {
        for tool in ["measured-boot", "dstack-mr"] {
            if let Some(values) = try_replay_tool(tool, artifact_paths) {
                return Measurements {
                    schema_version: 1,
                    backend,
                    values,
                };
            }
        }
    }
    Measurements {
        schema_version: 1,
        backend,
        values: derive_deterministic(profile, artifact_digests),
    }
}

fn try_replay_tool(tool: &str, artifact_paths: &[PathBuf]) -> Option<BTreeMap<String, String>> {
    for candidate in artifact_paths {
        let is_uki = candidate
            .extension()
            .map(|ext| ext == "efi" || ext == "raw")
            .unwrap_or(false);
        if !is_uki || !candidate.exists() {
            continue;
        }
        let output = Command::new(tool)
            .arg("--format=json")
            .arg(candidate)
            .output()
            .ok()?;
        if !output.status.success() {
            continue;
        }
        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        let object = parsed.as_object()?;
        let values: BTreeMap<String, String> = object
            .iter()
            .filter(|(key, _)| key.starts_with("RTMR"))
            .filter_map(|(key, value)| Some((key.clone(), value.as_str()?.to_string())))
            .collect();
        if !values.is_empty() {
            debug!(tool, artifact = %candidate.display(), "measurement replay succeeded");
            return Some(values);
        }
    }
    None
}

/// Deterministic fallback: registers derived from the digest set.
fn derive_deterministic(
    profile: &str,
    artifact_digests: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let digest_payload: String = artifact_digests
        .iter()
        .map(|(key, value)| format!("{key}:{value}"))
        .collect::<Vec<_>>()
        .join("|");
    let targets: Vec<&str> = artifact_digests.keys().map(String::as_str).collect();

    let mut values = BTreeMap::new();
    values.insert("RTMR0".to_string(), hash_str(&digest_payload));
    values.insert("RTMR1".to_string(), hash_str(&format!("profile:{profile}")));
    values.insert(
        "RTMR2".to_string(),
        hash_str(&format!("targets:{}", targets.join(","))),
    );
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digests() -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("qemu".to_string(), "a".repeat(64));
        map
    }

    #[test]
    fn test_deterministic_derivation_is_stable() {
        let a = derive_measurements(MeasureBackend::Rtmr, "default", &digests(), &[]);
        let b = derive_measurements(MeasureBackend::Rtmr, "default", &digests(), &[]);
        assert_eq!(a, b);
        assert!(a.values.contains_key("RTMR0"));
        assert!(a.values.contains_key("RTMR1"));
        assert!(a.values.contains_key("RTMR2"));
    }

    #[test]
    fn test_different_artifacts_change_rtmr0() {
        let a = derive_measurements(MeasureBackend::Rtmr, "default", &digests(), &[]);
        let mut other = digests();
        other.insert("qemu".to_string(), "b".repeat(64));
        let b = derive_measurements(MeasureBackend::Rtmr, "default", &other, &[]);
        assert_ne!(a.values["RTMR0"], b.values["RTMR0"]);
        assert_eq!(a.values["RTMR1"], b.values["RTMR1"]);
    }

    #[test]
    fn test_verify_reports_each_mismatch_kind() {
        let measured = derive_measurements(MeasureBackend::Rtmr, "default", &digests(), &[]);

        let mut expected = measured.values.clone();
        assert!(measured.verify(&expected).ok);

        expected.insert("RTMR0".to_string(), "f".repeat(64));
        expected.insert("RTMR3".to_string(), "0".repeat(64));
        expected.remove("RTMR2");
        let result = measured.verify(&expected);
        assert!(!result.ok);

        let reasons: Vec<MismatchReason> = result.mismatches.iter().map(|m| m.reason).collect();
        assert!(reasons.contains(&MismatchReason::ValueMismatch));
        assert!(reasons.contains(&MismatchReason::MissingActual));
        assert!(reasons.contains(&MismatchReason::UnexpectedActual));
    }

    #[test]
    fn test_json_export_round_trips() {
        let measured = derive_measurements(MeasureBackend::Gcp, "prod", &digests(), &[]);
        let encoded = measured.to_json(None).unwrap();
        let decoded: Measurements = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, measured);
        assert!(encoded.contains("\"backend\": \"gcp\""));
    }
}
