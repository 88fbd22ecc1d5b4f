// src/error.rs

//! Central error model with stable, machine-readable error codes
//!
//! Every error carries a `code` (stable across releases, suitable for
//! scripting against), an optional `hint` with remediation guidance, and a
//! `Context` naming the profile/phase/operation that surfaced it.
//!
//! | Code | Meaning |
//! |------|---------|
//! | `E_VALIDATION` | Recipe violates an invariant |
//! | `E_PHASE_ORDER_INVALID` | Command references an artifact not yet available |
//! | `E_LOCKFILE` | Missing, stale, or digest-mismatched lock |
//! | `E_POLICY` | Policy rejected an operation |
//! | `E_REPRODUCIBILITY` | Determinism self-check or integrity check failed |
//! | `E_BACKEND_EXECUTION` | Backend preflight or mkosi run failed |
//! | `E_MEASUREMENT` | Measurement requested without artifacts, or mismatch |
//! | `E_DEPLOYMENT` | Deploy requested for an unavailable target |

use std::fmt;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Where an error happened: profile, phase, and operation names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    pub profile: Option<String>,
    pub phase: Option<String>,
    pub operation: Option<String>,
}

impl Context {
    pub fn is_empty(&self) -> bool {
        self.profile.is_none() && self.phase.is_none() && self.operation.is_none()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(ref profile) = self.profile {
            parts.push(format!("profile={profile}"));
        }
        if let Some(ref phase) = self.phase {
            parts.push(format!("phase={phase}"));
        }
        if let Some(ref operation) = self.operation {
            parts.push(format!("operation={operation}"));
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// SDK error taxonomy.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{message}")]
    Validation {
        message: String,
        hint: Option<String>,
        context: Context,
    },

    #[error("{message}")]
    PhaseOrder {
        message: String,
        hint: Option<String>,
        context: Context,
    },

    #[error("{message}")]
    Lockfile {
        message: String,
        hint: Option<String>,
        context: Context,
    },

    #[error("{message}")]
    Policy {
        message: String,
        hint: Option<String>,
        context: Context,
    },

    #[error("{message}")]
    Reproducibility {
        message: String,
        hint: Option<String>,
        context: Context,
    },

    #[error("{message}")]
    BackendExecution {
        message: String,
        hint: Option<String>,
        context: Context,
    },

    #[error("{message}")]
    Measurement {
        message: String,
        hint: Option<String>,
        context: Context,
    },

    #[error("{message}")]
    Deployment {
        message: String,
        hint: Option<String>,
        context: Context,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

macro_rules! constructor {
    ($fn_name:ident, $variant:ident) => {
        pub fn $fn_name(message: impl Into<String>) -> Self {
            Self::$variant {
                message: message.into(),
                hint: None,
                context: Context::default(),
            }
        }
    };
}

impl Error {
    constructor!(validation, Validation);
    constructor!(phase_order, PhaseOrder);
    constructor!(lockfile, Lockfile);
    constructor!(policy, Policy);
    constructor!(reproducibility, Reproducibility);
    constructor!(backend, BackendExecution);
    constructor!(measurement, Measurement);
    constructor!(deployment, Deployment);

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "E_VALIDATION",
            Self::PhaseOrder { .. } => "E_PHASE_ORDER_INVALID",
            Self::Lockfile { .. } => "E_LOCKFILE",
            Self::Policy { .. } => "E_POLICY",
            Self::Reproducibility { .. } => "E_REPRODUCIBILITY",
            Self::BackendExecution { .. } => "E_BACKEND_EXECUTION",
            Self::Measurement { .. } => "E_MEASUREMENT",
            Self::Deployment { .. } => "E_DEPLOYMENT",
            Self::Io(_) => "E_IO",
        }
    }

    /// Remediation hint, when one was attached.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Validation { hint, .. }
            | Self::PhaseOrder { hint, .. }
            | Self::Lockfile { hint, .. }
            | Self::Policy { hint, .. }
            | Self::Reproducibility { hint, .. }
            | Self::BackendExecution { hint, .. }
            | Self::Measurement { hint, .. }
            | Self::Deployment { hint, .. } => hint.as_deref(),
            Self::Io(_) => None,
        }
    }

    /// Profile/phase/operation context, when attached.
    pub fn context(&self) -> Option<&Context> {
        match self {
            Self::Validation { context, .. }
            | Self::PhaseOrder { context, .. }
            | Self::Lockfile { context, .. }
            | Self::Policy { context, .. }
            | Self::Reproducibility { context, .. }
            | Self::BackendExecution { context, .. }
            | Self::Measurement { context, .. }
            | Self::Deployment { context, .. } => Some(context),
            Self::Io(_) => None,
        }
    }

    /// Builder: attach a remediation hint.
    pub fn with_hint(mut self, text: impl Into<String>) -> Self {
        if let Some(slot) = self.hint_mut() {
            *slot = Some(text.into());
        }
        self
    }

    /// Builder: attach the profile name to the context.
    pub fn with_profile(mut self, name: impl Into<String>) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.profile = Some(name.into());
        }
        self
    }

    /// Builder: attach the phase name to the context.
    pub fn with_phase(mut self, name: impl Into<String>) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.phase = Some(name.into());
        }
        self
    }

    /// Builder: attach the operation name to the context.
    pub fn with_operation(mut self, name: impl Into<String>) -> Self {
        if let Some(ctx) = self.context_mut() {
            ctx.operation = Some(name.into());
        }
        self
    }

    fn hint_mut(&mut self) -> Option<&mut Option<String>> {
        match self {
            Self::Validation { hint, .. }
            | Self::PhaseOrder { hint, .. }
            | Self::Lockfile { hint, .. }
            | Self::Policy { hint, .. }
            | Self::Reproducibility { hint, .. }
            | Self::BackendExecution { hint, .. }
            | Self::Measurement { hint, .. }
            | Self::Deployment { hint, .. } => Some(hint),
            Self::Io(_) => None,
        }
    }

    fn context_mut(&mut self) -> Option<&mut Context> {
        match self {
            Self::Validation { context, .. }
            | Self::PhaseOrder { context, .. }
            | Self::Lockfile { context, .. }
            | Self::Policy { context, .. }
            | Self::Reproducibility { context, .. }
            | Self::BackendExecution { context, .. }
            | Self::Measurement { context, .. }
            | Self::Deployment { context, .. } => Some(context),
            Self::Io(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(Error::validation("x").code(), "E_VALIDATION");
        assert_eq!(Error::phase_order("x").code(), "E_PHASE_ORDER_INVALID");
        assert_eq!(Error::lockfile("x").code(), "E_LOCKFILE");
        assert_eq!(Error::policy("x").code(), "E_POLICY");
        assert_eq!(Error::reproducibility("x").code(), "E_REPRODUCIBILITY");
        assert_eq!(Error::backend("x").code(), "E_BACKEND_EXECUTION");
        assert_eq!(Error::measurement("x").code(), "E_MEASUREMENT");
        assert_eq!(Error::deployment("x").code(), "E_DEPLOYMENT");
    }

    #[test]
    fn test_builder_attaches_hint_and_context() {
        let err = Error::validation("duplicate user")
            .with_hint("user names must be unique within a profile")
            .with_profile("default")
            .with_phase("postinst")
            .with_operation("user");

        assert_eq!(err.hint(), Some("user names must be unique within a profile"));
        let ctx = err.context().unwrap();
        assert_eq!(ctx.profile.as_deref(), Some("default"));
        assert_eq!(ctx.phase.as_deref(), Some("postinst"));
        assert_eq!(ctx.operation.as_deref(), Some("user"));
    }

    #[test]
    fn test_context_display() {
        let err = Error::lockfile("stale").with_operation("bake").with_profile("prod");
        let rendered = err.context().unwrap().to_string();
        assert!(rendered.contains("profile=prod"));
        assert!(rendered.contains("operation=bake"));
    }

    #[test]
    fn test_io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert_eq!(err.code(), "E_IO");
        assert!(err.context().is_none());
    }
}
