// src/lib.rs

//! tdxvm — declarative recipes for bootable TDX VM images
//!
//! Users describe an image (packages, files, users, services, secrets,
//! source builds, boot-time init steps, cloud output formats) as a
//! declarative recipe in host code. The SDK compiles that recipe into a
//! deterministic mkosi project tree, drives the image builder through an
//! execution backend, records a lockfile of every external input, and
//! derives expected attestation measurements.
//!
//! # Architecture
//!
//! - Declarative-first: recipe methods only mutate in-memory state;
//!   all I/O happens in the explicit output operations
//! - Deterministic emission: byte-identical trees for identical recipes
//! - Lockfile + content-addressed cache: frozen bakes refuse anything
//!   not already pinned
//! - Policy-gated side effects: network, integrity, and mutable-ref
//!   decisions go through one policy engine
//! - Composable boot-time init with a sealed secrets-delivery pipeline
//!
//! # Example
//!
//! ```no_run
//! use tdxvm::{Image, OutputTarget};
//!
//! # fn main() -> tdxvm::Result<()> {
//! let mut img = Image::new("debian/bookworm");
//! img.install(&["systemd", "curl"])?;
//! img.file("/etc/motd", "hi\n")?;
//! img.output_targets(&[OutputTarget::Qemu])?;
//! img.lock()?;
//! let result = img.bake(true)?;
//! assert!(result.artifact_for("default", OutputTarget::Qemu).is_some());
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod builders;
pub mod cache;
pub mod compiler;
pub mod deploy;
mod error;
pub mod fetch;
pub mod hash;
pub mod init;
pub mod ir;
pub mod lockfile;
pub mod measure;
pub mod models;
pub mod modules;
pub mod policy;
pub mod recipe;
pub mod secrets;

pub use error::{Context, Error, Result};
pub use models::{
    Arch, BuildKind, BuildSource, BuildSpec, CommandSpec, CompletionMode, DebloatConfig, EnvScope,
    Fetch, FetchKind, FileEntry, InitScriptEntry, Kernel, OutputTarget, Phase, RepositorySpec,
    RestartPolicy, SecretKind, SecretSchema, SecretSpec, SecretTarget, SecretsDeliveryConfig,
    SecurityProfile, ServiceSpec, UserSpec, PHASE_ORDER,
};
pub use policy::{MutableRefPolicy, NetworkMode, Policy};
pub use recipe::Image;
