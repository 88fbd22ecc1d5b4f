// src/models/mod.rs

//! Core typed records for recipe state and build/deploy requests
//!
//! Everything here is plain data: the Recipe API appends these records to
//! profile state, the IR snapshot freezes them, and the emitter consumes
//! them. All collections use `BTreeMap`/`BTreeSet` so canonical JSON
//! serialization (and therefore the recipe digest) is stable regardless of
//! declaration order where order has no semantic meaning.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// Target CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    #[default]
    X86_64,
    Aarch64,
}

impl Arch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
        }
    }

    /// The spelling mkosi expects in `Architecture=`.
    pub fn mkosi_arch(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86-64",
            Self::Aarch64 => "arm64",
        }
    }

    /// The .NET runtime identifier for this architecture.
    pub fn dotnet_runtime(&self) -> &'static str {
        match self {
            Self::X86_64 => "linux-x64",
            Self::Aarch64 => "linux-arm64",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cloud/VM output formats a bake can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputTarget {
    Qemu,
    Azure,
    Gcp,
}

impl OutputTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Qemu => "qemu",
            Self::Azure => "azure",
            Self::Gcp => "gcp",
        }
    }

    /// Conventional artifact filename for this target.
    pub fn artifact_filename(&self) -> &'static str {
        match self {
            Self::Qemu => "disk.qcow2",
            Self::Azure => "disk.vhd",
            Self::Gcp => "disk.raw.tar.gz",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "qemu" => Some(Self::Qemu),
            "azure" => Some(Self::Azure),
            "gcp" => Some(Self::Gcp),
            _ => None,
        }
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build phase. Ordering is fixed: the enum declaration order is the
/// phase execution order, and `boot` is runtime-only (realized through
/// the init subsystem, never a build script).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Sync,
    Skeleton,
    Prepare,
    Build,
    Extra,
    Postinst,
    Finalize,
    Postoutput,
    Clean,
    Repart,
    Boot,
}

/// All phases in execution order.
pub const PHASE_ORDER: [Phase; 11] = [
    Phase::Sync,
    Phase::Skeleton,
    Phase::Prepare,
    Phase::Build,
    Phase::Extra,
    Phase::Postinst,
    Phase::Finalize,
    Phase::Postoutput,
    Phase::Clean,
    Phase::Repart,
    Phase::Boot,
];

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Skeleton => "skeleton",
            Self::Prepare => "prepare",
            Self::Build => "build",
            Self::Extra => "extra",
            Self::Postinst => "postinst",
            Self::Finalize => "finalize",
            Self::Postoutput => "postoutput",
            Self::Clean => "clean",
            Self::Repart => "repart",
            Self::Boot => "boot",
        }
    }

    /// 1-based position in the fixed phase order.
    pub fn index(&self) -> usize {
        PHASE_ORDER.iter().position(|p| p == self).unwrap_or(0) + 1
    }

    /// Emitted script filename, e.g. `03-prepare.sh`.
    pub fn script_name(&self) -> String {
        format!("{:02}-{}.sh", self.index(), self.as_str())
    }

    /// The `[Content]` key mkosi uses to reference this phase's script.
    pub fn mkosi_conf_key(&self) -> Option<&'static str> {
        match self {
            Self::Sync => Some("SyncScripts"),
            Self::Prepare => Some("PrepareScripts"),
            Self::Build => Some("BuildScripts"),
            Self::Postinst => Some("PostInstallationScripts"),
            Self::Finalize => Some("FinalizeScripts"),
            Self::Postoutput => Some("PostOutputScripts"),
            Self::Clean => Some("CleanScripts"),
            _ => None,
        }
    }

    /// Whether this phase may carry an emitted build script at all.
    pub fn emits_script(&self) -> bool {
        !matches!(self, Self::Boot)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single command registered into a phase script.
///
/// `argv` is the safe form; `shell=true` opts into `bash -lc` execution.
/// Tokens like `$BUILDROOT`, `$BUILDDIR`, `$DESTDIR`, `$OUTPUTDIR` pass
/// through untouched — mkosi expands them at build time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub shell: bool,
}

impl CommandSpec {
    pub fn new(argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            cwd: None,
            shell: false,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_shell(mut self) -> Self {
        self.shell = true;
        self
    }
}

/// An extra package repository for the image's package manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySpec {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub suite: Option<String>,
    #[serde(default)]
    pub components: Vec<String>,
    /// Local keyring path or the digest of a resolved keyring fetch.
    #[serde(default)]
    pub keyring: Option<String>,
    #[serde(default = "default_repo_priority")]
    pub priority: i32,
}

fn default_repo_priority() -> i32 {
    100
}

impl RepositorySpec {
    /// Construct with the name derived from the URL's last segment.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let name = url
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(&url)
            .to_string();
        Self {
            name,
            url,
            suite: None,
            components: Vec::new(),
            keyring: None,
            priority: default_repo_priority(),
        }
    }

    pub fn with_suite(mut self, suite: impl Into<String>) -> Self {
        self.suite = Some(suite.into());
        self
    }

    pub fn with_components(mut self, components: Vec<String>) -> Self {
        self.components = components;
        self
    }

    pub fn with_keyring(mut self, keyring: impl Into<String>) -> Self {
        self.keyring = Some(keyring.into());
        self
    }
}

/// A file placed into the image (`mkosi.extra/` or `mkosi.skeleton/`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
    #[serde(default = "default_file_mode")]
    pub mode: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub allow_overwrite: bool,
}

fn default_file_mode() -> String {
    "0644".to_string()
}

impl FileEntry {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            mode: default_file_mode(),
            owner: None,
            group: None,
            allow_overwrite: false,
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }
}

/// A template rendered at declaration time with deterministic settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateEntry {
    pub path: String,
    pub template: String,
    pub variables: BTreeMap<String, String>,
    pub rendered: String,
    #[serde(default = "default_file_mode")]
    pub mode: String,
}

/// A user created in the image via `mkosi-chroot useradd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    pub name: String,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default = "default_user_shell")]
    pub shell: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

fn default_user_shell() -> String {
    "/usr/sbin/nologin".to_string()
}

impl UserSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: None,
            gid: None,
            system: false,
            home: None,
            shell: default_user_shell(),
            groups: Vec::new(),
        }
    }

    pub fn system(mut self) -> Self {
        self.system = true;
        self
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn with_gid(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }

    pub fn with_home(mut self, home: impl Into<String>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }
}

/// Service restart policy, matching systemd's `Restart=` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    OnFailure,
    Always,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::OnFailure => "on-failure",
            Self::Always => "always",
        }
    }
}

/// Hardening preset applied to a generated unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecurityProfile {
    #[default]
    Default,
    Strict,
}

/// A systemd service generated into the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub exec: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub wants: Vec<String>,
    #[serde(default)]
    pub restart: RestartPolicy,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub security_profile: SecurityProfile,
    /// Extra unit sections merged verbatim, section -> key -> value.
    #[serde(default)]
    pub extra_unit: BTreeMap<String, BTreeMap<String, String>>,
}

fn default_true() -> bool {
    true
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, exec: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            exec: exec.into_iter().map(Into::into).collect(),
            user: None,
            after: Vec::new(),
            requires: Vec::new(),
            wants: Vec::new(),
            restart: RestartPolicy::No,
            enabled: true,
            security_profile: SecurityProfile::Default,
            extra_unit: BTreeMap::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_after(mut self, after: Vec<String>) -> Self {
        self.after = after;
        self
    }

    pub fn with_requires(mut self, requires: Vec<String>) -> Self {
        self.requires = requires;
        self
    }

    pub fn with_wants(mut self, wants: Vec<String>) -> Self {
        self.wants = wants;
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_security_profile(mut self, profile: SecurityProfile) -> Self {
        self.security_profile = profile;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The on-disk unit name (`<name>.service` unless already suffixed).
    pub fn unit_name(&self) -> String {
        if self.name.contains('.') {
            self.name.clone()
        } else {
            format!("{}.service", self.name)
        }
    }
}

/// Value shape a delivered secret must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecretKind {
    #[default]
    String,
    Hex,
    Bytes,
}

impl SecretKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Hex => "hex",
            Self::Bytes => "bytes",
        }
    }
}

/// Validation schema for a secret value. Only the schema (never a value)
/// is ever serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SecretSchema {
    #[serde(default)]
    pub kind: SecretKind,
    #[serde(default)]
    pub min_len: Option<usize>,
    #[serde(default)]
    pub max_len: Option<usize>,
    #[serde(default)]
    pub pattern: Option<String>,
}

/// Where a delivered secret value lands at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SecretTarget {
    File {
        dest: String,
        #[serde(default = "default_secret_mode")]
        mode: String,
        #[serde(default)]
        owner: Option<String>,
        #[serde(default)]
        group: Option<String>,
    },
    Env {
        name: String,
        #[serde(default)]
        scope: EnvScope,
    },
}

fn default_secret_mode() -> String {
    "0400".to_string()
}

/// Scope of an env-target secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnvScope {
    #[default]
    Service,
    Global,
}

impl SecretTarget {
    pub fn file(dest: impl Into<String>) -> Self {
        Self::File {
            dest: dest.into(),
            mode: default_secret_mode(),
            owner: None,
            group: None,
        }
    }

    pub fn file_with_mode(dest: impl Into<String>, mode: impl Into<String>) -> Self {
        Self::File {
            dest: dest.into(),
            mode: mode.into(),
            owner: None,
            group: None,
        }
    }

    pub fn env(name: impl Into<String>, scope: EnvScope) -> Self {
        Self::Env {
            name: name.into(),
            scope,
        }
    }
}

/// A declared secret: name, schema, and delivery targets. Values are
/// runtime-only and never appear in any emitted or persisted form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub schema: Option<SecretSchema>,
    pub targets: Vec<SecretTarget>,
}

/// Completion condition for the secrets delivery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompletionMode {
    #[default]
    AllRequired,
    Any,
}

/// How secrets reach the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretsDeliveryConfig {
    /// Only `http_post` is currently supported.
    #[serde(default = "default_delivery_method")]
    pub method: String,
    #[serde(default = "default_delivery_port")]
    pub port: u16,
    #[serde(default)]
    pub completion: CompletionMode,
    #[serde(default = "default_true")]
    pub reject_unknown: bool,
}

fn default_delivery_method() -> String {
    "http_post".to_string()
}

fn default_delivery_port() -> u16 {
    8081
}

impl Default for SecretsDeliveryConfig {
    fn default() -> Self {
        Self {
            method: default_delivery_method(),
            port: default_delivery_port(),
            completion: CompletionMode::default(),
            reject_unknown: true,
        }
    }
}

/// A boot-time init step contributed by a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitScriptEntry {
    pub id: String,
    pub priority: i32,
    /// Path (plus arguments) of the executable inside the image.
    pub exec: String,
    #[serde(default)]
    pub preconditions: Vec<String>,
}

/// Binaries kept when debloat prunes /usr/bin entries owned by systemd.
pub const DEBLOAT_BINS_KEEP: &[&str] = &[
    "journalctl",
    "systemctl",
    "systemd",
    "systemd-tty-ask-password-agent",
];

/// Units kept when debloat masks systemd-owned units.
pub const DEBLOAT_UNITS_KEEP: &[&str] = &[
    "basic.target",
    "local-fs-pre.target",
    "local-fs.target",
    "minimal.target",
    "network-online.target",
    "slices.target",
    "sockets.target",
    "sysinit.target",
    "systemd-journald-dev-log.socket",
    "systemd-journald.service",
    "systemd-journald.socket",
    "systemd-remount-fs.service",
    "systemd-sysctl.service",
];

/// Paths removed by default in the finalize phase when debloat is enabled.
pub const DEBLOAT_PATHS_REMOVE: &[&str] = &[
    "/usr/share/bash-completion",
    "/usr/share/doc",
    "/usr/share/info",
    "/usr/share/locale",
    "/usr/share/man",
    "/usr/share/zsh",
    "/var/cache/apt",
    "/var/lib/apt/lists",
];

/// Image slimming configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebloatConfig {
    pub enabled: bool,
    #[serde(default)]
    pub paths_remove: Vec<String>,
    #[serde(default)]
    pub paths_skip: Vec<String>,
    #[serde(default)]
    pub paths_remove_extra: Vec<String>,
    /// Profile name -> paths skipped only when that profile is selected.
    #[serde(default)]
    pub paths_skip_for_profiles: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_true")]
    pub systemd_minimize: bool,
    #[serde(default)]
    pub units_keep: Vec<String>,
    #[serde(default)]
    pub units_keep_extra: Vec<String>,
    #[serde(default)]
    pub bins_keep: Vec<String>,
}

impl Default for DebloatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            paths_remove: DEBLOAT_PATHS_REMOVE.iter().map(|s| s.to_string()).collect(),
            paths_skip: Vec::new(),
            paths_remove_extra: Vec::new(),
            paths_skip_for_profiles: BTreeMap::new(),
            systemd_minimize: true,
            units_keep: DEBLOAT_UNITS_KEEP.iter().map(|s| s.to_string()).collect(),
            units_keep_extra: Vec::new(),
            bins_keep: DEBLOAT_BINS_KEEP.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl DebloatConfig {
    /// Unconditional removal list: defaults + extras, minus skips, sorted.
    pub fn effective_paths_remove(&self) -> Vec<String> {
        let mut paths: BTreeSet<String> = self.paths_remove.iter().cloned().collect();
        paths.extend(self.paths_remove_extra.iter().cloned());
        for skip in &self.paths_skip {
            paths.remove(skip);
        }
        for profile_paths in self.paths_skip_for_profiles.values() {
            for path in profile_paths {
                paths.remove(path);
            }
        }
        paths.into_iter().collect()
    }

    /// Combined unit keep-list, sorted.
    pub fn effective_units_keep(&self) -> Vec<String> {
        let mut units: BTreeSet<String> = self.units_keep.iter().cloned().collect();
        units.extend(self.units_keep_extra.iter().cloned());
        units.into_iter().collect()
    }
}

/// Pinned kernel built from source during the build phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kernel {
    pub version: String,
    pub source_repo: String,
    #[serde(default)]
    pub config_file: Option<PathBuf>,
}

impl Kernel {
    pub fn pinned(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            source_repo: "https://github.com/gregkh/linux".to_string(),
            config_file: None,
        }
    }

    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    pub fn with_source_repo(mut self, repo: impl Into<String>) -> Self {
        self.source_repo = repo.into();
        self
    }
}

/// External input kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchKind {
    Http,
    Git,
}

/// An external input: HTTP artifact or git checkout. Resolution fills in
/// the immutable identity fields; an unresolved fetch cannot enter a
/// frozen bake.
///
/// Only the declared identity (url, integrity, requested ref) feeds the
/// recipe digest. Resolution results are pinned by the lockfile instead,
/// so resolving does not invalidate an existing lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fetch {
    pub kind: FetchKind,
    pub url: String,
    /// Expected SHA-256 for HTTP fetches.
    #[serde(default)]
    pub integrity: Option<String>,
    /// Requested ref for git fetches (branch, tag, or commit SHA).
    #[serde(default)]
    pub requested_ref: Option<String>,
    #[serde(skip)]
    pub resolved_commit: Option<String>,
    #[serde(skip)]
    pub resolved_tree_hash: Option<String>,
    /// Final URL after redirects, captured at resolution time.
    #[serde(skip)]
    pub final_url: Option<String>,
}

impl Fetch {
    pub fn http(url: impl Into<String>, integrity: impl Into<String>) -> Self {
        Self {
            kind: FetchKind::Http,
            url: url.into(),
            integrity: Some(integrity.into()),
            requested_ref: None,
            resolved_commit: None,
            resolved_tree_hash: None,
            final_url: None,
        }
    }

    pub fn git(url: impl Into<String>, requested_ref: impl Into<String>) -> Self {
        Self {
            kind: FetchKind::Git,
            url: url.into(),
            integrity: None,
            requested_ref: Some(requested_ref.into()),
            resolved_commit: None,
            resolved_tree_hash: None,
            final_url: None,
        }
    }

    /// Whether resolution has pinned this fetch to immutable identity.
    pub fn is_resolved(&self) -> bool {
        match self.kind {
            FetchKind::Http => self.integrity.is_some(),
            FetchKind::Git => {
                self.resolved_commit.is_some() && self.resolved_tree_hash.is_some()
            }
        }
    }
}

/// Language/toolchain variant of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "builder", rename_all = "lowercase")]
pub enum BuildKind {
    Go {
        #[serde(default)]
        ldflags: Option<String>,
    },
    Rust {
        #[serde(default)]
        features: Vec<String>,
    },
    Dotnet {
        #[serde(default)]
        sdk_version: Option<String>,
        #[serde(default)]
        self_contained: bool,
        #[serde(default)]
        project: Option<String>,
    },
    C {},
    Script {
        #[serde(default = "default_script_shell")]
        shell: String,
    },
}

fn default_script_shell() -> String {
    "bash".to_string()
}

impl BuildKind {
    pub fn builder_name(&self) -> &'static str {
        match self {
            Self::Go { .. } => "go",
            Self::Rust { .. } => "rust",
            Self::Dotnet { .. } => "dotnet",
            Self::C {} => "c",
            Self::Script { .. } => "script",
        }
    }
}

/// Where a build's source comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum BuildSource {
    /// Path inside the source tree (relative to `$BUILDROOT/build/`).
    Local { path: String },
    /// An external fetch (git clone or locked tarball).
    Fetch { fetch: Fetch },
}

/// A typed declaration producing a binary artifact from source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    pub name: String,
    pub kind: BuildKind,
    pub src: BuildSource,
    /// Install path of the primary artifact inside the image.
    pub output: String,
    /// Opaque toolchain identity pinning (e.g. "go1.22.3").
    pub toolchain: String,
    pub target_arch: Arch,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub build_deps: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Built path (relative to the build dir) -> install path in image.
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

/// All state declared for one profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileState {
    pub name: String,
    pub packages: BTreeSet<String>,
    pub build_packages: BTreeSet<String>,
    pub output_targets: Vec<OutputTarget>,
    pub phases: BTreeMap<Phase, Vec<CommandSpec>>,
    pub repositories: Vec<RepositorySpec>,
    pub files: Vec<FileEntry>,
    pub skeleton_files: Vec<FileEntry>,
    pub templates: Vec<TemplateEntry>,
    pub users: Vec<UserSpec>,
    pub services: Vec<ServiceSpec>,
    pub secrets: Vec<SecretSpec>,
    pub builds: Vec<BuildSpec>,
    pub fetches: Vec<Fetch>,
    pub init_scripts: Vec<InitScriptEntry>,
    pub debloat: DebloatConfig,
    pub secrets_delivery: Option<SecretsDeliveryConfig>,
}

impl ProfileState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output_targets: vec![OutputTarget::Qemu],
            ..Default::default()
        }
    }
}

/// Root recipe state: image-level settings plus per-profile declarations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeState {
    pub base: String,
    pub arch: Arch,
    pub default_profile: String,
    pub profiles: BTreeMap<String, ProfileState>,
}

impl RecipeState {
    pub fn initialize(base: impl Into<String>, arch: Arch, default_profile: &str) -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(default_profile.to_string(), ProfileState::new(default_profile));
        Self {
            base: base.into(),
            arch,
            default_profile: default_profile.to_string(),
            profiles,
        }
    }

    pub fn ensure_profile(&mut self, name: &str) -> &mut ProfileState {
        self.profiles
            .entry(name.to_string())
            .or_insert_with(|| ProfileState::new(name))
    }
}

/// A bake request handed to an execution backend.
#[derive(Debug, Clone)]
pub struct BakeRequest {
    pub profile: String,
    pub build_dir: PathBuf,
    pub emit_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub output_targets: Vec<OutputTarget>,
    pub frozen: bool,
    pub env: BTreeMap<String, String>,
}

/// One produced artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub target: OutputTarget,
    pub path: PathBuf,
    pub digest: Option<String>,
}

/// Per-profile bake outcome.
#[derive(Debug, Clone, Default)]
pub struct ProfileBuildResult {
    pub profile: String,
    pub artifacts: BTreeMap<OutputTarget, ArtifactRef>,
    pub report_path: Option<PathBuf>,
}

impl ProfileBuildResult {
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            ..Default::default()
        }
    }
}

/// Aggregate bake outcome across profiles.
#[derive(Debug, Clone, Default)]
pub struct BakeResult {
    pub profiles: BTreeMap<String, ProfileBuildResult>,
}

impl BakeResult {
    pub fn artifact_for(&self, profile: &str, target: OutputTarget) -> Option<&ArtifactRef> {
        self.profiles.get(profile)?.artifacts.get(&target)
    }
}

/// A deploy request handed to a target adapter.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub profile: String,
    pub target: OutputTarget,
    pub artifact_path: PathBuf,
    pub parameters: BTreeMap<String, String>,
}

/// Adapter outcome for a deploy.
#[derive(Debug, Clone)]
pub struct DeployResult {
    pub target: OutputTarget,
    pub deployment_id: String,
    pub endpoint: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_and_script_names() {
        assert_eq!(Phase::Sync.index(), 1);
        assert_eq!(Phase::Prepare.index(), 3);
        assert_eq!(Phase::Build.index(), 4);
        assert_eq!(Phase::Postinst.index(), 6);
        assert_eq!(Phase::Boot.index(), 11);
        assert_eq!(Phase::Prepare.script_name(), "03-prepare.sh");
        assert_eq!(Phase::Finalize.script_name(), "07-finalize.sh");
        assert!(!Phase::Boot.emits_script());
    }

    #[test]
    fn test_arch_mkosi_mapping() {
        assert_eq!(Arch::X86_64.mkosi_arch(), "x86-64");
        assert_eq!(Arch::Aarch64.mkosi_arch(), "arm64");
    }

    #[test]
    fn test_output_target_filenames() {
        assert_eq!(OutputTarget::Qemu.artifact_filename(), "disk.qcow2");
        assert_eq!(OutputTarget::Azure.artifact_filename(), "disk.vhd");
        assert_eq!(OutputTarget::Gcp.artifact_filename(), "disk.raw.tar.gz");
    }

    #[test]
    fn test_fetch_resolution_state() {
        let http = Fetch::http("https://example.com/a.tar.gz", "abc123");
        assert!(http.is_resolved());

        let mut git = Fetch::git("https://example.com/repo.git", "main");
        assert!(!git.is_resolved());
        git.resolved_commit = Some("a".repeat(40));
        git.resolved_tree_hash = Some("b".repeat(40));
        assert!(git.is_resolved());
    }

    #[test]
    fn test_debloat_effective_paths() {
        let mut config = DebloatConfig {
            enabled: true,
            ..Default::default()
        };
        config.paths_remove_extra.push("/usr/share/fonts".to_string());
        config.paths_skip.push("/usr/share/doc".to_string());

        let paths = config.effective_paths_remove();
        assert!(paths.contains(&"/usr/share/fonts".to_string()));
        assert!(paths.contains(&"/usr/share/man".to_string()));
        assert!(!paths.contains(&"/usr/share/doc".to_string()));
        // Sorted output
        let mut sorted = paths.clone();
        sorted.sort();
        assert_eq!(paths, sorted);
    }

    #[test]
    fn test_service_unit_name() {
        let svc = ServiceSpec {
            name: "app".to_string(),
            exec: vec!["/usr/bin/app".to_string()],
            user: None,
            after: vec![],
            requires: vec![],
            wants: vec![],
            restart: RestartPolicy::No,
            enabled: true,
            security_profile: SecurityProfile::Default,
            extra_unit: BTreeMap::new(),
        };
        assert_eq!(svc.unit_name(), "app.service");

        let socket = ServiceSpec {
            name: "app.socket".to_string(),
            ..svc
        };
        assert_eq!(socket.unit_name(), "app.socket");
    }

    #[test]
    fn test_recipe_state_always_has_default_profile() {
        let state = RecipeState::initialize("debian/bookworm", Arch::X86_64, "default");
        assert!(state.profiles.contains_key("default"));
        assert_eq!(state.profiles["default"].output_targets, vec![OutputTarget::Qemu]);
    }

    #[test]
    fn test_profile_state_serializes_with_sorted_collections() {
        let mut profile = ProfileState::new("default");
        profile.packages.insert("systemd".to_string());
        profile.packages.insert("curl".to_string());

        let json = serde_json::to_string(&profile).unwrap();
        let curl_at = json.find("curl").unwrap();
        let systemd_at = json.find("systemd").unwrap();
        assert!(curl_at < systemd_at);
    }
}
