// src/recipe/mod.rs

//! The declarative recipe API
//!
//! [`Image`] is the root object users build recipes against. Declarative
//! methods only append to (or merge into) the active profiles' state —
//! they never write to the filesystem or touch the network. All side
//! effects happen in the explicit output operations: [`Image::lock`],
//! [`Image::compile`], [`Image::bake`], [`Image::measure`], and
//! [`Image::deploy`], each of which starts from a validated IR snapshot.
//!
//! Profile scoping is closure-based: [`Image::with_profiles`] pushes the
//! selected set, broadcasts every declarative call inside the closure to
//! all selected profiles, and restores the previous selection on every
//! exit path.

mod template;

pub use template::render_template;

use crate::backends::{BuildBackend, InProcessBackend};
use crate::compiler::{self, debloat::DebloatPlan, EmitConfig, EmitMode, MkosiEmission};
use crate::error::{Error, Result};
use crate::fetch::{fetch_git, fetch_http};
use crate::hash::hash_file;
use crate::ir::ImageIr;
use crate::lockfile::{recipe_digest, LockedFetch, LockedGit, LockedModule, Lockfile, LOCKFILE_NAME};
use crate::measure::{derive_measurements, MeasureBackend, Measurements};
use crate::models::{
    Arch, BakeRequest, BakeResult, BuildSource, BuildSpec, CommandSpec, DebloatConfig, Fetch,
    FetchKind, FileEntry, InitScriptEntry, Kernel, OutputTarget, Phase, ProfileBuildResult,
    RecipeState, RepositorySpec, SecretSpec, SecretsDeliveryConfig, ServiceSpec, TemplateEntry,
    UserSpec,
};
use crate::modules::Module;
use crate::policy::{ensure_bake_allowed, Policy};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Root recipe object for one image.
pub struct Image {
    pub base: String,
    pub arch: Arch,
    pub build_dir: PathBuf,
    pub policy: Policy,
    pub reproducible: bool,
    pub with_network: bool,
    pub emit_mode: EmitMode,
    pub environment: BTreeMap<String, String>,
    pub environment_passthrough: Vec<String>,
    pub kernel: Option<Kernel>,
    pub generate_version_script: bool,

    backend: Box<dyn BuildBackend>,
    state: RecipeState,
    profile_stack: Vec<Vec<String>>,
    used_modules: Vec<LockedModule>,
    last_bake: Option<BakeResult>,
    last_compile: Option<(String, PathBuf, MkosiEmission)>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("base", &self.base)
            .field("arch", &self.arch)
            .field("build_dir", &self.build_dir)
            .field("policy", &self.policy)
            .field("reproducible", &self.reproducible)
            .field("with_network", &self.with_network)
            .field("emit_mode", &self.emit_mode)
            .field("environment", &self.environment)
            .field("environment_passthrough", &self.environment_passthrough)
            .field("kernel", &self.kernel)
            .field("generate_version_script", &self.generate_version_script)
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .field("profile_stack", &self.profile_stack)
            .field("used_modules", &self.used_modules)
            .field("last_bake", &self.last_bake)
            .field("last_compile", &self.last_compile)
            .finish()
    }
}

impl Image {
    /// New image rooted at `debian/bookworm`-style base, x86-64, default
    /// profile, in-process backend. `reproducible` defaults on, which
    /// auto-registers the `IMAGE_VERSION` strip hook.
    pub fn new(base: impl Into<String>) -> Self {
        let mut image = Self {
            base: base.into(),
            arch: Arch::X86_64,
            build_dir: PathBuf::from("build"),
            policy: Policy::default(),
            reproducible: true,
            with_network: true,
            emit_mode: EmitMode::PerDirectory,
            environment: BTreeMap::new(),
            environment_passthrough: Vec::new(),
            kernel: None,
            generate_version_script: true,
            backend: Box::new(InProcessBackend),
            state: RecipeState::initialize("", Arch::X86_64, "default"),
            profile_stack: Vec::new(),
            used_modules: Vec::new(),
            last_bake: None,
            last_compile: None,
        };
        image.state.base = image.base.clone();
        let _ = image.strip_image_version(true);
        image
    }

    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = arch;
        self.state.arch = arch;
        self
    }

    pub fn with_build_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.build_dir = dir.into();
        self
    }

    pub fn with_policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_backend(mut self, backend: Box<dyn BuildBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_emit_mode(mut self, mode: EmitMode) -> Self {
        self.emit_mode = mode;
        self
    }

    pub fn with_kernel(mut self, kernel: Kernel) -> Self {
        self.kernel = Some(kernel);
        self
    }

    pub fn without_reproducibility(mut self) -> Self {
        self.reproducible = false;
        let _ = self.strip_image_version(false);
        self
    }

    /// Read-only view of the recipe state, mainly for tests and tooling.
    pub fn state(&self) -> &RecipeState {
        &self.state
    }

    // ── Profile scoping ─────────────────────────────────────────────

    /// Currently selected profiles (the default profile when no scope is
    /// active).
    pub fn active_profiles(&self) -> Vec<String> {
        match self.profile_stack.last() {
            Some(selected) => selected.clone(),
            None => vec![self.state.default_profile.clone()],
        }
    }

    /// Run `f` with a single profile selected.
    pub fn with_profile<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.with_profiles(&[name], f)
    }

    /// Run `f` with several profiles selected; declarative calls inside
    /// broadcast to every selected profile. The selection stack is LIFO
    /// and restored on every exit path.
    pub fn with_profiles<F>(&mut self, names: &[&str], f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if names.is_empty() {
            return Err(Error::validation("At least one profile name is required.")
                .with_operation("profiles"));
        }
        let mut selected: Vec<String> = Vec::new();
        for name in names {
            if name.is_empty() {
                return Err(Error::validation("Profile names must be non-empty.")
                    .with_operation("profiles"));
            }
            if !selected.iter().any(|existing| existing == name) {
                selected.push(name.to_string());
            }
        }
        for name in &selected {
            self.state.ensure_profile(name);
        }
        self.profile_stack.push(selected);
        let result = f(self);
        self.profile_stack.pop();
        result
    }

    /// Run `f` with every declared profile selected, sorted by name.
    pub fn with_all_profiles<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let names: Vec<String> = self.state.profiles.keys().cloned().collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        self.with_profiles(&refs, f)
    }

    fn for_active_profiles<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut crate::models::ProfileState),
    {
        for name in self.active_profiles() {
            f(self.state.ensure_profile(&name));
        }
    }

    // ── Declarative methods ─────────────────────────────────────────

    /// Declare runtime packages, deduped and sorted at emit time.
    pub fn install(&mut self, packages: &[&str]) -> Result<&mut Self> {
        if packages.is_empty() {
            return Err(Error::validation("install() requires at least one package.")
                .with_operation("install"));
        }
        if packages.iter().any(|p| p.is_empty()) {
            return Err(Error::validation("Package names must be non-empty.")
                .with_operation("install"));
        }
        self.for_active_profiles(|profile| {
            profile
                .packages
                .extend(packages.iter().map(|p| p.to_string()));
        });
        Ok(self)
    }

    /// Declare build-time packages (removed after the build).
    pub fn build_install(&mut self, packages: &[&str]) -> Result<&mut Self> {
        if packages.is_empty() {
            return Err(Error::validation(
                "build_install() requires at least one package.",
            )
            .with_operation("build_install"));
        }
        if packages.iter().any(|p| p.is_empty()) {
            return Err(Error::validation("Package names must be non-empty.")
                .with_operation("build_install"));
        }
        self.for_active_profiles(|profile| {
            profile
                .build_packages
                .extend(packages.iter().map(|p| p.to_string()));
        });
        Ok(self)
    }

    /// Add an extra package repository. The keyring must be a local path
    /// or the digest of a resolved fetch.
    pub fn repository(&mut self, repository: RepositorySpec) -> Result<&mut Self> {
        if repository.url.is_empty() {
            return Err(Error::validation("repository() requires a non-empty URL.")
                .with_operation("repository"));
        }
        self.for_active_profiles(|profile| {
            profile.repositories.push(repository.clone());
        });
        Ok(self)
    }

    /// Place an inline file into the image.
    pub fn file(&mut self, dest: &str, content: &str) -> Result<&mut Self> {
        self.file_entry(FileEntry::new(dest, content))
    }

    /// Place a file with full control over mode/ownership/overwrite.
    pub fn file_entry(&mut self, entry: FileEntry) -> Result<&mut Self> {
        if entry.path.is_empty() {
            return Err(Error::validation("file() requires a destination path.")
                .with_operation("file"));
        }
        self.for_active_profiles(|profile| {
            profile.files.push(entry.clone());
        });
        Ok(self)
    }

    /// Place a file whose content is read from a host path.
    pub fn file_from(&mut self, dest: &str, src: &Path) -> Result<&mut Self> {
        let content = fs::read_to_string(src).map_err(|e| {
            Error::validation(format!("file() source {} is unreadable: {e}", src.display()))
                .with_operation("file")
        })?;
        self.file(dest, &content)
    }

    /// Place a file in the image before the package manager runs
    /// (`mkosi.skeleton/`).
    pub fn skeleton(&mut self, dest: &str, content: &str) -> Result<&mut Self> {
        if dest.is_empty() {
            return Err(Error::validation("skeleton() requires a destination path.")
                .with_operation("skeleton"));
        }
        let entry = FileEntry::new(dest, content);
        self.for_active_profiles(|profile| {
            profile.skeleton_files.push(entry.clone());
        });
        Ok(self)
    }

    /// Render a template into the image. Rendering is deterministic:
    /// key-sorted variables, LF endings, no autoescape; a placeholder
    /// without a variable fails validation.
    pub fn template(
        &mut self,
        dest: &str,
        template: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<&mut Self> {
        if dest.is_empty() {
            return Err(Error::validation("template() requires a destination path.")
                .with_operation("template"));
        }
        let rendered = render_template(template, vars).map_err(|e| {
            e.with_operation("template")
        })?;
        let entry = TemplateEntry {
            path: dest.to_string(),
            template: template.to_string(),
            variables: vars.clone(),
            rendered,
            mode: "0644".to_string(),
        };
        self.for_active_profiles(|profile| {
            profile.templates.push(entry.clone());
        });
        Ok(self)
    }

    /// Declare a user, unique per profile.
    pub fn user(&mut self, user: UserSpec) -> Result<&mut Self> {
        if user.name.is_empty() {
            return Err(Error::validation("user() requires a non-empty user name.")
                .with_operation("user"));
        }
        for name in self.active_profiles() {
            let profile = self.state.ensure_profile(&name);
            if profile.users.iter().any(|u| u.name == user.name) {
                return Err(Error::validation(format!(
                    "Duplicate user name `{}`.",
                    user.name
                ))
                .with_hint("User names must be unique within a profile.")
                .with_profile(name)
                .with_operation("user"));
            }
            profile.users.push(user.clone());
        }
        Ok(self)
    }

    /// Declare a service, unique per profile.
    pub fn service(&mut self, service: ServiceSpec) -> Result<&mut Self> {
        if service.name.is_empty() {
            return Err(Error::validation("service() requires a non-empty service name.")
                .with_operation("service"));
        }
        for name in self.active_profiles() {
            let profile = self.state.ensure_profile(&name);
            if profile.services.iter().any(|s| s.name == service.name) {
                return Err(Error::validation(format!(
                    "Duplicate service name `{}`.",
                    service.name
                ))
                .with_hint("Service names must be unique within a profile.")
                .with_profile(name)
                .with_operation("service"));
            }
            profile.services.push(service.clone());
        }
        Ok(self)
    }

    /// Declare an expected secret with schema and delivery targets.
    pub fn secret(&mut self, secret: SecretSpec) -> Result<&mut Self> {
        if secret.name.is_empty() {
            return Err(Error::validation("secret() requires a non-empty secret name.")
                .with_operation("secret"));
        }
        if secret.targets.is_empty() {
            return Err(Error::validation(
                "secret() requires at least one delivery target.",
            )
            .with_operation("secret"));
        }
        self.for_active_profiles(|profile| {
            profile.secrets.push(secret.clone());
        });
        Ok(self)
    }

    /// Configure how secrets reach the guest.
    pub fn secrets_delivery(&mut self, config: SecretsDeliveryConfig) -> Result<&mut Self> {
        self.for_active_profiles(|profile| {
            profile.secrets_delivery = Some(config.clone());
        });
        Ok(self)
    }

    /// Declare builds. External sources are registered as fetches for
    /// lock resolution.
    pub fn build(&mut self, specs: Vec<BuildSpec>) -> Result<&mut Self> {
        for spec in &specs {
            if spec.name.is_empty() {
                return Err(Error::validation("build() requires a non-empty build name.")
                    .with_operation("build"));
            }
        }
        self.for_active_profiles(|profile| {
            for spec in &specs {
                if let BuildSource::Fetch { fetch } = &spec.src {
                    if !profile.fetches.iter().any(|f| f.url == fetch.url) {
                        profile.fetches.push(fetch.clone());
                    }
                }
                // Identical re-declaration is a no-op, so modules can
                // share a build without coordinating.
                if !profile.builds.contains(spec) {
                    profile.builds.push(spec.clone());
                }
            }
        });
        Ok(self)
    }

    /// Register an external input directly (e.g. a repository keyring).
    pub fn fetch(&mut self, fetch: Fetch) -> Result<&mut Self> {
        if fetch.url.is_empty() {
            return Err(Error::validation("fetch() requires a non-empty URL.")
                .with_operation("fetch"));
        }
        self.for_active_profiles(|profile| {
            if !profile.fetches.iter().any(|f| f.url == fetch.url) {
                profile.fetches.push(fetch.clone());
            }
        });
        Ok(self)
    }

    /// Append a command to a phase. `boot` is runtime-only; use
    /// [`Image::add_init_script`] instead.
    pub fn hook(&mut self, phase: Phase, command: CommandSpec) -> Result<&mut Self> {
        self.hook_after(phase, command, None)
    }

    /// Append a command to a phase, asserting it depends only on an
    /// earlier phase.
    pub fn hook_after(
        &mut self,
        phase: Phase,
        command: CommandSpec,
        after_phase: Option<Phase>,
    ) -> Result<&mut Self> {
        if command.argv.is_empty() {
            return Err(Error::validation("hook() requires a command argv.")
                .with_operation("hook"));
        }
        if phase == Phase::Boot {
            return Err(Error::validation("The boot phase is runtime-only.")
                .with_hint("Register boot steps with add_init_script().")
                .with_phase("boot")
                .with_operation("hook"));
        }
        if let Some(after) = after_phase {
            if after >= phase {
                return Err(Error::phase_order("Invalid phase hook dependency order.")
                    .with_hint("after_phase must be earlier than the hook phase.")
                    .with_phase(phase.as_str())
                    .with_operation("hook"));
            }
        }
        self.for_active_profiles(|profile| {
            profile.phases.entry(phase).or_default().push(command.clone());
        });
        Ok(self)
    }

    /// Append an argv command to the postinst phase.
    pub fn run(&mut self, argv: &[&str]) -> Result<&mut Self> {
        self.hook(Phase::Postinst, CommandSpec::new(argv.iter().copied()))
    }

    /// Append an argv command to an arbitrary phase.
    pub fn run_in(&mut self, phase: Phase, argv: &[&str]) -> Result<&mut Self> {
        self.hook(phase, CommandSpec::new(argv.iter().copied()))
    }

    /// Sync-phase command (runs before anything is built).
    pub fn sync(&mut self, argv: &[&str]) -> Result<&mut Self> {
        self.run_in(Phase::Sync, argv)
    }

    /// Prepare-phase command (after base packages, before the build).
    pub fn prepare(&mut self, argv: &[&str]) -> Result<&mut Self> {
        self.run_in(Phase::Prepare, argv)
    }

    /// Postinst-phase command (inside the image via mkosi-chroot tokens).
    pub fn postinst(&mut self, argv: &[&str]) -> Result<&mut Self> {
        self.run_in(Phase::Postinst, argv)
    }

    /// Finalize-phase command (on the host, `$BUILDROOT` available).
    pub fn finalize(&mut self, argv: &[&str]) -> Result<&mut Self> {
        self.run_in(Phase::Finalize, argv)
    }

    /// Postoutput-phase command (after the disk image is written).
    pub fn postoutput(&mut self, argv: &[&str]) -> Result<&mut Self> {
        self.run_in(Phase::Postoutput, argv)
    }

    /// Clean-phase command (runs on `mkosi clean`).
    pub fn clean(&mut self, argv: &[&str]) -> Result<&mut Self> {
        self.run_in(Phase::Clean, argv)
    }

    /// Append a shell script line to a phase (opt-in shell form).
    pub fn sh(&mut self, phase: Phase, script: &str) -> Result<&mut Self> {
        self.hook(phase, CommandSpec::new(["bash", "-c", script]))
    }

    /// Contribute a boot-time init step, ordered by `(priority, id)`.
    pub fn add_init_script(
        &mut self,
        id: &str,
        priority: i32,
        exec: &str,
    ) -> Result<&mut Self> {
        self.add_init_entry(InitScriptEntry {
            id: id.to_string(),
            priority,
            exec: exec.to_string(),
            preconditions: Vec::new(),
        })
    }

    /// Contribute a boot-time init step with preconditions.
    pub fn add_init_entry(&mut self, entry: InitScriptEntry) -> Result<&mut Self> {
        if entry.id.is_empty() || entry.exec.is_empty() {
            return Err(Error::validation(
                "add_init_script() requires a non-empty id and executable.",
            )
            .with_operation("add_init_script"));
        }
        self.for_active_profiles(|profile| {
            if !profile
                .init_scripts
                .iter()
                .any(|existing| existing.id == entry.id && existing.exec == entry.exec)
            {
                profile.init_scripts.push(entry.clone());
            }
        });
        Ok(self)
    }

    /// Set (override) the output targets of the active profiles.
    pub fn output_targets(&mut self, targets: &[OutputTarget]) -> Result<&mut Self> {
        if targets.is_empty() {
            return Err(Error::validation(
                "output_targets() requires at least one target.",
            )
            .with_operation("output_targets"));
        }
        let mut deduped: Vec<OutputTarget> = Vec::new();
        for target in targets {
            if !deduped.contains(target) {
                deduped.push(*target);
            }
        }
        self.for_active_profiles(|profile| {
            profile.output_targets = deduped.clone();
        });
        Ok(self)
    }

    /// Configure image slimming.
    pub fn debloat(&mut self, config: DebloatConfig) -> Result<&mut Self> {
        self.for_active_profiles(|profile| {
            profile.debloat = config.clone();
        });
        Ok(self)
    }

    /// Planned debloat effect without writing anything.
    pub fn explain_debloat(&mut self, profile: Option<&str>) -> Result<DebloatPlan> {
        let name = self.resolve_operation_profile(profile)?;
        let profile_state = self.state.ensure_profile(&name);
        Ok(compiler::debloat::explain(&profile_state.debloat))
    }

    /// Strip `IMAGE_VERSION` from os-release for reproducible
    /// attestation. Auto-registered while `reproducible` is set.
    pub fn strip_image_version(&mut self, enabled: bool) -> Result<&mut Self> {
        const STRIP_SCRIPT: &str = r#"sed -i '/^IMAGE_VERSION=/d' "$BUILDROOT/usr/lib/os-release""#;
        if enabled {
            let command = CommandSpec::new(["bash", "-c", STRIP_SCRIPT]);
            self.for_active_profiles(|profile| {
                let commands = profile.phases.entry(Phase::Finalize).or_default();
                if !commands.iter().any(|c| c.argv.iter().any(|a| a.contains("IMAGE_VERSION"))) {
                    commands.push(command.clone());
                }
            });
        } else {
            self.for_active_profiles(|profile| {
                if let Some(commands) = profile.phases.get_mut(&Phase::Finalize) {
                    commands.retain(|c| !c.argv.iter().any(|a| a.contains("IMAGE_VERSION")));
                }
            });
        }
        Ok(self)
    }

    /// Apply modules. Required host commands are prechecked against
    /// `PATH` before any module mutates the recipe.
    pub fn use_modules(&mut self, modules: &[&dyn Module]) -> Result<&mut Self> {
        for module in modules {
            for command in module.required_host_commands() {
                if !host_command_exists(command) {
                    return Err(Error::validation(format!(
                        "Module `{}` requires host command `{command}`, which is not in PATH.",
                        module.name()
                    ))
                    .with_hint("Install the required tool before applying the module.")
                    .with_operation("use_modules"));
                }
            }
        }
        for module in modules {
            debug!(module = module.name(), "applying module");
            module.apply(self)?;
            self.used_modules.push(LockedModule {
                name: module.name().to_string(),
                version: module.version().to_string(),
                source: "builtin".to_string(),
                url: String::new(),
                integrity: String::new(),
            });
        }
        Ok(self)
    }

    // ── Explicit output operations ──────────────────────────────────

    /// Default lockfile location.
    pub fn lock_path(&self) -> PathBuf {
        self.build_dir.join(LOCKFILE_NAME)
    }

    /// Resolve every external input and write the lockfile atomically.
    pub fn lock(&mut self) -> Result<PathBuf> {
        let path = self.lock_path();
        self.lock_at(&path)
    }

    /// Resolve and write the lockfile at an explicit path.
    pub fn lock_at(&mut self, path: &Path) -> Result<PathBuf> {
        let profile_names = self.sorted_active_profiles();
        // Validation runs on the snapshot even though the digest comes
        // from raw state.
        ImageIr::snapshot(&self.state, &profile_names)?;
        let digest = recipe_digest(&self.state_subset(&profile_names))?;

        let mut lock = Lockfile::new(digest);
        lock.modules = self.used_modules.clone();

        // In locked network mode, resolution may only re-fetch what a
        // previous lockfile already pinned.
        let previously_locked = if path.exists() {
            Some(Lockfile::read_file(path)?.locked_urls())
        } else {
            None
        };

        // Lock resolution is discovery: it establishes the integrity
        // values later fetches verify against, so the integrity
        // requirement cannot apply to the resolution itself. Network and
        // mutable-ref policy still do.
        let resolve_policy = Policy {
            require_integrity: false,
            ..self.policy.clone()
        };

        let cache_dir = self.build_dir.join(".cache").join("fetch");
        let mut seen: Vec<String> = Vec::new();
        for profile_name in &profile_names {
            let fetches = self.state.profiles[profile_name].fetches.clone();
            for fetch in fetches {
                if seen.contains(&fetch.url) {
                    continue;
                }
                seen.push(fetch.url.clone());
                match fetch.kind {
                    FetchKind::Http => {
                        let integrity = fetch.integrity.clone().unwrap_or_default();
                        let resolved = fetch_http(
                            &fetch.url,
                            &integrity,
                            &cache_dir,
                            &resolve_policy,
                            previously_locked.as_ref(),
                        )?;
                        lock.fetches.push(LockedFetch {
                            url: fetch.url.clone(),
                            integrity: resolved.sha256.clone(),
                            final_url: resolved.final_url.clone(),
                        });
                        self.record_resolution(&fetch.url, |f| {
                            f.integrity = Some(resolved.sha256.clone());
                            f.final_url = Some(resolved.final_url.clone());
                        });
                    }
                    FetchKind::Git => {
                        let reference = fetch.requested_ref.clone().unwrap_or_default();
                        let resolved = fetch_git(
                            &fetch.url,
                            &reference,
                            fetch.resolved_tree_hash.as_deref(),
                            &cache_dir,
                            &resolve_policy,
                            previously_locked.as_ref(),
                        )?;
                        lock.gits.push(LockedGit {
                            url: fetch.url.clone(),
                            requested_ref: reference,
                            resolved_commit: resolved.commit.clone(),
                            tree_hash: resolved.tree_hash.clone(),
                        });
                        self.record_resolution(&fetch.url, |f| {
                            f.resolved_commit = Some(resolved.commit.clone());
                            f.resolved_tree_hash = Some(resolved.tree_hash.clone());
                        });
                    }
                }
            }
        }

        // Emission content now reflects resolved refs.
        self.last_compile = None;
        lock.write_file(path)
    }

    /// Emit the mkosi project tree for the active profiles. Re-emission
    /// is skipped while the recipe digest and destination are unchanged.
    pub fn compile(&mut self, destination: &Path) -> Result<PathBuf> {
        Ok(self.compile_emission(destination)?.root)
    }

    fn compile_emission(&mut self, destination: &Path) -> Result<MkosiEmission> {
        let profile_names = self.sorted_active_profiles();
        let digest = recipe_digest(&self.state_subset(&profile_names))?;
        if let Some((ref cached_digest, ref cached_path, ref emission)) = self.last_compile {
            if cached_digest == &digest && cached_path == destination && destination.exists() {
                debug!(path = %destination.display(), "compile unchanged; skipping");
                return Ok(emission.clone());
            }
        }
        let emission = self.emit(destination, &profile_names)?;
        self.last_compile = Some((digest, destination.to_path_buf(), emission.clone()));
        Ok(emission)
    }

    fn emit(&self, destination: &Path, profile_names: &[String]) -> Result<MkosiEmission> {
        let ir = ImageIr::snapshot(&self.state, profile_names)?;
        compiler::emit_tree(&ir, destination, &self.emit_config())
    }

    fn emit_config(&self) -> EmitConfig {
        EmitConfig {
            reproducible: self.reproducible,
            with_network: self.with_network,
            emit_mode: self.emit_mode,
            environment: self.environment.clone(),
            environment_passthrough: self.environment_passthrough.clone(),
            kernel: self.kernel.clone(),
            generate_version_script: self.generate_version_script,
            seed: None,
        }
    }

    /// Bake the active profiles: policy check, optional frozen-lock
    /// check, emission, backend execution, report generation.
    pub fn bake(&mut self, frozen: bool) -> Result<BakeResult> {
        ensure_bake_allowed(&self.policy, frozen)?;
        let profile_names = self.sorted_active_profiles();
        let digest = recipe_digest(&self.state_subset(&profile_names))?;

        if frozen {
            let lock = Lockfile::read_file(&self.lock_path())?;
            let fetches: Vec<Fetch> = profile_names
                .iter()
                .flat_map(|name| self.state.profiles[name].fetches.clone())
                .collect();
            lock.assert_fresh(&digest, &fetches)?;
            self.apply_lock_resolutions(&lock);
        }

        fs::create_dir_all(&self.build_dir)?;
        let emit_dir = self.build_dir.join("mkosi");
        let emission = self.compile_emission(&emit_dir)?;
        let lock_digest = self.lock_file_digest(&digest)?;

        let mut result = BakeResult::default();
        for profile_name in &profile_names {
            info!(profile = %profile_name, backend = self.backend.name(), "bake starting");
            let profile = &self.state.profiles[profile_name];
            let request = BakeRequest {
                profile: profile_name.clone(),
                build_dir: self.build_dir.clone(),
                emit_dir: emit_dir.clone(),
                cache_dir: self.build_dir.join(".cache"),
                output_targets: profile.output_targets.clone(),
                frozen,
                env: self.environment.clone(),
            };

            self.backend.prepare(&request)?;
            let executed = self.backend.execute(&request);
            self.backend.cleanup(&request)?;
            let backend_result = executed?;

            let mut profile_result = backend_result
                .profiles
                .get(profile_name.as_str())
                .cloned()
                .unwrap_or_else(|| ProfileBuildResult::new(profile_name));

            // Fill in artifacts the backend produced under conventional
            // names but did not report.
            for target in &profile.output_targets {
                if !profile_result.artifacts.contains_key(target) {
                    let candidate = self
                        .build_dir
                        .join(profile_name)
                        .join(target.artifact_filename());
                    if candidate.exists() {
                        profile_result.artifacts.insert(
                            *target,
                            crate::models::ArtifactRef {
                                target: *target,
                                path: candidate,
                                digest: None,
                            },
                        );
                    }
                }
            }

            let report_path = self.write_report(
                profile_name,
                &mut profile_result,
                &lock_digest,
                &emission,
            )?;
            profile_result.report_path = Some(report_path);
            result.profiles.insert(profile_name.clone(), profile_result);
            info!(profile = %profile_name, "bake complete");
        }

        self.last_bake = Some(result.clone());
        Ok(result)
    }

    /// Derive expected measurements for a baked profile.
    pub fn measure(
        &mut self,
        backend: MeasureBackend,
        profile: Option<&str>,
    ) -> Result<Measurements> {
        let name = self.resolve_operation_profile(profile)?;
        let Some(ref bake) = self.last_bake else {
            return Err(Error::measurement(
                "No baked artifacts are available for measurement.",
            )
            .with_hint("Run bake() before measure().")
            .with_profile(name)
            .with_operation("measure"));
        };
        let Some(profile_result) = bake.profiles.get(&name) else {
            return Err(Error::measurement(
                "Profile has no baked artifacts for measurement.",
            )
            .with_hint("Bake the selected profile before measure().")
            .with_profile(name)
            .with_operation("measure"));
        };

        let mut digests = BTreeMap::new();
        let mut paths = Vec::new();
        for (target, artifact) in &profile_result.artifacts {
            let digest = match &artifact.digest {
                Some(digest) => digest.clone(),
                None => hash_file(&artifact.path)?,
            };
            digests.insert(target.to_string(), digest);
            paths.push(artifact.path.clone());
        }
        Ok(derive_measurements(backend, &name, &digests, &paths))
    }

    /// Deploy a baked artifact. Fails when the target was not baked or is
    /// not among the profile's output targets.
    pub fn deploy(
        &mut self,
        target: OutputTarget,
        profile: Option<&str>,
        parameters: BTreeMap<String, String>,
    ) -> Result<crate::models::DeployResult> {
        let name = self.resolve_operation_profile(profile)?;
        let declared = self
            .state
            .profiles
            .get(&name)
            .map(|p| p.output_targets.contains(&target))
            .unwrap_or(false);
        if !declared {
            return Err(Error::deployment(format!(
                "Deploy target `{target}` is not among the profile's output targets."
            ))
            .with_hint("Add the target via output_targets(...) and rerun bake().")
            .with_profile(name)
            .with_operation("deploy"));
        }
        let artifact = self
            .last_bake
            .as_ref()
            .and_then(|bake| bake.artifact_for(&name, target))
            .cloned()
            .ok_or_else(|| {
                Error::deployment("Requested deploy target artifact was not baked.")
                    .with_hint("Run bake() before deploy().")
                    .with_profile(name.clone())
                    .with_operation("deploy")
            })?;

        let request = crate::models::DeployRequest {
            profile: name,
            target,
            artifact_path: artifact.path,
            parameters,
        };
        crate::deploy::adapter_for(target).deploy(&request)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn sorted_active_profiles(&self) -> Vec<String> {
        let mut names = self.active_profiles();
        names.sort();
        names
    }

    /// Recipe state restricted to the selected profiles, the unit the
    /// recipe digest is computed over.
    fn state_subset(&self, profile_names: &[String]) -> RecipeState {
        RecipeState {
            base: self.state.base.clone(),
            arch: self.state.arch,
            default_profile: self.state.default_profile.clone(),
            profiles: self
                .state
                .profiles
                .iter()
                .filter(|(name, _)| profile_names.contains(name))
                .map(|(name, profile)| (name.clone(), profile.clone()))
                .collect(),
        }
    }

    /// Pin resolution results from a lockfile back into the in-memory
    /// fetches so frozen bakes emit immutable refs, then drop the compile
    /// memo (resolution changes the emitted build fragments without
    /// changing the recipe digest).
    fn apply_lock_resolutions(&mut self, lock: &Lockfile) {
        for locked in lock.gits.clone() {
            self.record_resolution(&locked.url, |fetch| {
                fetch.resolved_commit = Some(locked.resolved_commit.clone());
                fetch.resolved_tree_hash = Some(locked.tree_hash.clone());
            });
        }
        for locked in lock.fetches.clone() {
            self.record_resolution(&locked.url, |fetch| {
                if fetch.integrity.is_none() {
                    fetch.integrity = Some(locked.integrity.clone());
                }
                fetch.final_url = Some(locked.final_url.clone());
            });
        }
        self.last_compile = None;
    }

    fn record_resolution<F>(&mut self, url: &str, mut apply: F)
    where
        F: FnMut(&mut Fetch),
    {
        for profile in self.state.profiles.values_mut() {
            for fetch in &mut profile.fetches {
                if fetch.url == url {
                    apply(fetch);
                }
            }
            for build in &mut profile.builds {
                if let BuildSource::Fetch { fetch } = &mut build.src {
                    if fetch.url == url {
                        apply(fetch);
                    }
                }
            }
        }
    }

    fn resolve_operation_profile(&self, profile: Option<&str>) -> Result<String> {
        if let Some(name) = profile {
            return Ok(name.to_string());
        }
        let active = self.active_profiles();
        if active.len() == 1 {
            return Ok(active[0].clone());
        }
        Err(Error::validation(
            "Operation requires an explicit profile when multiple profiles are active.",
        )
        .with_hint("Pass the profile name to the operation.")
        .with_operation("resolve_profile"))
    }

    /// Digest of the lockfile bytes when one exists, else the recipe
    /// digest; pinned into bake reports.
    fn lock_file_digest(&self, fallback: &str) -> Result<String> {
        let path = self.lock_path();
        if path.exists() {
            return hash_file(&path);
        }
        Ok(fallback.to_string())
    }

    fn write_report(
        &mut self,
        profile_name: &str,
        profile_result: &mut ProfileBuildResult,
        lock_digest: &str,
        emission: &MkosiEmission,
    ) -> Result<PathBuf> {
        let profile_dir = self.build_dir.join(profile_name);
        fs::create_dir_all(&profile_dir)?;

        let mut artifact_digests = BTreeMap::new();
        let mut artifact_paths = BTreeMap::new();
        for (target, artifact) in &mut profile_result.artifacts {
            if artifact.digest.is_none() && artifact.path.exists() {
                artifact.digest = Some(hash_file(&artifact.path)?);
            }
            if let Some(ref digest) = artifact.digest {
                artifact_digests.insert(target.to_string(), digest.clone());
            }
            artifact_paths.insert(target.to_string(), artifact.path.display().to_string());
        }

        let mut script_checksums = BTreeMap::new();
        if let Some(scripts) = emission.script_paths.get(profile_name) {
            for (phase, path) in scripts {
                script_checksums.insert(
                    format!("{phase}:{}", path.file_name().unwrap_or_default().to_string_lossy()),
                    hash_file(path)?,
                );
            }
        }

        let debloat_plan = self.explain_debloat(Some(profile_name))?;
        let payload = json!({
            "profile": profile_name,
            "backend": self.backend.name(),
            "lock_digest": lock_digest,
            "debloat": debloat_plan,
            "artifacts": artifact_paths,
            "artifact_digests": artifact_digests,
            "emitted_scripts": script_checksums,
        });
        let report_path = profile_dir.join("report.json");
        let encoded = serde_json::to_string_pretty(&payload).map_err(|e| {
            Error::backend(format!("Failed to encode bake report: {e}")).with_operation("bake")
        })? + "\n";
        fs::write(&report_path, encoded)?;
        Ok(report_path)
    }
}

fn host_command_exists(binary: &str) -> bool {
    let Some(path_var) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path_var).any(|dir| dir.join(binary).is_file())
}
