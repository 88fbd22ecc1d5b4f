// src/compiler/emit.rs

//! Tree rendering: conf files, phase scripts, extra/skeleton payloads
//!
//! Rendering is pure with respect to the IR and config (the only reads
//! are declared kernel config files); the emitter runs it twice and
//! compares to enforce determinism.

use crate::builders;
use crate::compiler::{debloat, scripts, units, EmitConfig, EmitMode, RenderedFile, RenderedTree};
use crate::error::{Error, Result};
use crate::init;
use crate::ir::ImageIr;
use crate::models::{FileEntry, OutputTarget, Phase, ProfileState, ServiceSpec, PHASE_ORDER};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub(crate) fn render_tree(ir: &ImageIr, config: &EmitConfig, seed: &str) -> Result<RenderedTree> {
    let mut tree: RenderedTree = BTreeMap::new();

    if config.generate_version_script {
        insert(
            &mut tree,
            "mkosi.version",
            scripts::MKOSI_VERSION_SCRIPT.to_string(),
            0o755,
        );
    }

    let kernel_config = read_kernel_config(config)?;

    if config.emit_mode == EmitMode::NativeProfiles {
        insert(
            &mut tree,
            "mkosi.conf",
            render_root_conf(ir, config, seed),
            0o644,
        );
    }

    for (name, profile) in &ir.profiles {
        let prefix = match config.emit_mode {
            EmitMode::PerDirectory => PathBuf::from(name),
            EmitMode::NativeProfiles => PathBuf::from("mkosi.profiles").join(name),
        };
        render_profile(&mut tree, ir, profile, config, seed, &prefix, kernel_config.as_deref())?;
    }
    Ok(tree)
}

fn read_kernel_config(config: &EmitConfig) -> Result<Option<String>> {
    let Some(ref kernel) = config.kernel else {
        return Ok(None);
    };
    let Some(ref path) = kernel.config_file else {
        return Ok(None);
    };
    let content = fs::read_to_string(path).map_err(|e| {
        Error::validation(format!(
            "Kernel config file {} is unreadable: {e}",
            path.display()
        ))
        .with_operation("emit")
    })?;
    Ok(Some(content))
}

fn insert(tree: &mut RenderedTree, path: impl Into<PathBuf>, content: String, mode: u32) {
    tree.insert(path.into(), RenderedFile { content, mode });
}

fn render_profile(
    tree: &mut RenderedTree,
    ir: &ImageIr,
    profile: &ProfileState,
    config: &EmitConfig,
    seed: &str,
    prefix: &Path,
    kernel_config: Option<&str>,
) -> Result<()> {
    let init_plan = init::plan_for_profile(profile);

    // Service units carry the runtime-init ordering when init exists.
    let mut services: Vec<ServiceSpec> = profile.services.clone();
    if !init_plan.is_empty() {
        init::inject_service_ordering(&mut services);
    }

    // Phase scripts
    let mut emitted_scripts: BTreeMap<Phase, String> = BTreeMap::new();
    for phase in PHASE_ORDER {
        if !phase.emits_script() {
            continue;
        }
        let fragments = phase_fragments(profile, phase, config, ir, &services, &init_plan)?;
        if fragments.is_empty() {
            continue;
        }
        let name = phase.script_name();
        insert(
            tree,
            prefix.join("scripts").join(&name),
            scripts::render_phase_script(&fragments),
            0o755,
        );
        emitted_scripts.insert(phase, name);
    }

    // Cloud conversion helpers for the selected targets
    for target in &profile.output_targets {
        insert(
            tree,
            prefix.join("scripts").join(scripts::postoutput_script_name(*target)),
            scripts::postoutput_script_body(*target).to_string(),
            0o755,
        );
    }

    // mkosi.conf
    let conf = render_profile_conf(ir, profile, config, seed, &emitted_scripts);
    insert(tree, prefix.join("mkosi.conf"), conf, 0o644);

    // mkosi.extra: declared files, rendered templates, unit files
    for entry in &profile.files {
        insert_extra(tree, prefix, entry);
    }
    for template in &profile.templates {
        let entry = FileEntry::new(&template.path, &template.rendered).with_mode(&template.mode);
        insert_extra(tree, prefix, &entry);
    }
    for service in &services {
        let unit_path = format!("{}/{}", units::UNIT_DIR, service.unit_name());
        let entry = FileEntry::new(unit_path, units::render_service_unit(service));
        insert_extra(tree, prefix, &entry);
    }

    // mkosi.skeleton: declared skeleton files, repositories, init plan
    for entry in &profile.skeleton_files {
        insert_skeleton(tree, prefix, entry);
    }
    for repository in &profile.repositories {
        let entry = FileEntry::new(
            format!("/etc/apt/sources.list.d/{}.sources", repository.name),
            render_repository(repository),
        );
        insert_skeleton(tree, prefix, &entry);
    }
    for entry in &init_plan.skeleton_files {
        insert_skeleton(tree, prefix, entry);
    }

    // Pinned kernel config copy
    if let Some(content) = kernel_config {
        insert(
            tree,
            prefix.join("kernel").join("kernel.config"),
            content.to_string(),
            0o644,
        );
    }
    Ok(())
}

fn insert_extra(tree: &mut RenderedTree, prefix: &Path, entry: &FileEntry) {
    insert_payload(tree, prefix, "mkosi.extra", entry);
}

fn insert_skeleton(tree: &mut RenderedTree, prefix: &Path, entry: &FileEntry) {
    insert_payload(tree, prefix, "mkosi.skeleton", entry);
}

fn insert_payload(tree: &mut RenderedTree, prefix: &Path, root: &str, entry: &FileEntry) {
    let mode = u32::from_str_radix(&entry.mode, 8).unwrap_or(0o644);
    let relative = entry.path.trim_start_matches('/');
    insert(
        tree,
        prefix.join(root).join(relative),
        entry.content.clone(),
        mode,
    );
}

fn render_repository(repository: &crate::models::RepositorySpec) -> String {
    let mut lines = vec![
        "Types: deb".to_string(),
        format!("URIs: {}", repository.url),
        format!(
            "Suites: {}",
            repository.suite.as_deref().unwrap_or("$RELEASE")
        ),
        format!(
            "Components: {}",
            if repository.components.is_empty() {
                "main".to_string()
            } else {
                repository.components.join(" ")
            }
        ),
        "Enabled: yes".to_string(),
    ];
    if let Some(ref keyring) = repository.keyring {
        lines.push(format!("Signed-By: {keyring}"));
    }
    let mut rendered = lines.join("\n");
    rendered.push('\n');
    rendered
}

/// Split `debian/bookworm` into distribution and release.
fn split_base(base: &str) -> (&str, Option<&str>) {
    match base.split_once('/') {
        Some((distribution, release)) => (distribution, Some(release)),
        None => (base, None),
    }
}

fn output_format(profile: &ProfileState) -> &'static str {
    if profile.output_targets.contains(&OutputTarget::Qemu) {
        "uki"
    } else {
        "disk"
    }
}

fn render_profile_conf(
    ir: &ImageIr,
    profile: &ProfileState,
    config: &EmitConfig,
    seed: &str,
    emitted_scripts: &BTreeMap<Phase, String>,
) -> String {
    let mut lines: Vec<String> = Vec::new();

    if config.emit_mode == EmitMode::PerDirectory {
        lines.extend(distribution_section(ir));
        lines.push(String::new());
    }

    lines.push("[Output]".to_string());
    lines.push(format!("Format={}", output_format(profile)));
    lines.push(format!("ImageId={}", profile.name));
    if config.emit_mode == EmitMode::PerDirectory {
        lines.push("ManifestFormat=json".to_string());
        lines.push("CompressOutput=zstd".to_string());
        lines.push(format!("Seed={seed}"));
    }

    lines.push(String::new());
    lines.push("[Content]".to_string());
    lines.push("CleanPackageMetadata=true".to_string());
    if !profile.packages.is_empty() {
        let packages: Vec<&str> = profile.packages.iter().map(String::as_str).collect();
        lines.push(format!("Packages={}", packages.join(" ")));
    }
    if !profile.build_packages.is_empty() {
        let packages: Vec<&str> = profile.build_packages.iter().map(String::as_str).collect();
        lines.push(format!("BuildPackages={}", packages.join(" ")));
    }
    for phase in PHASE_ORDER {
        let Some(name) = emitted_scripts.get(&phase) else {
            continue;
        };
        if let Some(key) = phase.mkosi_conf_key() {
            lines.push(format!("{key}=scripts/{name}"));
        }
    }
    // Cloud conversion helpers run after the numbered postoutput script.
    for target in &profile.output_targets {
        lines.push(format!(
            "PostOutputScripts=scripts/{}",
            scripts::postoutput_script_name(*target)
        ));
    }

    if config.emit_mode == EmitMode::PerDirectory {
        lines.push(String::new());
        lines.extend(build_section(config));
        if let Some(ref kernel) = config.kernel {
            if kernel.config_file.is_none() {
                lines.push(format!("# KernelVersion={}", kernel.version));
            }
        }
    }

    let mut conf = lines.join("\n");
    conf.push('\n');
    conf
}

fn render_root_conf(ir: &ImageIr, config: &EmitConfig, seed: &str) -> String {
    let mut lines: Vec<String> = distribution_section(ir);
    lines.push(String::new());
    lines.push("[Output]".to_string());
    lines.push("ManifestFormat=json".to_string());
    lines.push("CompressOutput=zstd".to_string());
    lines.push(format!("Seed={seed}"));
    lines.push(String::new());
    lines.extend(build_section(config));
    let mut conf = lines.join("\n");
    conf.push('\n');
    conf
}

fn distribution_section(ir: &ImageIr) -> Vec<String> {
    let (distribution, release) = split_base(&ir.base);
    let mut lines = vec![
        "[Distribution]".to_string(),
        format!("Distribution={distribution}"),
    ];
    if let Some(release) = release {
        lines.push(format!("Release={release}"));
    }
    lines.push(format!("Architecture={}", ir.arch.mkosi_arch()));
    lines
}

fn build_section(config: &EmitConfig) -> Vec<String> {
    let mut lines = vec![
        "[Build]".to_string(),
        format!(
            "WithNetwork={}",
            if config.with_network { "true" } else { "false" }
        ),
    ];
    let mut environment = config.environment.clone();
    if config.reproducible && !environment.contains_key("SOURCE_DATE_EPOCH") {
        environment.insert("SOURCE_DATE_EPOCH".to_string(), "0".to_string());
    }
    for (key, value) in &environment {
        lines.push(format!("Environment={key}={value}"));
    }
    let mut passthrough = config.environment_passthrough.clone();
    if config
        .kernel
        .as_ref()
        .map(|k| k.config_file.is_some())
        .unwrap_or(false)
    {
        for key in ["KERNEL_IMAGE", "KERNEL_VERSION"] {
            if !passthrough.iter().any(|p| p == key) {
                passthrough.push(key.to_string());
            }
        }
    }
    passthrough.sort();
    for key in passthrough {
        lines.push(format!("Environment={key}"));
    }
    lines
}

fn phase_fragments(
    profile: &ProfileState,
    phase: Phase,
    config: &EmitConfig,
    ir: &ImageIr,
    services: &[ServiceSpec],
    init_plan: &init::InitPlan,
) -> Result<Vec<String>> {
    let mut fragments: Vec<String> = Vec::new();

    if phase == Phase::Build {
        if let Some(ref kernel) = config.kernel {
            if kernel.config_file.is_some() {
                fragments.push(scripts::kernel_build_fragment(kernel, ir.arch.as_str()));
            }
        }
        for spec in &profile.builds {
            fragments.push(builders::build_script_fragment(spec)?);
        }
    }

    if let Some(commands) = profile.phases.get(&phase) {
        for command in commands {
            fragments.push(scripts::render_command(command));
        }
    }

    if phase == Phase::Postinst {
        fragments.extend(user_fragments(profile));
        fragments.extend(enable_fragments(services, init_plan));
        if let Some(fragment) = debloat::postinst_fragment(&profile.debloat) {
            fragments.push(fragment);
        }
    }
    if phase == Phase::Finalize {
        if let Some(fragment) = debloat::finalize_fragment(&profile.debloat) {
            fragments.push(fragment);
        }
    }
    Ok(fragments)
}

/// User creation commands. Groups come first so `useradd --groups` finds
/// them; creation always precedes service enablement.
fn user_fragments(profile: &ProfileState) -> Vec<String> {
    let mut fragments = Vec::new();
    for user in &profile.users {
        if let Some(gid) = user.gid {
            fragments.push(format!(
                "mkosi-chroot groupadd --force --gid {gid} {}",
                user.name
            ));
        }
        for group in &user.groups {
            fragments.push(format!("mkosi-chroot groupadd --force {group}"));
        }
        let mut parts = vec!["mkosi-chroot useradd".to_string()];
        if user.system {
            parts.push("--system".to_string());
        }
        if let Some(uid) = user.uid {
            parts.push(format!("--uid {uid}"));
        }
        if let Some(gid) = user.gid {
            parts.push(format!("--gid {gid}"));
        }
        if let Some(ref home) = user.home {
            parts.push(format!("--home-dir {home}"));
        }
        parts.push(format!("--shell {}", user.shell));
        if !user.groups.is_empty() {
            parts.push(format!("--groups {}", user.groups.join(",")));
        }
        parts.push(user.name.clone());
        fragments.push(parts.join(" "));
    }
    fragments
}

fn enable_fragments(services: &[ServiceSpec], init_plan: &init::InitPlan) -> Vec<String> {
    let mut fragments = Vec::new();
    for unit in &init_plan.enable_units {
        fragments.push(format!("mkosi-chroot systemctl enable {unit}"));
    }
    for service in services {
        if service.enabled {
            fragments.push(format!(
                "mkosi-chroot systemctl enable {}",
                service.unit_name()
            ));
        }
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::emit_tree;
    use crate::models::{
        Arch, CommandSpec, InitScriptEntry, Kernel, RecipeState, RepositorySpec, RestartPolicy,
        SecurityProfile, TemplateEntry, UserSpec,
    };

    fn snapshot(state: &RecipeState, profiles: &[&str]) -> ImageIr {
        let names: Vec<String> = profiles.iter().map(|s| s.to_string()).collect();
        ImageIr::snapshot(state, &names).unwrap()
    }

    fn base_state() -> RecipeState {
        RecipeState::initialize("debian/bookworm", Arch::X86_64, "default")
    }

    #[test]
    fn test_conf_golden_shape() {
        let mut state = base_state();
        {
            let profile = state.ensure_profile("default");
            profile.packages.insert("jq".to_string());
            profile.packages.insert("curl".to_string());
            let mut env = BTreeMap::new();
            env.insert("B".to_string(), "2".to_string());
            env.insert("A".to_string(), "1".to_string());
            profile
                .phases
                .entry(Phase::Prepare)
                .or_default()
                .push(CommandSpec::new(["echo", "prep"]).with_env(env).with_cwd("/work"));
            profile
                .phases
                .entry(Phase::Build)
                .or_default()
                .push(CommandSpec::new(["echo", "build"]));
        }
        let dir = tempfile::tempdir().unwrap();
        emit_tree(&snapshot(&state, &["default"]), dir.path(), &EmitConfig::default()).unwrap();

        let conf = fs::read_to_string(dir.path().join("default/mkosi.conf")).unwrap();
        assert!(conf.contains("[Distribution]"));
        assert!(conf.contains("Distribution=debian"));
        assert!(conf.contains("Release=bookworm"));
        assert!(conf.contains("Architecture=x86-64"));
        assert!(conf.contains("[Output]"));
        assert!(conf.contains("Format=uki"));
        assert!(conf.contains("ImageId=default"));
        assert!(conf.contains("ManifestFormat=json"));
        assert!(conf.contains("CompressOutput=zstd"));
        assert!(conf.contains("Seed="));
        assert!(conf.contains("[Content]"));
        assert!(conf.contains("CleanPackageMetadata=true"));
        assert!(conf.contains("Packages=curl jq"));
        assert!(conf.contains("PrepareScripts=scripts/03-prepare.sh"));
        assert!(conf.contains("BuildScripts=scripts/04-build.sh"));
        assert!(conf.contains("[Build]"));
        assert!(conf.contains("WithNetwork=true"));
        assert!(conf.contains("Environment=SOURCE_DATE_EPOCH=0"));

        let prepare =
            fs::read_to_string(dir.path().join("default/scripts/03-prepare.sh")).unwrap();
        assert_eq!(
            prepare,
            "#!/usr/bin/env bash\nset -euo pipefail\n\n(cd /work && A=1 B=2 echo prep)\n"
        );
        let build = fs::read_to_string(dir.path().join("default/scripts/04-build.sh")).unwrap();
        assert_eq!(build, "#!/usr/bin/env bash\nset -euo pipefail\n\necho build\n");
    }

    #[test]
    fn test_extra_tree_files_and_templates() {
        let mut state = base_state();
        {
            let profile = state.ensure_profile("default");
            profile.files.push(FileEntry::new("/etc/motd", "hi\n"));
            profile.templates.push(TemplateEntry {
                path: "/etc/app/config.toml".to_string(),
                template: "network={network}\n".to_string(),
                variables: {
                    let mut vars = BTreeMap::new();
                    vars.insert("network".to_string(), "mainnet".to_string());
                    vars
                },
                rendered: "network=mainnet\n".to_string(),
                mode: "0644".to_string(),
            });
        }
        let dir = tempfile::tempdir().unwrap();
        emit_tree(&snapshot(&state, &["default"]), dir.path(), &EmitConfig::default()).unwrap();

        let motd = dir.path().join("default/mkosi.extra/etc/motd");
        assert_eq!(fs::read_to_string(&motd).unwrap(), "hi\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&motd).unwrap().permissions().mode();
            assert_eq!(mode & 0o7777, 0o644);
        }
        let rendered =
            fs::read_to_string(dir.path().join("default/mkosi.extra/etc/app/config.toml"))
                .unwrap();
        assert_eq!(rendered, "network=mainnet\n");
    }

    #[test]
    fn test_service_unit_and_enablement() {
        let mut state = base_state();
        {
            let profile = state.ensure_profile("default");
            profile.users.push(UserSpec {
                name: "app".to_string(),
                uid: Some(1000),
                gid: None,
                system: true,
                home: Some("/var/lib/app".to_string()),
                shell: "/usr/sbin/nologin".to_string(),
                groups: vec!["tdx".to_string()],
            });
            profile.services.push(ServiceSpec {
                name: "app".to_string(),
                exec: vec![
                    "/usr/bin/app".to_string(),
                    "--config".to_string(),
                    "/etc/app.toml".to_string(),
                ],
                user: Some("app".to_string()),
                after: vec!["network-online.target".to_string()],
                requires: vec![],
                wants: vec![],
                restart: RestartPolicy::Always,
                enabled: true,
                security_profile: SecurityProfile::Strict,
                extra_unit: BTreeMap::new(),
            });
        }
        let dir = tempfile::tempdir().unwrap();
        emit_tree(&snapshot(&state, &["default"]), dir.path(), &EmitConfig::default()).unwrap();

        let unit = fs::read_to_string(
            dir.path()
                .join("default/mkosi.extra/usr/lib/systemd/system/app.service"),
        )
        .unwrap();
        assert!(unit.contains("ExecStart=/usr/bin/app --config /etc/app.toml"));
        assert!(unit.contains("User=app"));
        assert!(unit.contains("After=network-online.target"));
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("ProtectSystem=strict"));

        let postinst =
            fs::read_to_string(dir.path().join("default/scripts/06-postinst.sh")).unwrap();
        assert!(postinst.contains("mkosi-chroot useradd"));
        assert!(postinst.contains("--system"));
        assert!(postinst.contains("--home-dir /var/lib/app"));
        assert!(postinst.contains("--groups tdx"));
        assert!(postinst.contains("mkosi-chroot systemctl enable app.service"));
        // User creation precedes service enablement
        let useradd_at = postinst.find("mkosi-chroot useradd").unwrap();
        let enable_at = postinst.find("systemctl enable app.service").unwrap();
        assert!(useradd_at < enable_at);
    }

    #[test]
    fn test_init_plan_lands_in_skeleton_and_orders_services() {
        let mut state = base_state();
        {
            let profile = state.ensure_profile("default");
            profile.init_scripts.push(InitScriptEntry {
                id: "key-generation".to_string(),
                priority: 10,
                exec: "/usr/bin/key-generation".to_string(),
                preconditions: vec![],
            });
            profile.services.push(ServiceSpec {
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
            });
        }
        let dir = tempfile::tempdir().unwrap();
        emit_tree(&snapshot(&state, &["default"]), dir.path(), &EmitConfig::default()).unwrap();

        let runtime_init = dir
            .path()
            .join("default/mkosi.skeleton/usr/bin/runtime-init");
        assert!(runtime_init.exists());
        let unit = fs::read_to_string(
            dir.path()
                .join("default/mkosi.extra/usr/lib/systemd/system/app.service"),
        )
        .unwrap();
        assert!(unit.contains("After=runtime-init.service"));
        let postinst =
            fs::read_to_string(dir.path().join("default/scripts/06-postinst.sh")).unwrap();
        assert!(postinst.contains("mkosi-chroot systemctl enable runtime-init.service"));
    }

    #[test]
    fn test_postoutput_helpers_per_target() {
        let mut state = base_state();
        state.ensure_profile("default").output_targets =
            vec![OutputTarget::Gcp, OutputTarget::Azure];
        let dir = tempfile::tempdir().unwrap();
        emit_tree(&snapshot(&state, &["default"]), dir.path(), &EmitConfig::default()).unwrap();

        let gcp = fs::read_to_string(dir.path().join("default/scripts/gcp-postoutput.sh")).unwrap();
        assert!(gcp.contains("sgdisk"));
        let azure =
            fs::read_to_string(dir.path().join("default/scripts/azure-postoutput.sh")).unwrap();
        assert!(azure.contains("qemu-img convert"));
        assert!(!dir.path().join("default/scripts/qemu-postoutput.sh").exists());

        let conf = fs::read_to_string(dir.path().join("default/mkosi.conf")).unwrap();
        assert!(conf.contains("Format=disk"));
        assert!(conf.contains("PostOutputScripts=scripts/azure-postoutput.sh"));
        assert!(conf.contains("PostOutputScripts=scripts/gcp-postoutput.sh"));
    }

    #[test]
    fn test_repositories_become_skeleton_sources() {
        let mut state = base_state();
        state.ensure_profile("default").repositories.push(RepositorySpec {
            name: "backports".to_string(),
            url: "https://deb.example.com/debian".to_string(),
            suite: Some("bookworm-backports".to_string()),
            components: vec!["main".to_string(), "contrib".to_string()],
            keyring: Some("/usr/share/keyrings/example.gpg".to_string()),
            priority: 100,
        });
        let dir = tempfile::tempdir().unwrap();
        emit_tree(&snapshot(&state, &["default"]), dir.path(), &EmitConfig::default()).unwrap();

        let sources = fs::read_to_string(
            dir.path()
                .join("default/mkosi.skeleton/etc/apt/sources.list.d/backports.sources"),
        )
        .unwrap();
        assert!(sources.contains("URIs: https://deb.example.com/debian"));
        assert!(sources.contains("Suites: bookworm-backports"));
        assert!(sources.contains("Components: main contrib"));
        assert!(sources.contains("Signed-By: /usr/share/keyrings/example.gpg"));
    }

    #[test]
    fn test_native_profiles_layout() {
        let mut state = base_state();
        state.ensure_profile("prod").packages.insert("nginx".to_string());
        let config = EmitConfig {
            emit_mode: EmitMode::NativeProfiles,
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        emit_tree(&snapshot(&state, &["default", "prod"]), dir.path(), &config).unwrap();

        assert!(dir.path().join("mkosi.conf").exists());
        assert!(dir.path().join("mkosi.profiles/default/mkosi.conf").exists());
        assert!(dir.path().join("mkosi.profiles/prod/mkosi.conf").exists());

        let root = fs::read_to_string(dir.path().join("mkosi.conf")).unwrap();
        assert!(root.contains("[Distribution]"));
        assert!(root.contains("Seed="));
        let prod = fs::read_to_string(dir.path().join("mkosi.profiles/prod/mkosi.conf")).unwrap();
        assert!(prod.contains("ImageId=prod"));
        assert!(prod.contains("Packages=nginx"));
        assert!(!prod.contains("[Distribution]"));
    }

    #[test]
    fn test_kernel_with_config_emits_build_script_and_config_copy() {
        let dir = tempfile::tempdir().unwrap();
        let config_file = dir.path().join("kernel.config");
        fs::write(&config_file, "CONFIG_TDX_GUEST=y\n").unwrap();

        let mut state = base_state();
        state.ensure_profile("default").packages.insert("curl".to_string());
        let config = EmitConfig {
            kernel: Some(Kernel::pinned("6.13.12").with_config_file(&config_file)),
            ..Default::default()
        };
        let out = dir.path().join("mkosi");
        emit_tree(&snapshot(&state, &["default"]), &out, &config).unwrap();

        let build = fs::read_to_string(out.join("default/scripts/04-build.sh")).unwrap();
        assert!(build.contains("KERNEL_VERSION=\"6.13.12\""));
        assert!(build.contains("make olddefconfig"));
        let copied = fs::read_to_string(out.join("default/kernel/kernel.config")).unwrap();
        assert_eq!(copied, "CONFIG_TDX_GUEST=y\n");
        let conf = fs::read_to_string(out.join("default/mkosi.conf")).unwrap();
        assert!(conf.contains("Environment=KERNEL_IMAGE\n"));
        assert!(conf.contains("Environment=KERNEL_VERSION\n"));
    }

    #[test]
    fn test_kernel_without_config_renders_comment_only() {
        let mut state = base_state();
        state.ensure_profile("default").packages.insert("curl".to_string());
        let config = EmitConfig {
            kernel: Some(Kernel::pinned("6.8")),
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        emit_tree(&snapshot(&state, &["default"]), dir.path(), &config).unwrap();

        assert!(!dir.path().join("default/scripts/04-build.sh").exists());
        assert!(!dir.path().join("default/kernel").exists());
        let conf = fs::read_to_string(dir.path().join("default/mkosi.conf")).unwrap();
        assert!(conf.contains("# KernelVersion=6.8"));
    }

    #[test]
    fn test_user_environment_not_overridden_by_reproducible() {
        let mut state = base_state();
        state.ensure_profile("default").packages.insert("curl".to_string());
        let mut environment = BTreeMap::new();
        environment.insert("SOURCE_DATE_EPOCH".to_string(), "1234".to_string());
        let config = EmitConfig {
            environment,
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        emit_tree(&snapshot(&state, &["default"]), dir.path(), &config).unwrap();

        let conf = fs::read_to_string(dir.path().join("default/mkosi.conf")).unwrap();
        assert!(conf.contains("Environment=SOURCE_DATE_EPOCH=1234"));
        assert!(!conf.contains("Environment=SOURCE_DATE_EPOCH=0"));
    }

    #[test]
    fn test_debloat_fragments_land_in_postinst_and_finalize() {
        let mut state = base_state();
        {
            let profile = state.ensure_profile("default");
            profile.debloat.enabled = true;
            profile
                .debloat
                .paths_remove_extra
                .push("/usr/share/fonts".to_string());
        }
        let dir = tempfile::tempdir().unwrap();
        emit_tree(&snapshot(&state, &["default"]), dir.path(), &EmitConfig::default()).unwrap();

        let postinst =
            fs::read_to_string(dir.path().join("default/scripts/06-postinst.sh")).unwrap();
        assert!(postinst.contains("mkosi-chroot dpkg-query -L systemd"));
        assert!(postinst.contains("ln -sf minimal.target"));
        let finalize =
            fs::read_to_string(dir.path().join("default/scripts/07-finalize.sh")).unwrap();
        assert!(finalize.contains("rm -rf \"$BUILDROOT/usr/share/doc\""));
        assert!(finalize.contains("rm -rf \"$BUILDROOT/usr/share/fonts\""));
    }

    #[test]
    fn test_version_script_emitted_at_root() {
        let mut state = base_state();
        state.ensure_profile("default").packages.insert("curl".to_string());
        let dir = tempfile::tempdir().unwrap();
        emit_tree(&snapshot(&state, &["default"]), dir.path(), &EmitConfig::default()).unwrap();

        let version = dir.path().join("mkosi.version");
        assert!(version.exists());
        let content = fs::read_to_string(&version).unwrap();
        assert!(content.contains("git rev-parse --short=6 HEAD"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&version).unwrap().permissions().mode();
            assert_eq!(mode & 0o755, 0o755);
        }
    }
}
