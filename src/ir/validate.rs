// src/ir/validate.rs

//! Cross-phase IR validation
//!
//! Runs after normalization on every snapshot. Checks, per profile:
//! - user and service name uniqueness
//! - every service `user` references a declared user
//! - every After/Requires/Wants edge resolves to a declared unit, a
//!   synthesized unit, or an allowlisted system target
//! - the service dependency graph is acyclic
//! - prepare-phase commands do not reference build-phase outputs
//! - secrets delivery configuration is consistent with declared secrets
//! - init script ids are unique

use crate::error::{Error, Result};
use crate::ir::ImageIr;
use crate::models::{CommandSpec, CompletionMode, Phase, ProfileState};
use std::collections::{BTreeMap, BTreeSet};

/// Units the SDK synthesizes and services may therefore order against.
pub const SYNTHESIZED_UNITS: &[&str] = &[
    "network-online.target",
    "secrets-ready.target",
    "runtime-init.service",
];

/// System targets services may reference without declaring them.
pub const SYSTEM_TARGET_ALLOWLIST: &[&str] = &[
    "basic.target",
    "default.target",
    "local-fs-pre.target",
    "local-fs.target",
    "minimal.target",
    "multi-user.target",
    "network.target",
    "slices.target",
    "sockets.target",
    "sysinit.target",
    "timers.target",
];

/// Validate the whole IR. The first violation aborts with profile and
/// phase context attached.
pub fn validate(ir: &ImageIr) -> Result<()> {
    for (name, profile) in &ir.profiles {
        validate_profile(name, profile)?;
    }
    Ok(())
}

fn validate_profile(name: &str, profile: &ProfileState) -> Result<()> {
    validate_unique_names(name, profile)?;
    validate_service_references(name, profile)?;
    validate_service_graph(name, profile)?;
    validate_phase_artifact_order(name, profile)?;
    validate_secrets_delivery(name, profile)?;
    validate_init_scripts(name, profile)?;
    if profile.output_targets.is_empty() {
        return Err(Error::validation("Profile declares no output targets.")
            .with_hint("Call output_targets() with at least one target.")
            .with_profile(name.to_string())
            .with_operation("validate"));
    }
    Ok(())
}

fn validate_unique_names(name: &str, profile: &ProfileState) -> Result<()> {
    let mut users = BTreeSet::new();
    for user in &profile.users {
        if !users.insert(&user.name) {
            return Err(Error::validation(format!("Duplicate user name `{}`.", user.name))
                .with_hint("User names must be unique within a profile.")
                .with_profile(name.to_string())
                .with_operation("validate"));
        }
    }
    let mut services = BTreeSet::new();
    for service in &profile.services {
        if !services.insert(&service.name) {
            return Err(Error::validation(format!(
                "Duplicate service name `{}`.",
                service.name
            ))
            .with_hint("Service names must be unique within a profile.")
            .with_profile(name.to_string())
            .with_operation("validate"));
        }
    }
    Ok(())
}

fn validate_service_references(name: &str, profile: &ProfileState) -> Result<()> {
    let users: BTreeSet<&str> = profile.users.iter().map(|u| u.name.as_str()).collect();
    let units: BTreeSet<String> = profile.services.iter().map(|s| s.unit_name()).collect();

    for service in &profile.services {
        if let Some(ref user) = service.user {
            if !users.contains(user.as_str()) {
                return Err(Error::validation(format!(
                    "Service `{}` references unknown user `{user}`.",
                    service.name
                ))
                .with_hint("Declare the user in the same profile before the bake.")
                .with_profile(name.to_string())
                .with_operation("validate"));
            }
        }
        for edge in service
            .after
            .iter()
            .chain(service.requires.iter())
            .chain(service.wants.iter())
        {
            if units.contains(edge)
                || SYNTHESIZED_UNITS.contains(&edge.as_str())
                || SYSTEM_TARGET_ALLOWLIST.contains(&edge.as_str())
            {
                continue;
            }
            return Err(Error::validation(format!(
                "Service `{}` orders against unknown unit `{edge}`.",
                service.name
            ))
            .with_hint("Reference a declared service, a synthesized unit, or an allowlisted system target.")
            .with_profile(name.to_string())
            .with_operation("validate"));
        }
    }
    Ok(())
}

/// Topological check over After/Requires edges between declared services.
fn validate_service_graph(name: &str, profile: &ProfileState) -> Result<()> {
    let units: BTreeMap<String, usize> = profile
        .services
        .iter()
        .enumerate()
        .map(|(index, s)| (s.unit_name(), index))
        .collect();

    // Adjacency: service -> services it must start after.
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); profile.services.len()];
    for (index, service) in profile.services.iter().enumerate() {
        for edge in service.after.iter().chain(service.requires.iter()) {
            if let Some(&dep) = units.get(edge) {
                edges[index].push(dep);
            }
        }
    }

    // Iterative DFS cycle detection. 0 = unvisited, 1 = in stack, 2 = done.
    let mut color = vec![0u8; profile.services.len()];
    for start in 0..profile.services.len() {
        if color[start] != 0 {
            continue;
        }
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        color[start] = 1;
        while let Some((node, next)) = stack.last_mut() {
            let node = *node;
            if *next < edges[node].len() {
                let child = edges[node][*next];
                *next += 1;
                match color[child] {
                    0 => {
                        color[child] = 1;
                        stack.push((child, 0));
                    }
                    1 => {
                        return Err(Error::validation(format!(
                            "Service dependency cycle involving `{}`.",
                            profile.services[child].name
                        ))
                        .with_hint("Break the After/Requires cycle between these services.")
                        .with_profile(name.to_string())
                        .with_operation("validate"));
                    }
                    _ => {}
                }
            } else {
                color[node] = 2;
                stack.pop();
            }
        }
    }
    Ok(())
}

/// Deny prepare-phase commands that reference artifacts only produced by a
/// build-phase BuildSpec.
fn validate_phase_artifact_order(name: &str, profile: &ProfileState) -> Result<()> {
    let build_outputs: Vec<&str> = profile
        .builds
        .iter()
        .map(|b| b.output.as_str())
        .chain(profile.builds.iter().flat_map(|b| b.artifacts.values().map(|v| v.as_str())))
        .collect();
    if build_outputs.is_empty() {
        return Ok(());
    }

    let prepare_commands = profile.phases.get(&Phase::Prepare).map(Vec::as_slice).unwrap_or(&[]);
    for command in prepare_commands {
        let rendered = render_for_scan(command);
        for output in &build_outputs {
            let dest_form = format!("$DESTDIR{output}");
            if rendered.contains(output) || rendered.contains(&dest_form) {
                return Err(Error::phase_order(format!(
                    "Prepare-phase command references `{output}`, which is produced in the build phase."
                ))
                .with_hint("Move the command to the build phase or later.")
                .with_profile(name.to_string())
                .with_phase("prepare")
                .with_operation("validate"));
            }
        }
    }
    Ok(())
}

fn render_for_scan(command: &CommandSpec) -> String {
    command.argv.join(" ")
}

fn validate_secrets_delivery(name: &str, profile: &ProfileState) -> Result<()> {
    let Some(ref delivery) = profile.secrets_delivery else {
        return Ok(());
    };
    if delivery.method != "http_post" {
        return Err(Error::validation(format!(
            "Unsupported secrets delivery method `{}`.",
            delivery.method
        ))
        .with_profile(name.to_string())
        .with_operation("validate"));
    }
    if delivery.completion == CompletionMode::AllRequired
        && !profile.secrets.iter().any(|s| s.required)
    {
        return Err(Error::validation(
            "Secrets delivery completion `all_required` needs at least one required secret.",
        )
        .with_hint("Declare a required secret or switch completion to `any`.")
        .with_profile(name.to_string())
        .with_operation("validate"));
    }
    for secret in &profile.secrets {
        if secret.targets.is_empty() {
            return Err(Error::validation(format!(
                "Secret `{}` declares no delivery targets.",
                secret.name
            ))
            .with_profile(name.to_string())
            .with_operation("validate"));
        }
    }
    Ok(())
}

fn validate_init_scripts(name: &str, profile: &ProfileState) -> Result<()> {
    let mut ids = BTreeSet::new();
    for script in &profile.init_scripts {
        if !ids.insert(&script.id) {
            return Err(Error::validation(format!(
                "Duplicate init script id `{}`.",
                script.id
            ))
            .with_hint("Init script ids must be unique within a profile.")
            .with_profile(name.to_string())
            .with_operation("validate"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Arch, BuildKind, BuildSource, BuildSpec, RecipeState, SecretSpec, SecretTarget,
        SecretsDeliveryConfig, ServiceSpec, UserSpec,
    };

    fn snapshot(state: &RecipeState) -> Result<ImageIr> {
        ImageIr::snapshot(state, &["default".to_string()])
    }

    fn base_state() -> RecipeState {
        RecipeState::initialize("debian/bookworm", Arch::X86_64, "default")
    }

    fn service(name: &str) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            exec: vec![format!("/usr/bin/{name}")],
            user: None,
            after: vec![],
            requires: vec![],
            wants: vec![],
            restart: Default::default(),
            enabled: true,
            security_profile: Default::default(),
            extra_unit: Default::default(),
        }
    }

    #[test]
    fn test_service_with_unknown_user_fails() {
        let mut state = base_state();
        {
            let profile = state.ensure_profile("default");
            let mut svc = service("app");
            svc.user = Some("app".to_string());
            profile.services.push(svc);
        }
        let err = snapshot(&state).unwrap_err();
        assert_eq!(err.code(), "E_VALIDATION");
        assert_eq!(err.context().unwrap().profile.as_deref(), Some("default"));
    }

    #[test]
    fn test_service_with_declared_user_passes() {
        let mut state = base_state();
        {
            let profile = state.ensure_profile("default");
            profile.users.push(UserSpec {
                name: "app".to_string(),
                uid: None,
                gid: None,
                system: true,
                home: None,
                shell: "/usr/sbin/nologin".to_string(),
                groups: vec![],
            });
            let mut svc = service("app");
            svc.user = Some("app".to_string());
            profile.services.push(svc);
        }
        assert!(snapshot(&state).is_ok());
    }

    #[test]
    fn test_after_resolves_against_synthesized_and_allowlisted_units() {
        let mut state = base_state();
        {
            let profile = state.ensure_profile("default");
            let mut svc = service("app");
            svc.after = vec![
                "network-online.target".to_string(),
                "secrets-ready.target".to_string(),
                "sysinit.target".to_string(),
            ];
            profile.services.push(svc);
        }
        assert!(snapshot(&state).is_ok());
    }

    #[test]
    fn test_after_unknown_unit_fails() {
        let mut state = base_state();
        {
            let profile = state.ensure_profile("default");
            let mut svc = service("app");
            svc.after = vec!["ghost.service".to_string()];
            profile.services.push(svc);
        }
        let err = snapshot(&state).unwrap_err();
        assert_eq!(err.code(), "E_VALIDATION");
    }

    #[test]
    fn test_service_cycle_fails() {
        let mut state = base_state();
        {
            let profile = state.ensure_profile("default");
            let mut a = service("a");
            a.after = vec!["b.service".to_string()];
            let mut b = service("b");
            b.after = vec!["a.service".to_string()];
            profile.services.push(a);
            profile.services.push(b);
        }
        let err = snapshot(&state).unwrap_err();
        assert_eq!(err.code(), "E_VALIDATION");
    }

    #[test]
    fn test_service_dag_passes() {
        let mut state = base_state();
        {
            let profile = state.ensure_profile("default");
            let mut a = service("a");
            a.after = vec!["b.service".to_string()];
            let mut b = service("b");
            b.after = vec!["c.service".to_string()];
            profile.services.push(a);
            profile.services.push(b);
            profile.services.push(service("c"));
        }
        assert!(snapshot(&state).is_ok());
    }

    #[test]
    fn test_prepare_referencing_build_output_fails() {
        let mut state = base_state();
        {
            let profile = state.ensure_profile("default");
            profile.builds.push(BuildSpec {
                name: "myprog".to_string(),
                kind: BuildKind::Go { ldflags: None },
                src: BuildSource::Local {
                    path: "myprog".to_string(),
                },
                output: "/usr/bin/myprog".to_string(),
                toolchain: "go1.22.3".to_string(),
                target_arch: Arch::X86_64,
                flags: vec![],
                build_deps: vec![],
                env: Default::default(),
                artifacts: Default::default(),
            });
            profile
                .phases
                .entry(Phase::Prepare)
                .or_default()
                .push(CommandSpec::new(["/usr/bin/myprog", "--version"]));
        }
        let err = snapshot(&state).unwrap_err();
        assert_eq!(err.code(), "E_PHASE_ORDER_INVALID");
        assert_eq!(err.context().unwrap().phase.as_deref(), Some("prepare"));
    }

    #[test]
    fn test_all_required_delivery_needs_a_required_secret() {
        let mut state = base_state();
        {
            let profile = state.ensure_profile("default");
            profile.secrets_delivery = Some(SecretsDeliveryConfig::default());
            profile.secrets.push(SecretSpec {
                name: "OPTIONAL_TOKEN".to_string(),
                required: false,
                schema: None,
                targets: vec![SecretTarget::file("/run/tdx-secrets/tok")],
            });
        }
        let err = snapshot(&state).unwrap_err();
        assert_eq!(err.code(), "E_VALIDATION");
    }
}
