// src/init/mod.rs

//! Boot-time init composition
//!
//! Modules contribute prioritized init steps; at emit time they compose
//! into a single `/usr/bin/runtime-init` script plus a oneshot
//! `runtime-init.service`. Steps run in `(priority, id)` order, abort on
//! the first non-zero status, and log to the journal. When any step feeds
//! the secrets pipeline, the unit orders `Before=secrets-ready.target` and
//! a passive `secrets-ready.target` is synthesized for services to wait
//! on. Every user-declared service is ordered `After=runtime-init.service`
//! unless it already names it.

use crate::models::{FileEntry, InitScriptEntry, ProfileState, ServiceSpec};

/// Path of the composed init script inside the image.
pub const RUNTIME_INIT_PATH: &str = "/usr/bin/runtime-init";

/// Unit name of the composed init service.
pub const RUNTIME_INIT_SERVICE: &str = "runtime-init.service";

/// Passive target reached once secret delivery completes.
pub const SECRETS_READY_TARGET: &str = "secrets-ready.target";

const RUNTIME_INIT_UNIT_PATH: &str = "/usr/lib/systemd/system/runtime-init.service";
const SECRETS_READY_UNIT_PATH: &str = "/usr/lib/systemd/system/secrets-ready.target";

/// Everything the emitter needs to place for the init subsystem.
#[derive(Debug, Clone, Default)]
pub struct InitPlan {
    /// Files for `mkosi.skeleton/` (script + unit files).
    pub skeleton_files: Vec<FileEntry>,
    /// Units enabled in the postinst script.
    pub enable_units: Vec<String>,
}

impl InitPlan {
    pub fn is_empty(&self) -> bool {
        self.skeleton_files.is_empty()
    }
}

/// Build the init plan for a profile. Returns an empty plan when the
/// profile contributes no init steps.
pub fn plan_for_profile(profile: &ProfileState) -> InitPlan {
    let mut steps: Vec<InitScriptEntry> = profile.init_scripts.clone();
    if steps.is_empty() {
        return InitPlan::default();
    }
    steps.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));

    let provides_secret_material =
        !profile.secrets.is_empty() || profile.secrets_delivery.is_some();

    let mut plan = InitPlan::default();
    plan.skeleton_files.push(
        FileEntry::new(RUNTIME_INIT_PATH, render_runtime_init(&steps)).with_mode("0755"),
    );
    plan.skeleton_files.push(FileEntry::new(
        RUNTIME_INIT_UNIT_PATH,
        render_runtime_init_unit(provides_secret_material),
    ));
    if provides_secret_material {
        plan.skeleton_files
            .push(FileEntry::new(SECRETS_READY_UNIT_PATH, render_secrets_ready_unit()));
    }
    plan.enable_units.push(RUNTIME_INIT_SERVICE.to_string());
    plan
}

/// Order every user-declared service after runtime-init unless it already
/// names it.
pub fn inject_service_ordering(services: &mut [ServiceSpec]) {
    for service in services {
        if !service.after.iter().any(|a| a == RUNTIME_INIT_SERVICE) {
            service.after.push(RUNTIME_INIT_SERVICE.to_string());
        }
    }
}

fn render_runtime_init(steps: &[InitScriptEntry]) -> String {
    let mut lines: Vec<String> = vec![
        "#!/bin/bash".to_string(),
        "set -euo pipefail".to_string(),
        String::new(),
        "log() {".to_string(),
        "    echo \"runtime-init: $1\" | systemd-cat -t runtime-init -p info 2>/dev/null \\".to_string(),
        "        || echo \"runtime-init: $1\"".to_string(),
        "}".to_string(),
        String::new(),
    ];
    for step in steps {
        for precondition in &step.preconditions {
            lines.push(format!(
                "[ -e {precondition} ] || {{ log \"{id}: precondition {precondition} missing\"; exit 1; }}",
                id = step.id
            ));
        }
        lines.push(format!("log \"{} start\"", step.id));
        lines.push(step.exec.trim_end().to_string());
        lines.push(format!("log \"{} done\"", step.id));
        lines.push(String::new());
    }
    lines.push("log \"all steps complete\"".to_string());
    let mut script = lines.join("\n");
    script.push('\n');
    script
}

fn render_runtime_init_unit(provides_secret_material: bool) -> String {
    let mut lines = vec![
        "[Unit]".to_string(),
        "Description=Runtime Init".to_string(),
        "After=network-online.target".to_string(),
        "Wants=network-online.target".to_string(),
    ];
    if provides_secret_material {
        lines.push(format!("Before={SECRETS_READY_TARGET}"));
    }
    lines.extend([
        String::new(),
        "[Service]".to_string(),
        "Type=oneshot".to_string(),
        format!("ExecStart={RUNTIME_INIT_PATH}"),
        "RemainAfterExit=yes".to_string(),
        String::new(),
        "[Install]".to_string(),
        "WantedBy=minimal.target".to_string(),
    ]);
    let mut unit = lines.join("\n");
    unit.push('\n');
    unit
}

fn render_secrets_ready_unit() -> String {
    // Passive: nothing wants it; runtime-init reaches it after delivery.
    "[Unit]\nDescription=Secrets Ready\n".to_string()
}
