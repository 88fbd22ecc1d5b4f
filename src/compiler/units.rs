// src/compiler/units.rs

//! systemd unit generation from service declarations

use crate::models::{SecurityProfile, ServiceSpec};
use std::collections::BTreeMap;

/// On-disk directory for generated units inside the image.
pub const UNIT_DIR: &str = "/usr/lib/systemd/system";

/// Render a service declaration into a unit file.
pub fn render_service_unit(service: &ServiceSpec) -> String {
    let mut lines: Vec<String> = vec!["[Unit]".to_string(), format!("Description={}", service.name)];
    if !service.after.is_empty() {
        lines.push(format!("After={}", service.after.join(" ")));
    }
    if !service.requires.is_empty() {
        lines.push(format!("Requires={}", service.requires.join(" ")));
    }
    if !service.wants.is_empty() {
        lines.push(format!("Wants={}", service.wants.join(" ")));
    }

    lines.push(String::new());
    lines.push("[Service]".to_string());
    if let Some(ref user) = service.user {
        lines.push(format!("User={user}"));
    }
    if !service.exec.is_empty() {
        lines.push(format!("ExecStart={}", service.exec.join(" ")));
    }
    lines.push(format!("Restart={}", service.restart.as_str()));
    if service.security_profile == SecurityProfile::Strict {
        lines.extend(strict_hardening().iter().map(|s| s.to_string()));
    }
    append_extra(&mut lines, "Service", &service.extra_unit);

    for (section, entries) in &service.extra_unit {
        if section == "Unit" || section == "Service" || section == "Install" {
            continue;
        }
        lines.push(String::new());
        lines.push(format!("[{section}]"));
        for (key, value) in entries {
            lines.push(format!("{key}={value}"));
        }
    }

    lines.push(String::new());
    lines.push("[Install]".to_string());
    lines.push("WantedBy=minimal.target".to_string());

    let mut unit = lines.join("\n");
    unit.push('\n');
    unit
}

fn append_extra(
    lines: &mut Vec<String>,
    section: &str,
    extra: &BTreeMap<String, BTreeMap<String, String>>,
) {
    if let Some(entries) = extra.get(section) {
        for (key, value) in entries {
            lines.push(format!("{key}={value}"));
        }
    }
}

fn strict_hardening() -> &'static [&'static str] {
    &[
        "ProtectSystem=strict",
        "ProtectHome=yes",
        "PrivateTmp=yes",
        "NoNewPrivileges=yes",
        "RestrictSUIDSGID=yes",
        "ProtectKernelModules=yes",
    ]
}
