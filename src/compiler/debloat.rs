// src/compiler/debloat.rs

//! Debloat script fragments
//!
//! Debloat splits across two phases: postinst prunes systemd-owned
//! binaries and masks units (enumerated live via `dpkg-query -L systemd`
//! against keep-lists) and points `default.target` at `minimal.target`;
//! finalize removes the path list, with per-profile conditional guards
//! driven by `$PROFILES`. An explain mode returns the planned removals
//! without writing anything.

use crate::models::DebloatConfig;
use serde::Serialize;

/// The planned effect of debloat for one profile, for explain mode and
/// bake reports.
#[derive(Debug, Clone, Serialize)]
pub struct DebloatPlan {
    pub enabled: bool,
    pub paths_remove: Vec<String>,
    pub paths_skip: Vec<String>,
    pub systemd_minimize: bool,
    pub units_keep: Vec<String>,
    pub bins_keep: Vec<String>,
}

/// Compute the removal plan without writing it.
pub fn explain(config: &DebloatConfig) -> DebloatPlan {
    if !config.enabled {
        return DebloatPlan {
            enabled: false,
            paths_remove: Vec::new(),
            paths_skip: Vec::new(),
            systemd_minimize: false,
            units_keep: Vec::new(),
            bins_keep: Vec::new(),
        };
    }
    DebloatPlan {
        enabled: true,
        paths_remove: config.effective_paths_remove(),
        paths_skip: config.paths_skip.clone(),
        systemd_minimize: config.systemd_minimize,
        units_keep: config.effective_units_keep(),
        bins_keep: config.bins_keep.clone(),
    }
}

/// Postinst fragment: binary pruning, unit masking, default target.
pub fn postinst_fragment(config: &DebloatConfig) -> Option<String> {
    if !config.enabled || !config.systemd_minimize {
        return None;
    }
    let bins_keep = config.bins_keep.join(" ");
    let units_keep = config.effective_units_keep().join(" ");
    Some(format!(
        r#"# Debloat: prune systemd-owned binaries
KEEP_BINS="{bins_keep}"
for bin in $(mkosi-chroot dpkg-query -L systemd | grep -E '^/usr/bin/' | sort); do
    name=$(basename "$bin")
    keep=0
    for k in $KEEP_BINS; do [ "$name" = "$k" ] && keep=1; done
    [ "$keep" = "1" ] || rm -f "$BUILDROOT$bin"
done
# Debloat: mask systemd-owned units
KEEP_UNITS="{units_keep}"
for unit in $(mkosi-chroot dpkg-query -L systemd | grep -E '\.service$|\.socket$|\.timer$|\.target$|\.mount$' | sed 's#.*/##' | sort -u); do
    keep=0
    for k in $KEEP_UNITS; do [ "$unit" = "$k" ] && keep=1; done
    [ "$keep" = "1" ] || mkosi-chroot systemctl mask "$unit" >/dev/null 2>&1 || true
done
ln -sf minimal.target "$BUILDROOT/etc/systemd/system/default.target""#
    ))
}

/// Finalize fragment: unconditional path removals plus profile-guarded
/// removals.
pub fn finalize_fragment(config: &DebloatConfig) -> Option<String> {
    if !config.enabled {
        return None;
    }
    let mut lines: Vec<String> = vec!["# Debloat: remove paths".to_string()];
    for path in config.effective_paths_remove() {
        lines.push(format!("rm -rf \"$BUILDROOT{path}\""));
    }
    if !config.paths_skip_for_profiles.is_empty() {
        lines.push("# Debloat: profile-conditional".to_string());
        for (profile, paths) in &config.paths_skip_for_profiles {
            lines.push(format!(
                "if [[ ! \"${{PROFILES:-}}\" == *\"{profile}\"* ]]; then"
            ));
            for path in paths {
                lines.push(format!("    rm -rf \"$BUILDROOT{path}\""));
            }
            lines.push("fi".to_string());
        }
    }
    Some(lines.join("\n"))
}
