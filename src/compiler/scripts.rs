// src/compiler/scripts.rs

//! Phase script rendering and static helper scripts
//!
//! Every emitted script starts with `set -euo pipefail` and preserves
//! declaration order byte-for-byte. Command environments render as sorted
//! `KEY=value` prefixes, working directories as subshells, and opt-in
//! shell commands through `bash -lc`. mkosi's runtime variables
//! (`$BUILDROOT`, `$DESTDIR`, ...) pass through untouched.

use crate::builders::shell_quote;
use crate::models::{CommandSpec, Kernel, OutputTarget};

/// Shared script preamble.
pub const SCRIPT_HEADER: &str = "#!/usr/bin/env bash\nset -euo pipefail\n";

/// Render one phase script from its fragments. Fragments are either
/// rendered commands or multi-line blocks (build specs, debloat).
pub fn render_phase_script(fragments: &[String]) -> String {
    let mut script = String::from(SCRIPT_HEADER);
    script.push('\n');
    for fragment in fragments {
        script.push_str(fragment);
        script.push('\n');
    }
    script
}

/// Render a single command the way the phase script will execute it.
pub fn render_command(command: &CommandSpec) -> String {
    let env_prefix: String = command
        .env
        .iter()
        .map(|(key, value)| format!("{key}={}", shell_quote(value)))
        .collect::<Vec<_>>()
        .join(" ");
    let argv: String = command
        .argv
        .iter()
        .map(|part| shell_quote(part))
        .collect::<Vec<_>>()
        .join(" ");

    let mut rendered = if env_prefix.is_empty() {
        argv
    } else {
        format!("{env_prefix} {argv}")
    };
    if let Some(ref cwd) = command.cwd {
        rendered = format!("(cd {} && {rendered})", shell_quote(cwd));
    }
    if command.shell {
        rendered = format!("bash -lc {}", shell_quote(&rendered));
    }
    rendered
}

/// Static `mkosi.version` script: `YYYY-MM-DD.hash[-dirty]`.
pub const MKOSI_VERSION_SCRIPT: &str = r#"#!/bin/sh
set -eu
DATE=$(git log -1 --format=%cd --date=format:%Y-%m-%d 2>/dev/null || date -u +%Y-%m-%d)
HASH=$(git rev-parse --short=6 HEAD 2>/dev/null || echo 000000)
DIRTY=""
if ! git diff --quiet 2>/dev/null; then
    DIRTY="-dirty"
fi
echo "${DATE}.${HASH}${DIRTY}"
"#;

/// GCP postoutput: pad the raw disk to a whole GiB, rebuild the GPT
/// backup header, and pack `disk.raw` into the tarball GCP imports.
pub const GCP_POSTOUTPUT_SCRIPT: &str = r#"#!/usr/bin/env bash
set -euo pipefail

RAW="$OUTPUTDIR/image.raw"
DISK="$OUTPUTDIR/disk.raw"
cp --sparse=always "$RAW" "$DISK"

SIZE=$(stat -c %s "$DISK")
GIB=$((1024 * 1024 * 1024))
PADDED=$(( (SIZE + GIB - 1) / GIB * GIB ))
truncate -s "$PADDED" "$DISK"
sgdisk --move-second-header "$DISK"

tar --format=oldgnu -Sczf "$OUTPUTDIR/disk.raw.tar.gz" -C "$OUTPUTDIR" disk.raw
rm -f "$DISK"
"#;

/// Azure postoutput: convert to a fixed-size VHD with 1 MiB alignment.
pub const AZURE_POSTOUTPUT_SCRIPT: &str = r#"#!/usr/bin/env bash
set -euo pipefail

RAW="$OUTPUTDIR/image.raw"
MB=$((1024 * 1024))
SIZE=$(qemu-img info -f raw --output json "$RAW" | grep '"virtual-size"' | tr -dc '0-9')
ROUNDED=$(( (SIZE / MB + 1) * MB ))
qemu-img resize -f raw "$RAW" "$ROUNDED"
qemu-img convert -f raw -o subformat=fixed,force_size -O vpc "$RAW" "$OUTPUTDIR/disk.vhd"
"#;

/// QEMU postoutput: qcow2 conversion for local VM launches.
pub const QEMU_POSTOUTPUT_SCRIPT: &str = r#"#!/usr/bin/env bash
set -euo pipefail

RAW="$OUTPUTDIR/image.raw"
qemu-img convert -f raw -O qcow2 "$RAW" "$OUTPUTDIR/disk.qcow2"
"#;

/// Postoutput helper script name for a target.
pub fn postoutput_script_name(target: OutputTarget) -> &'static str {
    match target {
        OutputTarget::Qemu => "qemu-postoutput.sh",
        OutputTarget::Azure => "azure-postoutput.sh",
        OutputTarget::Gcp => "gcp-postoutput.sh",
    }
}

/// Postoutput helper script body for a target.
pub fn postoutput_script_body(target: OutputTarget) -> &'static str {
    match target {
        OutputTarget::Qemu => QEMU_POSTOUTPUT_SCRIPT,
        OutputTarget::Azure => AZURE_POSTOUTPUT_SCRIPT,
        OutputTarget::Gcp => GCP_POSTOUTPUT_SCRIPT,
    }
}

/// Build-phase fragment compiling a pinned kernel from source. Emitted
/// when the kernel spec carries a config file (copied to
/// `kernel/kernel.config` in the project tree).
pub fn kernel_build_fragment(kernel: &Kernel, arch: &str) -> String {
    format!(
        r#"# kernel:{version}
KERNEL_VERSION="{version}"
git clone --depth 1 --branch "v${{KERNEL_VERSION}}" {repo} "$BUILDROOT/build/linux"
cp "$SRCDIR/kernel/kernel.config" "$BUILDROOT/build/linux/.config"
mkosi-chroot bash -c 'cd /build/linux && \
    make olddefconfig && \
    KBUILD_BUILD_TIMESTAMP="@0" KBUILD_BUILD_USER=root KBUILD_BUILD_HOST=localhost \
        make -j"$(nproc)" bzImage ARCH={arch} && \
    make -j"$(nproc)" modules'
mkosi-chroot bash -c 'cd /build/linux && make INSTALL_MOD_PATH=/work/modules modules_install'
mkdir -p "${{DESTDIR}}/usr/lib/modules/"
cp -r "$BUILDROOT/work/modules/lib/modules/." "${{DESTDIR}}/usr/lib/modules/"
install -D -m 0644 "$BUILDROOT/build/linux/arch/{arch}/boot/bzImage" "${{DESTDIR}}/usr/lib/modules/vmlinuz"
"#,
        version = kernel.version,
        repo = shell_quote(&kernel.source_repo),
    )
}
