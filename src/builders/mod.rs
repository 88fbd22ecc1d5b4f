// src/builders/mod.rs

//! Per-variant build script fragments
//!
//! A [`BuildSpec`](crate::models::BuildSpec) compiles into one shell
//! fragment following a single pattern: probe the build cache under
//! `$BUILDDIR`, acquire the source (git clone at the resolved ref, locked
//! tarball, or local copy), run the toolchain inside `mkosi-chroot`, store
//! the built artifacts into the cache directory, then `install -D` each
//! artifact into `$DESTDIR`. The cache directory name embeds the canonical
//! cache key so any input change forces a rebuild.

use crate::cache::{cache_key, BuildCacheInput};
use crate::error::{Error, Result};
use crate::models::{BuildKind, BuildSource, BuildSpec, FetchKind};
use std::collections::BTreeMap;

/// POSIX single-quote escaping, the way `shlex.quote` renders it.
pub(crate) fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Cache inputs for a build spec, shared with the host-side cache store.
pub fn cache_input_for(spec: &BuildSpec) -> BuildCacheInput {
    let src_tree_hash = match &spec.src {
        BuildSource::Local { path } => format!("local:{path}"),
        BuildSource::Fetch { fetch } => match fetch.kind {
            FetchKind::Git => fetch
                .resolved_tree_hash
                .clone()
                .or_else(|| fetch.requested_ref.clone())
                .unwrap_or_else(|| fetch.url.clone()),
            FetchKind::Http => fetch
                .integrity
                .clone()
                .unwrap_or_else(|| fetch.url.clone()),
        },
    };
    let sdk_version = match &spec.kind {
        BuildKind::Dotnet { sdk_version, .. } => sdk_version.clone(),
        _ => None,
    };
    BuildCacheInput {
        builder: spec.kind.builder_name().to_string(),
        src_tree_hash,
        toolchain: spec.toolchain.clone(),
        target_arch: spec.target_arch,
        flags: spec.flags.clone(),
        build_deps: spec.build_deps.clone(),
        env: spec.env.clone(),
        sdk_version,
    }
}

/// Stable per-build cache directory name: `<name>-<key prefix>`.
pub fn build_id(spec: &BuildSpec) -> Result<String> {
    let key = cache_key(&cache_input_for(spec))?;
    Ok(format!("{}-{}", spec.name, &key[..12]))
}

/// Effective artifact map: built path (relative to the source dir) ->
/// install path inside the image.
fn effective_artifacts(spec: &BuildSpec) -> BTreeMap<String, String> {
    if spec.artifacts.is_empty() {
        let mut map = BTreeMap::new();
        map.insert(format!("build/{}", spec.name), spec.output.clone());
        map
    } else {
        spec.artifacts.clone()
    }
}

/// Render the full build-phase fragment for one spec.
pub fn build_script_fragment(spec: &BuildSpec) -> Result<String> {
    let id = build_id(spec)?;
    let cache_dir = format!("\"$BUILDDIR/{id}\"");
    let source_dir = format!("$BUILDROOT/build/{}", spec.name);
    let artifacts = effective_artifacts(spec);

    let acquire = acquire_command(spec, &source_dir)?;
    let build = chroot_build_command(spec)?;

    let mut store_parts: Vec<String> = vec![format!("mkdir -p {cache_dir}")];
    let mut restore_parts: Vec<String> = Vec::new();
    for (index, (built, install)) in artifacts.iter().enumerate() {
        let slot = format!("artifact-{index}");
        store_parts.push(format!(
            "install -D -m 0755 \"{source_dir}/{built}\" {cache_dir}/{slot}"
        ));
        restore_parts.push(format!(
            "install -D -m 0755 {cache_dir}/{slot} \"$DESTDIR{install}\""
        ));
    }
    let store = store_parts.join(" && ");
    let restore = restore_parts.join(" && ");

    let probe = format!("[ -d {cache_dir} ] && [ \"$(ls -A {cache_dir} 2>/dev/null)\" ]");
    Ok(format!(
        "# build:{name}\nif ! ({probe}); then {acquire} && {build} && {store}; fi && {restore}",
        name = spec.name
    ))
}

fn acquire_command(spec: &BuildSpec, source_dir: &str) -> Result<String> {
    match &spec.src {
        BuildSource::Local { path } => Ok(format!(
            "mkdir -p \"{source_dir}\" && cp -r \"$SRCDIR/{path}/.\" \"{source_dir}/\"",
        )),
        BuildSource::Fetch { fetch } => match fetch.kind {
            FetchKind::Git => {
                let reference = fetch
                    .resolved_commit
                    .as_deref()
                    .or(fetch.requested_ref.as_deref())
                    .ok_or_else(|| {
                        Error::validation(format!(
                            "Build `{}` has a git source without a ref.",
                            spec.name
                        ))
                        .with_operation("emit")
                    })?;
                Ok(format!(
                    "git clone --depth=1 -b {reference} {url} \"{source_dir}\"",
                    reference = shell_quote(reference),
                    url = shell_quote(&fetch.url),
                ))
            }
            FetchKind::Http => {
                let integrity = fetch.integrity.as_deref().ok_or_else(|| {
                    Error::validation(format!(
                        "Build `{}` has an http source without integrity.",
                        spec.name
                    ))
                    .with_operation("emit")
                })?;
                Ok(format!(
                    "curl -fsSL {url} -o \"{source_dir}.tar.gz\" && \
                     echo \"{integrity}  {source_dir}.tar.gz\" | sha256sum -c - && \
                     mkdir -p \"{source_dir}\" && \
                     tar -xzf \"{source_dir}.tar.gz\" -C \"{source_dir}\" --strip-components=1",
                    url = shell_quote(&fetch.url),
                ))
            }
        },
    }
}

/// The `mkosi-chroot bash -c '...'` invocation with the toolchain-pinned
/// env. The working directory inside the chroot is `/build/<name>`.
fn chroot_build_command(spec: &BuildSpec) -> Result<String> {
    let mut env_prefix = String::new();
    for (key, value) in &spec.env {
        env_prefix.push_str(&format!("{key}={} ", shell_quote(value)));
    }
    let inner = match &spec.kind {
        BuildKind::Go { ldflags } => {
            let mut flags = String::from("-s -w -buildid=");
            if let Some(extra) = ldflags {
                flags.push(' ');
                flags.push_str(extra);
            }
            let user_flags = join_flags(&spec.flags);
            format!(
                "mkdir -p ./build && {env_prefix}go build -trimpath -ldflags \"{flags}\"{user_flags} -o ./build/{name} .",
                name = spec.name
            )
        }
        BuildKind::Rust { features } => {
            let feature_flag = if features.is_empty() {
                String::new()
            } else {
                format!(" --features {}", features.join(","))
            };
            let user_flags = join_flags(&spec.flags);
            format!(
                "mkdir -p ./build && {env_prefix}cargo build --locked --release{feature_flag}{user_flags} && cp target/release/{name} ./build/{name}",
                name = spec.name
            )
        }
        BuildKind::Dotnet {
            self_contained,
            project,
            ..
        } => {
            let project_arg = project.as_deref().unwrap_or(".");
            let contained = if *self_contained {
                " --self-contained"
            } else {
                ""
            };
            let user_flags = join_flags(&spec.flags);
            format!(
                "{env_prefix}dotnet publish {project_arg} -c Release --runtime {rid}{contained}{user_flags} -o ./build",
                rid = spec.target_arch.dotnet_runtime()
            )
        }
        BuildKind::C {} => {
            let user_flags = join_flags(&spec.flags);
            format!(
                "mkdir -p ./build && {env_prefix}cc{user_flags} -o ./build/{name} *.c",
                name = spec.name
            )
        }
        BuildKind::Script { shell } => {
            let user_flags = join_flags(&spec.flags);
            format!("{env_prefix}{shell} ./build.sh{user_flags}")
        }
    };
    Ok(format!(
        "mkosi-chroot bash -c {}",
        shell_quote(&format!("cd /build/{} && {inner}", spec.name))
    ))
}

fn join_flags(flags: &[String]) -> String {
    if flags.is_empty() {
        String::new()
    } else {
        format!(" {}", flags.join(" "))
    }
}
