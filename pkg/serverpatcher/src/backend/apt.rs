// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::{PatchOptions, Session, argv};
use crate::exec::CommandError;
use crate::host::HostPaths;

const NOTE_SECURITY_UNSUPPORTED: &str =
    "security_only requested but unattended-upgrade is not installed; ran a full upgrade";
const NOTE_KERNEL: &str =
    "kernel updates disallowed by config; enforce via apt pin/hold if needed";

pub(super) async fn patch(s: &mut Session<'_>) -> Result<(), CommandError> {
    let opts = s.opts;
    let env = s.env;
    s.set_env("DEBIAN_FRONTEND", "noninteractive");

    s.step("apt_update", argv(["update"])).await?;

    let unattended = &env.paths.unattended_upgrade;
    if opts.security_only && unattended.is_file() {
        let program = unattended.to_string_lossy().into_owned();
        s.step_with("apt_unattended_upgrade", &program, unattended_args(opts))
            .await?;
    } else {
        for note in advisory_notes(opts) {
            s.note(note);
        }
        s.step("apt_full_upgrade", full_upgrade_args(opts)).await?;
    }
    s.mark_patched();

    if let Some(reason) = reboot_signal(&env.paths) {
        s.require_reboot(reason);
    }
    Ok(())
}

fn unattended_args(opts: &PatchOptions) -> Vec<String> {
    let mut args = argv(["-d"]);
    if opts.dry_run {
        args.push("--dry-run".to_string());
    }
    args
}

fn full_upgrade_args(opts: &PatchOptions) -> Vec<String> {
    let mut args = argv([
        "-y",
        "-o",
        "Dpkg::Options::=--force-confdef",
        "-o",
        "Dpkg::Options::=--force-confold",
    ]);
    if opts.dry_run {
        args.push("-s".to_string());
    }
    args.push("full-upgrade".to_string());
    args
}

/// Options apt cannot honour without pinning or holding packages, which
/// this tool does not do.
fn advisory_notes(opts: &PatchOptions) -> Vec<String> {
    let mut notes = Vec::new();
    if opts.security_only {
        notes.push(NOTE_SECURITY_UNSUPPORTED.to_string());
    }
    if !opts.exclude_packages.is_empty() {
        let names: Vec<&str> = opts.exclude_packages.iter().map(String::as_str).collect();
        notes.push(format!(
            "exclude_packages not enforced by apt (use apt-mark hold): {}",
            names.join(", ")
        ));
    }
    if !opts.allow_kernel_updates {
        notes.push(NOTE_KERNEL.to_string());
    }
    notes
}

/// Debian's reboot sentinel, with the package list as the reason when present.
fn reboot_signal(paths: &HostPaths) -> Option<String> {
    if !paths.reboot_required.exists() {
        return None;
    }
    let pkgs = std::fs::read_to_string(&paths.reboot_required_pkgs).unwrap_or_default();
    if pkgs.is_empty() {
        Some("reboot-required flag present".to_string())
    } else {
        Some(format!("packages: {pkgs}"))
    }
}
