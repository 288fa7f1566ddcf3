// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::{PatchOptions, Session, argv};
use crate::exec::CommandError;

// zypper has no reboot-required probe here; security_only is not mapped.
pub(super) async fn patch(s: &mut Session<'_>) -> Result<(), CommandError> {
    let opts = s.opts;
    s.step(
        "zypper_refresh",
        argv(["--non-interactive", "--gpg-auto-import-keys", "refresh"]),
    )
    .await?;
    s.step("zypper_update", update_args(opts)).await?;
    s.mark_patched();
    Ok(())
}

fn update_args(opts: &PatchOptions) -> Vec<String> {
    let mut args = if opts.dry_run {
        argv(["--non-interactive", "--dry-run", "update"])
    } else {
        argv(["--non-interactive", "update"])
    };
    if !opts.allow_kernel_updates {
        args.extend(argv(["--exclude", "kernel*"]));
    }
    for pkg in &opts.exclude_packages {
        args.push("--exclude".to_string());
        args.push(pkg.clone());
    }
    args
}
