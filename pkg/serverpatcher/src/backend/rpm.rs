// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! dnf and yum. They differ only in verbs and step names.

use super::{PatchOptions, Session, argv};
use crate::exec::CommandError;
use crate::report::Step;
use log::{info, warn};
use time::OffsetDateTime;

const NEEDS_RESTARTING: &str = "needs-restarting";
const REBOOT_REASON: &str = "needs-restarting indicates reboot required";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Flavor {
    Dnf,
    Yum,
}

impl Flavor {
    fn prefix(self) -> &'static str {
        match self {
            Flavor::Dnf => "dnf",
            Flavor::Yum => "yum",
        }
    }

    fn upgrade_step(self) -> &'static str {
        match self {
            Flavor::Dnf => "dnf_upgrade",
            Flavor::Yum => "yum_update",
        }
    }
}

pub(super) async fn patch(s: &mut Session<'_>, flavor: Flavor) -> Result<(), CommandError> {
    let opts = s.opts;
    let prefix = flavor.prefix();

    s.step(&format!("{prefix}_makecache"), refresh_args(flavor))
        .await?;
    s.step(flavor.upgrade_step(), upgrade_args(flavor, opts))
        .await?;
    s.mark_patched();

    check_reboot(s, &format!("{prefix}_needs_restarting")).await;
    Ok(())
}

fn refresh_args(flavor: Flavor) -> Vec<String> {
    match flavor {
        Flavor::Dnf => argv(["-y", "makecache", "--refresh"]),
        Flavor::Yum => argv(["-y", "makecache"]),
    }
}

fn upgrade_args(flavor: Flavor, opts: &PatchOptions) -> Vec<String> {
    let mut args = match flavor {
        Flavor::Dnf => argv(["-y", "upgrade"]),
        Flavor::Yum => argv(["-y", "update"]),
    };
    if opts.security_only {
        args.push("--security".to_string());
    }
    if flavor == Flavor::Dnf {
        args.push("--refresh".to_string());
    }
    if opts.dry_run {
        args.push("--assumeno".to_string());
    }
    if !opts.allow_kernel_updates {
        args.push("--exclude=kernel*".to_string());
    }
    args.extend(opts.exclude_packages.iter().map(|p| format!("--exclude={p}")));
    args
}

/// `needs-restarting -r` exits 1 when a reboot is needed. Any other failure
/// stays on the step and never fails the patch.
async fn check_reboot(s: &mut Session<'_>, step_name: &str) {
    let Some(tool) = s.env.find(NEEDS_RESTARTING) else {
        return;
    };
    let tool = tool.to_string_lossy().into_owned();
    let started = OffsetDateTime::now_utc();
    let outcome = s.invoke(&tool, &argv(["-r"]), false).await;
    let mut step = Step::record(step_name, started, &outcome);

    match &outcome {
        Ok(_) => {}
        Err(e) if e.exit_code() == Some(1) => {
            info!("{NEEDS_RESTARTING} reports a pending reboot");
            step.error = None;
            s.require_reboot(REBOOT_REASON);
        }
        Err(e) => warn!("reboot check failed: {e}"),
    }
    s.result.steps.push(step);
}
