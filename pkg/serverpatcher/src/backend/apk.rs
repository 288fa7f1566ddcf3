// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::{PatchOptions, Session, argv};
use crate::exec::CommandError;

pub(super) async fn patch(s: &mut Session<'_>) -> Result<(), CommandError> {
    let opts = s.opts;
    s.step("apk_update", argv(["update"])).await?;
    s.step("apk_upgrade", upgrade_args(opts)).await?;
    s.mark_patched();
    Ok(())
}

fn upgrade_args(opts: &PatchOptions) -> Vec<String> {
    if opts.dry_run {
        argv(["upgrade", "--available", "--simulate"])
    } else {
        argv(["upgrade", "--available"])
    }
}
