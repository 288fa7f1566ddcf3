// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::{PatchOptions, Session, argv};
use crate::exec::CommandError;

/// One `-Syu` step: pacman refreshes and upgrades in a single transaction,
/// and a split refresh would risk a partial upgrade.
pub(super) async fn patch(s: &mut Session<'_>) -> Result<(), CommandError> {
    let opts = s.opts;
    s.step("pacman_Syu", syu_args(opts)).await?;
    s.mark_patched();
    Ok(())
}

fn syu_args(opts: &PatchOptions) -> Vec<String> {
    if opts.dry_run {
        argv(["-Syu", "--noconfirm", "--print"])
    } else {
        argv(["-Syu", "--noconfirm"])
    }
}
