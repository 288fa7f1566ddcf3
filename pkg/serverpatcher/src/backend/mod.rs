// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Package-manager backends.
//!
//! Every backend follows the same shape: refresh metadata, apply upgrades,
//! then look for a reboot-required signal. The first failing refresh or
//! upgrade step ends the run; the steps executed so far travel with the
//! error in [`PatchFailure`].

mod apk;
mod apt;
mod pacman;
mod rpm;
mod zypper;

use crate::context::RunContext;
use crate::exec::{self, CommandError, CommandResult, Invocation};
use crate::host::HostEnv;
use crate::osinfo::{self, HostIdentity};
use crate::qos::{self, IoPriority};
use crate::report::Step;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

/// Per-run knobs handed to the selected backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOptions {
    pub dry_run: bool,
    pub security_only: bool,
    pub exclude_packages: BTreeSet<String>,
    pub allow_kernel_updates: bool,
    pub timeout: Duration,
    pub nice: i32,
    pub io_priority: Option<IoPriority>,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            security_only: false,
            exclude_packages: BTreeSet::new(),
            allow_kernel_updates: true,
            timeout: Duration::from_secs(90 * 60),
            nice: 10,
            io_priority: Some(IoPriority::BestEffort(7)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchResult {
    pub backend: String,
    pub os: Option<HostIdentity>,
    pub patched: bool,
    pub reboot_required: bool,
    pub reboot_reason: Option<String>,
    /// Advisory messages, e.g. options the backend could not enforce.
    pub notes: Vec<String>,
    pub steps: Vec<Step>,
}

/// A failed refresh or upgrade step, with everything recorded up to it.
#[derive(Debug, Error)]
#[error("{} patch failed: {source}", .partial.backend)]
pub struct PatchFailure {
    pub partial: Box<PatchResult>,
    #[source]
    pub source: CommandError,
}

#[derive(Debug, Error)]
#[error("no supported package manager detected for {0}")]
pub struct NoBackendFound(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    Apt,
    Dnf,
    Yum,
    Zypper,
    Pacman,
    Apk,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Backend {
    /// Selection priority. apt-get first: it is unambiguous on Debian hosts,
    /// while RPM hosts often carry both dnf and yum.
    pub const PROBE_ORDER: [Backend; 6] = [
        Backend::Apt,
        Backend::Dnf,
        Backend::Yum,
        Backend::Zypper,
        Backend::Pacman,
        Backend::Apk,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Apt => "apt",
            Backend::Dnf => "dnf",
            Backend::Yum => "yum",
            Backend::Zypper => "zypper",
            Backend::Pacman => "pacman",
            Backend::Apk => "apk",
        }
    }

    /// Executable probed for during selection and driven during a patch.
    pub fn executable(&self) -> &'static str {
        match self {
            Backend::Apt => "apt-get",
            Backend::Dnf => "dnf",
            Backend::Yum => "yum",
            Backend::Zypper => "zypper",
            Backend::Pacman => "pacman",
            Backend::Apk => "apk",
        }
    }

    /// Refresh, upgrade and check for a pending reboot, all within
    /// `opts.timeout` of `ctx`.
    pub async fn patch(
        &self,
        ctx: &RunContext,
        opts: &PatchOptions,
        env: &HostEnv,
    ) -> Result<PatchResult, PatchFailure> {
        info!("patching with {} (dry_run={})", self.name(), opts.dry_run);
        let mut session = Session::begin(*self, ctx, opts, env);
        let outcome = match self {
            Backend::Apt => apt::patch(&mut session).await,
            Backend::Dnf => rpm::patch(&mut session, rpm::Flavor::Dnf).await,
            Backend::Yum => rpm::patch(&mut session, rpm::Flavor::Yum).await,
            Backend::Zypper => zypper::patch(&mut session).await,
            Backend::Pacman => pacman::patch(&mut session).await,
            Backend::Apk => apk::patch(&mut session).await,
        };
        match outcome {
            Ok(()) => Ok(session.result),
            Err(source) => Err(PatchFailure {
                partial: Box::new(session.result),
                source,
            }),
        }
    }
}

/// First backend in [`Backend::PROBE_ORDER`] whose executable is on the
/// search path. `identity` only names the host in the error.
pub fn select(identity: &HostIdentity, env: &HostEnv) -> Result<Backend, NoBackendFound> {
    Backend::PROBE_ORDER
        .into_iter()
        .find(|backend| env.has(backend.executable()))
        .inspect(|backend| debug!("selected backend {backend}"))
        .ok_or_else(|| NoBackendFound(identity.display_name().to_string()))
}

/// State shared by the steps of one backend run.
struct Session<'a> {
    ctx: RunContext,
    opts: &'a PatchOptions,
    env: &'a HostEnv,
    program: String,
    extra_env: Vec<(String, String)>,
    result: PatchResult,
}

impl<'a> Session<'a> {
    fn begin(backend: Backend, ctx: &RunContext, opts: &'a PatchOptions, env: &'a HostEnv) -> Self {
        let os = match osinfo::detect(&env.paths.os_release) {
            Ok(identity) => Some(identity),
            Err(e) => {
                debug!("host re-detection failed: {e}");
                None
            }
        };
        Self {
            ctx: ctx.with_timeout(opts.timeout),
            opts,
            env,
            program: env.resolve(backend.executable()),
            extra_env: Vec::new(),
            result: PatchResult {
                backend: backend.name().to_string(),
                os,
                ..PatchResult::default()
            },
        }
    }

    fn set_env(&mut self, key: &str, value: &str) {
        self.extra_env.push((key.to_string(), value.to_string()));
    }

    fn note(&mut self, note: impl Into<String>) {
        self.result.notes.push(note.into());
    }

    fn mark_patched(&mut self) {
        self.result.patched = true;
    }

    fn require_reboot(&mut self, reason: impl Into<String>) {
        self.result.reboot_required = true;
        self.result.reboot_reason = Some(reason.into());
    }

    async fn invoke(
        &self,
        program: &str,
        args: &[String],
        with_qos: bool,
    ) -> Result<CommandResult, CommandError> {
        let (program, args) = if with_qos {
            qos::wrap(self.env, program, args, self.opts.nice, self.opts.io_priority)
        } else {
            (program.to_string(), args.to_vec())
        };
        let invocation = Invocation {
            program,
            args,
            env: self.extra_env.clone(),
        };
        exec::run(&self.ctx, &invocation).await
    }

    /// Run the backend's own executable as step `name`.
    async fn step(&mut self, name: &str, args: Vec<String>) -> Result<CommandResult, CommandError> {
        let program = self.program.clone();
        self.step_with(name, &program, args).await
    }

    /// Run `program` under QoS as step `name`.
    async fn step_with(
        &mut self,
        name: &str,
        program: &str,
        args: Vec<String>,
    ) -> Result<CommandResult, CommandError> {
        let started = OffsetDateTime::now_utc();
        let outcome = self.invoke(program, &args, true).await;
        self.result.steps.push(Step::record(name, started, &outcome));
        if let Err(e) = &outcome {
            warn!("step {name} failed: {e}");
        }
        outcome
    }
}

/// `Vec<String>` from string literals.
fn argv<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.into_iter().map(str::to_string).collect()
}
