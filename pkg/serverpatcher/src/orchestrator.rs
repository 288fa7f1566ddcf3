// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! One patch run from lock to report.
//!
//! Stages run in a fixed order: lock, purge old reports, detect the host,
//! select a backend, pre-hook, patch, post-hook. The first failing stage
//! records its error in the report, which is then finalized (persisted and
//! optionally emailed) like any other run. Only a successful run can
//! trigger the reboot policy.

use crate::backend::{self, NoBackendFound, PatchFailure};
use crate::config::{RebootPolicy, Settings};
use crate::context::RunContext;
use crate::exec::{self, CommandError, Invocation};
use crate::host::HostEnv;
use crate::lock::{LockError, RunLock};
use crate::notify::{self, MailError, Mailer, SmtpMailer};
use crate::osinfo::{self, DetectError};
use crate::report::{Report, ReportError, ReportStore, Status, Step};
use log::{debug, error, info, warn};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;

pub const APP_NAME: &str = "Server Patcher";

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error(transparent)]
    Report(#[from] ReportError),
    #[error("failed to send email report: {0}")]
    Mail(#[from] MailError),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    LockBusy(LockError),
    #[error(transparent)]
    Lock(LockError),
    #[error(transparent)]
    Detection(#[from] DetectError),
    #[error(transparent)]
    NoBackend(#[from] NoBackendFound),
    #[error("{stage} failed: {source}")]
    Hook {
        stage: &'static str,
        #[source]
        source: CommandError,
    },
    #[error(transparent)]
    Patch(#[from] PatchFailure),
    #[error(transparent)]
    Finalize(#[from] FinalizeError),
}

/// The finished report and, for anything but a clean run, why it failed.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: Report,
    pub error: Option<RunError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Orchestrator {
    settings: Settings,
    env: HostEnv,
    store: ReportStore,
    mailer: Option<Arc<dyn Mailer>>,
    hostname: String,
}

impl Orchestrator {
    /// Reports go out over SMTP when `settings.email` is set.
    pub fn new(settings: Settings, env: HostEnv) -> Self {
        let mailer = settings
            .email
            .clone()
            .map(|email| Arc::new(SmtpMailer::new(email)) as Arc<dyn Mailer>);
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|e| {
                warn!("failed to read hostname: {e}");
                String::new()
            });
        Self {
            store: ReportStore::new(&settings.report_dir),
            settings,
            env,
            mailer,
            hostname,
        }
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.mailer = Some(mailer);
        self
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = hostname.to_string();
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn run_once(&self, ctx: &RunContext) -> RunOutcome {
        let mut report = Report::new(APP_NAME, &self.hostname);

        let _lock = match RunLock::acquire(&self.settings.lock_file) {
            Ok(lock) => lock,
            Err(e @ LockError::Busy { .. }) => {
                report.status = Status::Skipped;
                return self.abort(report, RunError::LockBusy(e)).await;
            }
            Err(e) => return self.abort(report, RunError::Lock(e)).await,
        };

        match self.store.purge_older_than(self.settings.retain_days) {
            Ok(0) => {}
            Ok(removed) => info!("purged {removed} old report(s)"),
            Err(e) => debug!("report purge failed: {e}"),
        }

        let identity = match osinfo::detect(&self.env.paths.os_release) {
            Ok(identity) => identity,
            Err(e) => return self.abort(report, e.into()).await,
        };
        info!("detected host: {}", identity.display_name());
        let selected = backend::select(&identity, &self.env);
        report.os = Some(identity);
        let selected = match selected {
            Ok(selected) => selected,
            Err(e) => return self.abort(report, e.into()).await,
        };
        report.backend = selected.name().to_string();

        if let Some(hook) = &self.settings.pre_hook
            && let Err(e) = self.run_hook(ctx, &mut report, "pre_hook", hook).await
        {
            return self.abort(report, e).await;
        }

        match selected.patch(ctx, &self.settings.patch, &self.env).await {
            Ok(result) => report.absorb(result),
            Err(failure) => {
                report.absorb((*failure.partial).clone());
                return self.abort(report, failure.into()).await;
            }
        }

        if let Some(hook) = &self.settings.post_hook
            && let Err(e) = self.run_hook(ctx, &mut report, "post_hook", hook).await
        {
            return self.abort(report, e).await;
        }

        report.status = Status::Success;
        report.finish();
        if let Err(e) = self.finalize(&mut report).await {
            return RunOutcome {
                report,
                error: Some(e.into()),
            };
        }

        self.apply_reboot_policy(&report);
        RunOutcome {
            report,
            error: None,
        }
    }

    /// Record `error`, finalize and return. A finalize failure is only
    /// logged so the stage error is what the caller sees.
    async fn abort(&self, mut report: Report, error: RunError) -> RunOutcome {
        if report.status == Status::Skipped {
            warn!("run skipped: {error}");
        } else {
            error!("run aborted: {error}");
        }
        report.error = Some(error.to_string());
        report.finish();
        if let Err(e) = self.finalize(&mut report).await {
            error!("failed to finalize aborted run: {e}");
        }
        RunOutcome {
            report,
            error: Some(error),
        }
    }

    async fn run_hook(
        &self,
        ctx: &RunContext,
        report: &mut Report,
        stage: &'static str,
        hook: &str,
    ) -> Result<(), RunError> {
        info!("running {stage}: {hook}");
        let started = OffsetDateTime::now_utc();
        let outcome = exec::run(ctx, &Invocation::new(self.env.resolve(hook), Vec::new())).await;
        report.steps.push(Step::record(stage, started, &outcome));
        outcome
            .map(|_| ())
            .map_err(|source| RunError::Hook { stage, source })
    }

    /// Persist the report, then mail it when email is configured.
    async fn finalize(&self, report: &mut Report) -> Result<(), FinalizeError> {
        let path = self.store.persist(report).inspect_err(|e| {
            error!("failed to write report: {e}");
        })?;
        debug!("report written to {}", path.display());

        if let (Some(email), Some(mailer)) = (&self.settings.email, &self.mailer) {
            let notification = notify::compose(report, email)?;
            mailer.send(&notification).await.inspect_err(|e| {
                error!("failed to send email report: {e}");
            })?;
            info!("emailed report to {}", email.to.join(", "));
        }
        Ok(())
    }

    fn apply_reboot_policy(&self, report: &Report) {
        if !report.reboot_required {
            return;
        }
        match self.settings.reboot_policy {
            RebootPolicy::None => {}
            RebootPolicy::Notify => {
                info!(
                    "reboot required: {}",
                    report.reboot_reason.as_deref().unwrap_or("no reason given").trim()
                );
            }
            RebootPolicy::Reboot if self.settings.patch.dry_run => {
                info!("reboot required but skipped in dry-run mode");
            }
            RebootPolicy::Reboot => {
                warn!("reboot policy is reboot and reboot is required; attempting reboot");
                request_reboot(&self.env);
            }
        }
    }
}

/// Ask the service manager to reboot, falling back to `shutdown`. The
/// command is started and left running; its outcome is not awaited.
fn request_reboot(env: &HostEnv) {
    let (program, args): (_, &[&str]) = if let Some(systemctl) = env.find("systemctl") {
        (systemctl, &["reboot"])
    } else if let Some(shutdown) = env.find("shutdown") {
        (shutdown, &["-r", "now"])
    } else {
        error!("cannot reboot: neither systemctl nor shutdown found");
        return;
    };
    match tokio::process::Command::new(&program).args(args).spawn() {
        Ok(_) => info!("reboot requested via {}", program.display()),
        Err(e) => error!("failed to request reboot via {}: {e}", program.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil::{FakeHost, RecordingMailer, UBUNTU, write_script};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        host: FakeHost,
        state: tempfile::TempDir,
        settings: Settings,
    }

    impl Fixture {
        fn new(os_release: &str) -> Self {
            let host = FakeHost::new(os_release);
            let state = tempfile::tempdir().unwrap();
            let mut settings = Config::default().validate_with(|_| None).unwrap();
            settings.lock_file = state.path().join("serverpatcher.lock");
            settings.report_dir = state.path().join("reports");
            settings.patch.nice = 0;
            settings.patch.io_priority = None;
            Self {
                host,
                state,
                settings,
            }
        }

        fn orchestrator(&self) -> Orchestrator {
            Orchestrator::new(self.settings.clone(), self.host.env()).with_hostname("web-1")
        }

        fn reports(&self) -> Vec<PathBuf> {
            std::fs::read_dir(&self.settings.report_dir)
                .map(|d| d.map(|e| e.unwrap().path()).collect())
                .unwrap_or_default()
        }
    }

    fn ctx() -> RunContext {
        RunContext::new(Duration::from_secs(30), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_successful_dry_run() {
        let mut f = Fixture::new(UBUNTU);
        f.host.tool("apt-get", 0);
        f.settings.patch.dry_run = true;

        let outcome = f.orchestrator().run_once(&ctx()).await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        let report = outcome.report;
        assert_eq!(report.status, Status::Success);
        assert_eq!(report.app, "Server Patcher");
        assert_eq!(report.hostname, "web-1");
        assert_eq!(report.backend, "apt");
        assert!(report.patched);
        assert_eq!(report.os.as_ref().unwrap().id, "ubuntu");
        let names: Vec<&str> = report.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["apt_update", "apt_full_upgrade"]);
        assert!(report.ended >= report.started);

        let persisted = f.reports();
        assert_eq!(persisted.len(), 1);
        assert_eq!(report.report_path.as_ref(), Some(&persisted[0]));
        let on_disk: Report =
            serde_json::from_slice(&std::fs::read(&persisted[0]).unwrap()).unwrap();
        assert_eq!(on_disk.status, Status::Success);
        assert_eq!(on_disk.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_lock_held_elsewhere_skips_but_reports() {
        let f = Fixture::new(UBUNTU);
        f.host.tool("apt-get", 0);
        let _held = RunLock::acquire(&f.settings.lock_file).unwrap();

        let outcome = f.orchestrator().run_once(&ctx()).await;
        assert!(matches!(outcome.error, Some(RunError::LockBusy(LockError::Busy { .. }))));
        assert_eq!(outcome.report.status, Status::Skipped);
        assert!(outcome.report.error.is_some());
        assert!(f.host.calls("apt-get").is_empty());
        assert_eq!(f.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_unusable_lock_path_fails_instead_of_skipping() {
        let mut f = Fixture::new(UBUNTU);
        f.host.tool("apt-get", 0);
        let blocker = f.state.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        f.settings.lock_file = blocker.join("serverpatcher.lock");

        let outcome = f.orchestrator().run_once(&ctx()).await;
        assert!(matches!(outcome.error, Some(RunError::Lock(LockError::Open { .. }))));
        assert_eq!(outcome.report.status, Status::Failed);
        assert!(f.host.calls("apt-get").is_empty());
        assert_eq!(f.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_detection_failure() {
        let f = Fixture::new(UBUNTU);
        std::fs::remove_file(&f.host.env().paths.os_release).unwrap();

        let outcome = f.orchestrator().run_once(&ctx()).await;
        assert!(matches!(outcome.error, Some(RunError::Detection(_))));
        assert_eq!(outcome.report.status, Status::Failed);
        assert_eq!(f.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_no_backend_keeps_os() {
        let f = Fixture::new(UBUNTU);

        let outcome = f.orchestrator().run_once(&ctx()).await;
        let err = outcome.error.unwrap();
        assert!(matches!(err, RunError::NoBackend(_)));
        assert_eq!(
            err.to_string(),
            "no supported package manager detected for Ubuntu 24.04 LTS"
        );
        assert_eq!(outcome.report.status, Status::Failed);
        assert_eq!(outcome.report.os.as_ref().unwrap().id, "ubuntu");
        assert!(outcome.report.backend.is_empty());
    }

    #[tokio::test]
    async fn test_pre_hook_failure_stops_before_patching() {
        let mut f = Fixture::new(UBUNTU);
        f.host.tool("apt-get", 0);
        let hook = write_script(f.state.path(), "drain.sh", "echo draining\nexit 3");
        f.settings.pre_hook = Some(hook.to_string_lossy().into_owned());

        let outcome = f.orchestrator().run_once(&ctx()).await;
        assert!(matches!(
            outcome.error,
            Some(RunError::Hook {
                stage: "pre_hook",
                ..
            })
        ));
        let report = outcome.report;
        assert_eq!(report.status, Status::Failed);
        assert_eq!(report.backend, "apt");
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].name, "pre_hook");
        assert_eq!(report.steps[0].result.as_ref().unwrap().stdout, "draining");
        assert!(f.host.calls("apt-get").is_empty());
    }

    #[tokio::test]
    async fn test_hooks_wrap_the_patch() {
        let mut f = Fixture::new(UBUNTU);
        f.host.tool("apt-get", 0);
        let pre = write_script(f.state.path(), "pre.sh", "exit 0");
        let post = write_script(f.state.path(), "post.sh", "exit 0");
        f.settings.pre_hook = Some(pre.to_string_lossy().into_owned());
        f.settings.post_hook = Some(post.to_string_lossy().into_owned());

        let outcome = f.orchestrator().run_once(&ctx()).await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        let names: Vec<&str> = outcome.report.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["pre_hook", "apt_update", "apt_full_upgrade", "post_hook"]);
    }

    #[tokio::test]
    async fn test_patch_failure_keeps_partial_steps() {
        let f = Fixture::new(UBUNTU);
        f.host.tool("apt-get", 100);

        let outcome = f.orchestrator().run_once(&ctx()).await;
        assert!(matches!(outcome.error, Some(RunError::Patch(_))));
        let report = outcome.report;
        assert_eq!(report.status, Status::Failed);
        assert!(!report.patched);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].name, "apt_update");
        assert!(report.error.as_deref().unwrap().contains("exit=100"));
        assert_eq!(f.reports().len(), 1);
    }

    fn email_settings(to: &str) -> notify::EmailSettings {
        notify::EmailSettings {
            from: "patcher@example.com".to_string(),
            to: vec![to.to_string()],
            smtp_host: "smtp.example.com".to_string(),
            smtp_port: 25,
            username: String::new(),
            password: String::new(),
            starttls: false,
            subject_prefix: "[Server Patcher]".to_string(),
        }
    }

    #[tokio::test]
    async fn test_email_attaches_persisted_report() {
        let mut f = Fixture::new(UBUNTU);
        f.host.tool("apt-get", 0);
        f.settings.email = Some(email_settings("ops@example.com"));
        let mailer = Arc::new(RecordingMailer::default());

        let outcome = f
            .orchestrator()
            .with_mailer(mailer.clone())
            .run_once(&ctx())
            .await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        let sent = mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].subject,
            "[Server Patcher] web-1 - success (backend=apt reboot=false)"
        );
        let (name, _) = sent[0].attachment.as_ref().unwrap();
        let persisted = f.reports();
        assert_eq!(name, &*persisted[0].file_name().unwrap().to_string_lossy());
    }

    #[tokio::test]
    async fn test_email_failure_is_the_run_error() {
        let mut f = Fixture::new(UBUNTU);
        f.host.tool("apt-get", 0);
        f.settings.email = Some(email_settings("not an address"));

        let outcome = f
            .orchestrator()
            .with_mailer(Arc::new(RecordingMailer::default()))
            .run_once(&ctx())
            .await;
        assert!(matches!(
            outcome.error,
            Some(RunError::Finalize(FinalizeError::Mail(_)))
        ));
        assert_eq!(outcome.report.status, Status::Success);
        assert_eq!(f.reports().len(), 1);
    }

    async fn wait_for_calls(host: &FakeHost, name: &str) -> Vec<String> {
        for _ in 0..100 {
            let calls = host.calls(name);
            if !calls.is_empty() {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Vec::new()
    }

    #[tokio::test]
    async fn test_reboot_policy_reboots_after_real_run() {
        let mut f = Fixture::new(UBUNTU);
        f.host.tool("apt-get", 0);
        f.host.tool("systemctl", 0);
        std::fs::write(&f.host.env().paths.reboot_required, "").unwrap();
        f.settings.reboot_policy = RebootPolicy::Reboot;

        let outcome = f.orchestrator().run_once(&ctx()).await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert!(outcome.report.reboot_required);
        assert_eq!(wait_for_calls(&f.host, "systemctl").await, ["reboot"]);
    }

    #[tokio::test]
    async fn test_reboot_falls_back_to_shutdown() {
        let mut f = Fixture::new(UBUNTU);
        f.host.tool("apt-get", 0);
        f.host.tool("shutdown", 0);
        std::fs::write(&f.host.env().paths.reboot_required, "").unwrap();
        f.settings.reboot_policy = RebootPolicy::Reboot;

        f.orchestrator().run_once(&ctx()).await;
        assert_eq!(wait_for_calls(&f.host, "shutdown").await, ["-r now"]);
    }

    #[tokio::test]
    async fn test_no_reboot_in_dry_run_or_notify() {
        for (policy, dry_run) in [(RebootPolicy::Reboot, true), (RebootPolicy::Notify, false)] {
            let mut f = Fixture::new(UBUNTU);
            f.host.tool("apt-get", 0);
            f.host.tool("systemctl", 0);
            std::fs::write(&f.host.env().paths.reboot_required, "").unwrap();
            f.settings.reboot_policy = policy;
            f.settings.patch.dry_run = dry_run;

            let outcome = f.orchestrator().run_once(&ctx()).await;
            assert!(outcome.report.reboot_required);
            tokio::time::sleep(Duration::from_millis(200)).await;
            assert!(f.host.calls("systemctl").is_empty(), "{policy} dry_run={dry_run}");
        }
    }

    #[tokio::test]
    async fn test_purges_expired_reports() {
        let f = Fixture::new(UBUNTU);
        f.host.tool("apt-get", 0);
        std::fs::create_dir_all(&f.settings.report_dir).unwrap();
        let stale = f.settings.report_dir.join("report_web-1_20200101T000000Z.json");
        std::fs::write(&stale, "{}").unwrap();
        let file = std::fs::File::options().write(true).open(&stale).unwrap();
        file.set_modified(std::time::SystemTime::now() - Duration::from_secs(40 * 86_400))
            .unwrap();

        let outcome = f.orchestrator().run_once(&ctx()).await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert!(!stale.exists());
        assert_eq!(f.reports().len(), 1);
    }
}
