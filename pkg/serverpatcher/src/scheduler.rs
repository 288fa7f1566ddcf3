// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::format_duration;
use crate::context::RunContext;
use crate::health::HealthState;
use crate::orchestrator::{Orchestrator, RunOutcome};
use async_trait::async_trait;
use log::{error, info};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One complete patch cycle.
#[async_trait]
pub trait RunCycle: Send + Sync {
    async fn run_cycle(&self, ctx: &RunContext) -> RunOutcome;
}

#[async_trait]
impl RunCycle for Orchestrator {
    async fn run_cycle(&self, ctx: &RunContext) -> RunOutcome {
        self.run_once(ctx).await
    }
}

/// Sequential daemon loop: run, publish, sleep `interval` plus up to
/// `jitter`, repeat until cancelled.
pub struct Scheduler<C, R> {
    cycle: C,
    interval: Duration,
    jitter: Duration,
    run_timeout: Duration,
    health: Option<Arc<HealthState>>,
    rng: R,
}

impl<C: RunCycle, R: Rng + Send> Scheduler<C, R> {
    pub fn new(cycle: C, interval: Duration, jitter: Duration, run_timeout: Duration, rng: R) -> Self {
        Self {
            cycle,
            interval,
            jitter,
            run_timeout,
            health: None,
            rng,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    /// `interval + uniform(0, jitter)`.
    pub fn next_sleep(&mut self) -> Duration {
        let jitter = u64::try_from(self.jitter.as_nanos()).unwrap_or(u64::MAX);
        if jitter == 0 {
            return self.interval;
        }
        self.interval + Duration::from_nanos(self.rng.gen_range(0..jitter))
    }

    /// Returns the number of cycles run. A cycle in progress when `cancel`
    /// fires sees the cancellation through its context; no new cycle starts
    /// afterwards.
    pub async fn run(&mut self, cancel: CancellationToken) -> usize {
        info!(
            "starting service loop (interval={}, jitter={})",
            format_duration(self.interval),
            format_duration(self.jitter)
        );
        let mut cycles = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let ctx = RunContext::new(self.run_timeout, cancel.clone());
            let outcome = self.cycle.run_cycle(&ctx).await;
            cycles += 1;

            let report = &outcome.report;
            let path = report
                .report_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            info!(
                status:% = report.status,
                patched = report.patched,
                reboot_required = report.reboot_required,
                report = path.as_str();
                "run completed"
            );
            if let Some(e) = &outcome.error {
                error!("run failed: {e}");
            }
            if let Some(health) = &self.health {
                health.set_last(outcome.report);
            }

            let sleep = self.next_sleep();
            info!("sleeping until next run ({})", format_duration(sleep));
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        info!("service loop stopped");
        cycles
    }
}
