// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Run record: steps, the report document and its on-disk store.

use crate::backend::PatchResult;
use crate::config::format_duration;
use crate::exec::{CommandError, CommandResult};
use crate::osinfo::HostIdentity;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;

/// `std::time::Duration` as integer nanoseconds.
pub mod duration_nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}

/// `end - start`, never negative.
fn elapsed(start: OffsetDateTime, end: OffsetDateTime) -> (OffsetDateTime, Duration) {
    let end = end.max(start);
    (end, (end - start).unsigned_abs())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Skipped => "skipped",
        })
    }
}

/// One external command in a run's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ended: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<CommandResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Step {
    /// Record a finished command started at `started`.
    pub fn record(
        name: &str,
        started: OffsetDateTime,
        outcome: &Result<CommandResult, CommandError>,
    ) -> Self {
        let (ended, _) = elapsed(started, OffsetDateTime::now_utc());
        let (result, error) = match outcome {
            Ok(result) => (Some(result.clone()), None),
            Err(e) => (e.result().cloned(), Some(e.to_string())),
        };
        Self {
            name: name.to_string(),
            started,
            ended,
            result,
            error,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub app: String,
    pub hostname: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ended: OffsetDateTime,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    pub status: Status,
    pub patched: bool,
    pub backend: String,
    pub reboot_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_reason: Option<String>,
    pub os: Option<HostIdentity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

impl Report {
    /// A fresh report, `failed` until the run proves otherwise.
    pub fn new(app: &str, hostname: &str) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            app: app.to_string(),
            hostname: hostname.to_string(),
            started: now,
            ended: now,
            duration: Duration::ZERO,
            status: Status::Failed,
            patched: false,
            backend: String::new(),
            reboot_required: false,
            reboot_reason: None,
            os: None,
            notes: Vec::new(),
            steps: Vec::new(),
            error: None,
            report_path: None,
        }
    }

    /// Stamp the end time and duration.
    pub fn finish(&mut self) {
        let (ended, duration) = elapsed(self.started, OffsetDateTime::now_utc());
        self.ended = ended;
        self.duration = duration;
    }

    /// Fold a backend outcome in. Steps are appended in order.
    pub fn absorb(&mut self, patch: PatchResult) {
        self.backend = patch.backend;
        if patch.os.is_some() {
            self.os = patch.os;
        }
        self.patched = patch.patched;
        self.reboot_required = patch.reboot_required;
        self.reboot_reason = patch.reboot_reason;
        self.notes.extend(patch.notes);
        self.steps.extend(patch.steps);
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Duration rounded to the nearest second, for people.
    pub fn whole_seconds(&self) -> Duration {
        Duration::from_secs(self.duration.as_secs_f64().round() as u64)
    }

    /// One-line outcome for interactive runs.
    pub fn summary(&self) -> String {
        format!(
            "status={} patched={} reboot_required={} duration={} report={}",
            self.status,
            self.patched,
            self.reboot_required,
            format_duration(self.whole_seconds()),
            self.report_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        )
    }

    /// `report_<hostname>_<YYYYMMDDTHHMMSSZ>.json`
    pub fn file_name(&self) -> String {
        let stamp = self
            .started
            .to_offset(time::UtcOffset::UTC)
            .format(format_description!(
                "[year][month][day]T[hour][minute][second]Z"
            ))
            .unwrap_or_else(|_| self.started.unix_timestamp().to_string());
        let host: String = self
            .hostname
            .chars()
            .map(|c| if c == '/' || c == '\0' { '_' } else { c })
            .collect();
        format!("report_{host}_{stamp}.json")
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to create report directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to write report {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to list report directory {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Directory of per-run JSON reports.
#[derive(Debug, Clone)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `report` and set its `report_path`.
    pub fn persist(&self, report: &mut Report) -> Result<PathBuf, ReportError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| ReportError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(report.file_name());
        report.report_path = Some(path.clone());
        let bytes = report.to_json()?;
        std::fs::write(&path, bytes).map_err(|source| ReportError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Remove regular files last modified more than `days` ago. Returns how
    /// many were removed. `days <= 0` keeps everything.
    pub fn purge_older_than(&self, days: i64) -> Result<usize, ReportError> {
        if days <= 0 {
            return Ok(0);
        }
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(ReportError::List {
                    path: self.dir.clone(),
                    source,
                });
            }
        };
        // A window too large to represent reaches back before any file.
        let Some(cutoff) = u64::try_from(days)
            .ok()
            .and_then(|d| d.checked_mul(24 * 60 * 60))
            .and_then(|secs| SystemTime::now().checked_sub(Duration::from_secs(secs)))
        else {
            return Ok(0);
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let Ok(modified) = meta.modified() else {
                continue;
            };
            if modified < cutoff {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => debug!("failed to remove {}: {e}", entry.path().display()),
                }
            }
        }
        Ok(removed)
    }
}
