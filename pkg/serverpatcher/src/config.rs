// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! On-disk configuration and its validated form.
//!
//! The file is YAML (JSON is accepted as a subset). Every section and field
//! is optional; missing values take the defaults below. [`Config::validate`]
//! turns the raw document into [`Settings`], parsing durations, priorities
//! and addresses once so the rest of the crate never re-parses strings.

use crate::backend::PatchOptions;
use crate::notify::EmailSettings;
use crate::qos::{IoPriority, IoPriorityError};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{AddrParseError, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/serverpatcher/config.yaml";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub patching: PatchingConfig,
    pub email: EmailConfig,
    pub logging: LoggingConfig,
    pub report: ReportConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub interval: String,
    pub jitter: String,
    pub timeout: String,
    pub lock_file: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            interval: "24h".to_string(),
            jitter: "30m".to_string(),
            timeout: "2h".to_string(),
            lock_file: PathBuf::from("/var/lock/serverpatcher.lock"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchingConfig {
    pub dry_run: bool,
    pub security_only: bool,
    pub exclude_packages: Vec<String>,
    pub pre_hook: String,
    pub post_hook: String,
    /// none | notify | reboot
    pub reboot_policy: String,
    pub allow_kernel_updates: bool,
    pub package_timeout: String,
    pub command_nice: i32,
    /// best-effort:N | idle | realtime:N, empty to disable
    pub command_ionice: String,
}

impl Default for PatchingConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            security_only: false,
            exclude_packages: Vec::new(),
            pre_hook: String::new(),
            post_hook: String::new(),
            reboot_policy: "notify".to_string(),
            allow_kernel_updates: true,
            package_timeout: "90m".to_string(),
            command_nice: 10,
            command_ionice: "best-effort:7".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub from: String,
    pub to: Vec<String>,
    pub smtp_host: String,
    pub smtp_port: u32,
    pub username: String,
    /// Name of the environment variable holding the SMTP password.
    pub password_env: String,
    pub starttls: bool,
    pub subject_prefix: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            from: "serverpatcher@your-domain".to_string(),
            to: vec!["ops@your-domain".to_string()],
            smtp_host: "smtp.your-domain".to_string(),
            smtp_port: 587,
            username: String::new(),
            password_env: "SERVERPATCHER_EMAIL_PASSWORD".to_string(),
            starttls: true,
            subject_prefix: "[Server Patcher]".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: String,
    pub json: bool,
    pub also_stdout: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: "/var/log/serverpatcher/serverpatcher.log".to_string(),
            json: true,
            also_stdout: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub dir: PathBuf,
    pub retain_days: i64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/serverpatcher/reports"),
            retain_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "127.0.0.1:9109".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{field} invalid: {reason}")]
    Duration { field: &'static str, reason: String },
    #[error("invalid patching.reboot_policy: {0:?} (expected none|notify|reboot)")]
    RebootPolicy(String),
    #[error("invalid patching.command_ionice {value:?}: {source}")]
    IoPriority {
        value: String,
        #[source]
        source: IoPriorityError,
    },
    #[error("invalid health.listen {value:?}: {source}")]
    Listen {
        value: String,
        #[source]
        source: AddrParseError,
    },
    #[error("email.enabled=true requires email.from, email.to, and email.smtp_host")]
    EmailIncomplete,
    #[error("invalid email.smtp_port: {0}")]
    SmtpPort(u32),
    #[error("encode config: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootPolicy {
    /// Never reboot, never mention it.
    None,
    /// Log that a reboot is pending.
    Notify,
    /// Reboot the host after a successful, non-dry-run patch that needs it.
    Reboot,
}

impl FromStr for RebootPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(RebootPolicy::None),
            "notify" => Ok(RebootPolicy::Notify),
            "reboot" => Ok(RebootPolicy::Reboot),
            other => Err(ConfigError::RebootPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for RebootPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RebootPolicy::None => "none",
            RebootPolicy::Notify => "notify",
            RebootPolicy::Reboot => "reboot",
        })
    }
}

/// Fully parsed configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub interval: Duration,
    pub jitter: Duration,
    /// Bound on one whole run.
    pub run_timeout: Duration,
    pub lock_file: PathBuf,
    /// `patch.timeout` is the package-operation timeout.
    pub patch: PatchOptions,
    pub pre_hook: Option<String>,
    pub post_hook: Option<String>,
    pub reboot_policy: RebootPolicy,
    /// `None` when email is disabled.
    pub email: Option<EmailSettings>,
    pub log: sp_log::Config,
    pub report_dir: PathBuf,
    pub retain_days: i64,
    /// `None` when the health listener is disabled.
    pub health_listen: Option<SocketAddr>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document means "all defaults".
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Validate against the process environment.
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        self.validate_with(|name| std::env::var(name).ok())
    }

    /// Validate, resolving the SMTP password through `lookup_env`.
    pub fn validate_with<F>(&self, lookup_env: F) -> Result<Settings, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let interval = field_duration("server.interval", &self.server.interval)?;
        let jitter = field_duration("server.jitter", &self.server.jitter)?;
        let run_timeout = positive_duration("server.timeout", &self.server.timeout)?;
        let package_timeout =
            positive_duration("patching.package_timeout", &self.patching.package_timeout)?;

        let p = &self.patching;
        let reboot_policy = p.reboot_policy.trim().parse::<RebootPolicy>()?;
        let io_priority = match p.command_ionice.trim() {
            "" => None,
            value => Some(value.parse::<IoPriority>().map_err(|source| {
                ConfigError::IoPriority {
                    value: value.to_string(),
                    source,
                }
            })?),
        };

        let email = if self.email.enabled {
            Some(self.email_settings(&lookup_env)?)
        } else {
            None
        };

        let health_listen = if self.health.enabled {
            let value = self.health.listen.trim();
            Some(value.parse::<SocketAddr>().map_err(|source| ConfigError::Listen {
                value: value.to_string(),
                source,
            })?)
        } else {
            None
        };

        let l = &self.logging;
        let log = sp_log::Config {
            level: sp_log::parse_level(&l.level),
            file: non_empty(&l.file).map(PathBuf::from),
            format: if l.json {
                sp_log::Format::Json
            } else {
                sp_log::Format::Text
            },
            also_stdout: l.also_stdout,
        };

        debug!("configuration validated");
        Ok(Settings {
            interval,
            jitter,
            run_timeout,
            lock_file: self.server.lock_file.clone(),
            patch: PatchOptions {
                dry_run: p.dry_run,
                security_only: p.security_only,
                exclude_packages: p
                    .exclude_packages
                    .iter()
                    .filter_map(|s| non_empty(s))
                    .map(str::to_string)
                    .collect(),
                allow_kernel_updates: p.allow_kernel_updates,
                timeout: package_timeout,
                nice: p.command_nice,
                io_priority,
            },
            pre_hook: non_empty(&p.pre_hook).map(str::to_string),
            post_hook: non_empty(&p.post_hook).map(str::to_string),
            reboot_policy,
            email,
            log,
            report_dir: self.report.dir.clone(),
            retain_days: self.report.retain_days,
            health_listen,
        })
    }

    fn email_settings<F>(&self, lookup_env: &F) -> Result<EmailSettings, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let e = &self.email;
        let to: Vec<String> = e
            .to
            .iter()
            .filter_map(|s| non_empty(s))
            .map(str::to_string)
            .collect();
        if e.from.trim().is_empty() || to.is_empty() || e.smtp_host.trim().is_empty() {
            return Err(ConfigError::EmailIncomplete);
        }
        let smtp_port = u16::try_from(e.smtp_port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(ConfigError::SmtpPort(e.smtp_port))?;
        let password = non_empty(&e.password_env)
            .and_then(lookup_env)
            .unwrap_or_default();
        Ok(EmailSettings {
            from: e.from.trim().to_string(),
            to,
            smtp_host: e.smtp_host.trim().to_string(),
            smtp_port,
            username: e.username.clone(),
            password,
            starttls: e.starttls,
            subject_prefix: e.subject_prefix.clone(),
        })
    }
}

/// The default configuration as YAML, or as one line of JSON when `compact`.
pub fn default_document(compact: bool) -> Result<String, ConfigError> {
    let config = Config::default();
    if compact {
        serde_json::to_string(&config)
            .map(|s| s + "\n")
            .map_err(|e| ConfigError::Encode(e.to_string()))
    } else {
        serde_yaml::to_string(&config).map_err(|e| ConfigError::Encode(e.to_string()))
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

fn field_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).map_err(|reason| ConfigError::Duration { field, reason })
}

fn positive_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let d = field_duration(field, value)?;
    if d.is_zero() {
        return Err(ConfigError::Duration {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(d)
}

/// Parse durations such as `90m`, `1h30m`, `1.5h`, `45s` or `250ms`.
/// A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut rest = s;
    let mut nanos = 0f64;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(format!("invalid duration {input:?}"));
        }
        let (number, tail) = rest.split_at(num_len);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid number {number:?} in duration {input:?}"))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(format!("missing unit in duration {input:?}")),
            other => return Err(format!("unknown unit {other:?} in duration {input:?}")),
        };
        nanos += value * scale;
        rest = tail;
    }
    if !nanos.is_finite() || nanos > u64::MAX as f64 {
        return Err(format!("duration {input:?} out of range"));
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}

/// Render like `1h30m0s`, `45s` or `1.5s`. Sub-second values use the
/// `Debug` form (`250ms`).
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let frac = d.subsec_nanos();
    if total == 0 {
        return if frac == 0 {
            "0s".to_string()
        } else {
            format!("{d:?}")
        };
    }
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    let secs = if frac == 0 {
        format!("{s}s")
    } else {
        let digits = format!("{frac:09}");
        format!("{s}.{}s", digits.trim_end_matches('0'))
    };
    if h > 0 {
        format!("{h}h{m}m{secs}")
    } else if m > 0 {
        format!("{m}m{secs}")
    } else {
        secs
    }
}
