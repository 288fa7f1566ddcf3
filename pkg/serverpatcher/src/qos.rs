// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! CPU and IO priority prefixes for package-manager commands.

use crate::host::HostEnv;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const DEFAULT_IO_LEVEL: u8 = 7;
const MAX_IO_LEVEL: u8 = 7;

/// ionice scheduling class and level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoPriority {
    Idle,
    Realtime(u8),
    BestEffort(u8),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IoPriorityError {
    #[error("invalid io priority level '{0}'")]
    Level(String),
    #[error("io priority level {0} out of range 0-7")]
    Range(u8),
}

impl FromStr for IoPriority {
    type Err = IoPriorityError;

    /// Accepts `idle`, `realtime[:L]` and `best-effort[:L]`. Any other class
    /// token is treated as best-effort.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (class, level) = match s.trim().split_once(':') {
            Some((class, level)) => (class.trim(), Some(level.trim())),
            None => (s.trim(), None),
        };
        let level = match level {
            None | Some("") => DEFAULT_IO_LEVEL,
            Some(raw) => {
                let n: u8 = raw
                    .parse()
                    .map_err(|_| IoPriorityError::Level(raw.to_string()))?;
                if n > MAX_IO_LEVEL {
                    return Err(IoPriorityError::Range(n));
                }
                n
            }
        };
        Ok(match class.to_ascii_lowercase().as_str() {
            "idle" => IoPriority::Idle,
            "realtime" => IoPriority::Realtime(level),
            _ => IoPriority::BestEffort(level),
        })
    }
}

impl fmt::Display for IoPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoPriority::Idle => write!(f, "idle"),
            IoPriority::Realtime(level) => write!(f, "realtime:{level}"),
            IoPriority::BestEffort(level) => write!(f, "best-effort:{level}"),
        }
    }
}

impl IoPriority {
    fn ionice_args(&self) -> Vec<String> {
        match self {
            IoPriority::Idle => vec!["-c3".to_string()],
            IoPriority::Realtime(level) => {
                vec!["-c1".to_string(), "-n".to_string(), level.to_string()]
            }
            IoPriority::BestEffort(level) => {
                vec!["-c2".to_string(), "-n".to_string(), level.to_string()]
            }
        }
    }
}

/// Prefix `program args` with `nice` and `ionice` when they are available.
///
/// `nice` sits closest to the command, `ionice` outermost. A missing tool
/// leaves that layer out.
pub fn wrap(
    env: &HostEnv,
    program: &str,
    args: &[String],
    nice: i32,
    io_priority: Option<IoPriority>,
) -> (String, Vec<String>) {
    let mut program = program.to_string();
    let mut args = args.to_vec();

    if nice != 0
        && let Some(nice_bin) = env.find("nice")
    {
        let mut wrapped = vec!["-n".to_string(), nice.to_string(), program];
        wrapped.append(&mut args);
        program = nice_bin.to_string_lossy().into_owned();
        args = wrapped;
    }

    if let Some(priority) = io_priority
        && let Some(ionice_bin) = env.find("ionice")
    {
        let mut wrapped = priority.ionice_args();
        wrapped.push(program);
        wrapped.append(&mut args);
        program = ionice_bin.to_string_lossy().into_owned();
        args = wrapped;
    }

    (program, args)
}
