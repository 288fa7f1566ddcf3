// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::context::RunContext;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long to keep reading output after the process is gone. Grandchildren
/// that inherited the pipes can otherwise hold them open indefinitely.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One external command to execute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Added to the inherited environment.
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }
}

/// Captured outcome of one process execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub args: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(with = "crate::report::duration_nanos")]
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command failed to start: {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command failed: {} {:?} (exit={})", .result.command, .result.args, .result.exit_code)]
    Exit { result: Box<CommandResult> },
    #[error("command timed out: {} {:?} after {:?}", .result.command, .result.args, .result.duration)]
    TimedOut { result: Box<CommandResult> },
    #[error("command cancelled: {} {:?}", .result.command, .result.args)]
    Cancelled { result: Box<CommandResult> },
    #[error("waiting for {}: {source}", .result.command)]
    Wait {
        result: Box<CommandResult>,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    /// Output captured before the failure. `None` when the process never started.
    pub fn result(&self) -> Option<&CommandResult> {
        match self {
            CommandError::Spawn { .. } => None,
            CommandError::Exit { result }
            | CommandError::TimedOut { result }
            | CommandError::Cancelled { result }
            | CommandError::Wait { result, .. } => Some(result),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Exit { result } => Some(result.exit_code),
            _ => None,
        }
    }
}

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Run one command to completion, its deadline, or cancellation, whichever
/// comes first. A process that outlives the context is killed.
pub async fn run(ctx: &RunContext, invocation: &Invocation) -> Result<CommandResult, CommandError> {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("running {} {:?}", invocation.program, invocation.args);
    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|source| CommandError::Spawn {
        command: invocation.program.clone(),
        source,
    })?;

    let stdout = Capture::start(child.stdout.take());
    let stderr = Capture::start(child.stderr.take());

    let ending = tokio::select! {
        status = child.wait() => Ending::Exited(status),
        _ = tokio::time::sleep_until(ctx.deadline()) => Ending::TimedOut,
        _ = ctx.cancelled() => Ending::Cancelled,
    };
    if !matches!(ending, Ending::Exited(_))
        && let Err(e) = child.kill().await
    {
        warn!("failed to kill {}: {e}", invocation.program);
    }

    let (stdout, stderr) = tokio::join!(stdout.finish(), stderr.finish());
    let mut result = Box::new(CommandResult {
        command: invocation.program.clone(),
        args: invocation.args.clone(),
        stdout,
        stderr,
        exit_code: -1,
        duration: started.elapsed(),
    });

    match ending {
        Ending::Exited(Ok(status)) => {
            result.exit_code = status.code().unwrap_or(-1);
            if status.success() {
                Ok(*result)
            } else {
                Err(CommandError::Exit { result })
            }
        }
        Ending::Exited(Err(source)) => Err(CommandError::Wait { result, source }),
        Ending::TimedOut => Err(CommandError::TimedOut { result }),
        Ending::Cancelled => Err(CommandError::Cancelled { result }),
    }
}

/// Background reader accumulating one pipe into a shared buffer, so partial
/// output survives a kill or an abandoned drain.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    fn start<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let task = reader.map(|mut reader| {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                loop {
                    match reader.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let (Ok(mut b), Some(data)) = (buf.lock(), chunk.get(..n)) {
                                b.extend_from_slice(data);
                            }
                        }
                    }
                }
            })
        });
        Self { buf, task }
    }

    async fn finish(mut self) -> String {
        if let Some(mut task) = self.task.take()
            && tokio::time::timeout(DRAIN_TIMEOUT, &mut task).await.is_err()
        {
            task.abort();
        }
        let bytes = self.buf.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}
