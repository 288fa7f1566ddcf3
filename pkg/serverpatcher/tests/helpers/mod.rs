// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![allow(dead_code)]

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub const UBUNTU: &str = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"24.04\"\nPRETTY_NAME=\"Ubuntu 24.04 LTS\"\n";

/// A throwaway host: an os-release under `root`, package managers in `bin`,
/// and lock, reports and logs under `state`.
pub struct FakeSystem {
    pub root: tempfile::TempDir,
    pub bin: tempfile::TempDir,
    pub state: tempfile::TempDir,
}

impl FakeSystem {
    pub fn new(os_release: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("etc")).unwrap();
        std::fs::create_dir_all(root.path().join("var/run")).unwrap();
        std::fs::write(root.path().join("etc/os-release"), os_release).unwrap();
        Self { root, bin, state }
    }

    /// A package manager that records its arguments and exits with `code`.
    pub fn tool(&self, name: &str, code: i32) {
        let path = self.bin.path().join(name);
        let log = self.bin.path().join(format!("{name}.log"));
        std::fs::write(
            &path,
            format!(
                "#!/bin/sh\necho \"$@\" >> '{}'\necho \"{name} ran\"\nexit {code}\n",
                log.display()
            ),
        )
        .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    pub fn calls(&self, name: &str) -> Vec<String> {
        std::fs::read_to_string(self.bin.path().join(format!("{name}.log")))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn lock_file(&self) -> PathBuf {
        self.state.path().join("serverpatcher.lock")
    }

    pub fn report_dir(&self) -> PathBuf {
        self.state.path().join("reports")
    }

    pub fn reports(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.report_dir())
            .map(|d| d.map(|e| e.unwrap().path()).collect())
            .unwrap_or_default()
    }

    /// Write a config pointing every path into the sandbox, followed by
    /// `patching` and any extra top-level sections.
    pub fn write_config(&self, patching: &str, extra: &str) -> PathBuf {
        let path = self.state.path().join("config.yaml");
        let yaml = format!(
            "server:\n  interval: 1h\n  jitter: \"0\"\n  timeout: 1m\n  lock_file: {lock}\n\
             patching:\n  package_timeout: 30s\n  command_nice: 0\n  command_ionice: \"\"\n{patching}\
             logging:\n  file: {log}\n  level: debug\n\
             report:\n  dir: {reports}\n{extra}",
            lock = self.lock_file().display(),
            log = self.state.path().join("serverpatcher.log").display(),
            reports = self.report_dir().display(),
        );
        std::fs::write(&path, yaml)
            .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
        path
    }

    /// The binary with `PATH` limited to the fake tools and the host rooted
    /// in the sandbox.
    pub fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_serverpatcher"));
        cmd.args(args)
            .env("PATH", self.bin.path())
            .env("SERVERPATCHER_HOST_ROOT", self.root.path())
            .env_remove("SERVERPATCHER_EMAIL_PASSWORD");
        cmd
    }

    pub fn run(&self, args: &[&str]) -> Output {
        let output = self
            .command(args)
            .output()
            .expect("failed to run serverpatcher");
        eprintln!("[stdout] {}", String::from_utf8_lossy(&output.stdout));
        eprintln!("[stderr] {}", String::from_utf8_lossy(&output.stderr));
        output
    }
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// A free TCP port on localhost. Racy, but good enough for tests.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Handle to a running `serverpatcher daemon`.
pub struct DaemonHandle {
    child: Child,
    log_lines: Arc<Mutex<Vec<String>>>,
    _reader_thread: std::thread::JoinHandle<()>,
}

impl DaemonHandle {
    pub fn start(system: &FakeSystem, config: &Path) -> Self {
        let mut child = system
            .command(&["daemon", "--config", &config.to_string_lossy(), "--verbose"])
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .expect("failed to start serverpatcher daemon");

        let stdout = child.stdout.take().expect("failed to capture stdout");
        let log_lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let lines = Arc::clone(&log_lines);
        let reader_thread = std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(l) => {
                        eprintln!("[daemon] {l}");
                        lines.lock().unwrap().push(l);
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            child,
            log_lines,
            _reader_thread: reader_thread,
        }
    }

    /// Wait until a log line containing `pattern` appears, or timeout.
    pub fn wait_for_log(&self, pattern: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .log_lines
                .lock()
                .unwrap()
                .iter()
                .any(|l| l.contains(pattern))
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn send_signal(&self, sig: Signal) {
        let pid = self.child.id() as i32;
        signal::kill(Pid::from_raw(pid), sig).expect("failed to signal daemon");
    }

    /// Send SIGTERM and wait for the daemon to exit.
    pub fn stop(&mut self) -> std::process::ExitStatus {
        self.send_signal(Signal::SIGTERM);
        let deadline = Instant::now() + DEFAULT_TIMEOUT;
        loop {
            match self.child.try_wait().expect("failed to check daemon status") {
                Some(status) => return status,
                None if Instant::now() >= deadline => {
                    self.child.kill().ok();
                    return self.child.wait().expect("failed to wait on killed daemon");
                }
                None => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
