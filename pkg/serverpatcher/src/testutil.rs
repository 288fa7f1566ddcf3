// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::host::{HostEnv, HostPaths};
use crate::notify::{MailError, Mailer, Notification, build_message};
use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Write an executable `/bin/sh` script named `name` into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n"))
        .unwrap_or_else(|e| panic!("failed to write {}: {e}", path.display()));
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .unwrap_or_else(|e| panic!("failed to chmod {}: {e}", path.display()));
    path
}

/// A fake package manager that appends its arguments to `<dir>/<name>.log`
/// and exits with `exit_code`.
pub fn write_recording_tool(dir: &Path, name: &str, exit_code: i32) -> PathBuf {
    let log = dir.join(format!("{name}.log"));
    write_script(
        dir,
        name,
        &format!("echo \"$@\" >> '{}'\necho \"{name} ran\"\nexit {exit_code}", log.display()),
    )
}

/// Lines recorded by [`write_recording_tool`], one per invocation.
pub fn recorded_calls(dir: &Path, name: &str) -> Vec<String> {
    std::fs::read_to_string(dir.join(format!("{name}.log")))
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// A host rooted in `root` whose only executables live in `bin`.
pub struct FakeHost {
    pub root: tempfile::TempDir,
    pub bin: tempfile::TempDir,
}

impl FakeHost {
    pub fn new(os_release: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("etc")).unwrap();
        std::fs::create_dir_all(root.path().join("var/run")).unwrap();
        std::fs::write(root.path().join("etc/os-release"), os_release).unwrap();
        Self { root, bin }
    }

    pub fn env(&self) -> HostEnv {
        HostEnv::new(self.bin.path(), HostPaths::under(self.root.path()))
    }

    pub fn tool(&self, name: &str, exit_code: i32) -> PathBuf {
        write_recording_tool(self.bin.path(), name, exit_code)
    }

    pub fn calls(&self, name: &str) -> Vec<String> {
        recorded_calls(self.bin.path(), name)
    }
}

pub const UBUNTU: &str = "NAME=\"Ubuntu\"\nID=ubuntu\nID_LIKE=debian\nVERSION_ID=\"24.04\"\nPRETTY_NAME=\"Ubuntu 24.04 LTS\"\n";
pub const FEDORA: &str = "NAME=\"Fedora Linux\"\nID=fedora\nVERSION_ID=40\nPRETTY_NAME=\"Fedora Linux 40\"\n";

/// Keeps every notification instead of delivering it. Messages are still
/// built, so an unparsable recipient fails like it would over SMTP.
#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, notification: &Notification) -> Result<(), MailError> {
        build_message(notification)?;
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
