// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Prefix applied to every host file location, for running against a
/// mounted image or a test fixture instead of `/`.
pub const HOST_ROOT_ENV: &str = "SERVERPATCHER_HOST_ROOT";

const FALLBACK_SEARCH_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Well-known files the engine reads on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPaths {
    pub os_release: PathBuf,
    pub reboot_required: PathBuf,
    pub reboot_required_pkgs: PathBuf,
    pub unattended_upgrade: PathBuf,
}

impl HostPaths {
    pub fn under(root: &Path) -> Self {
        Self {
            os_release: root.join("etc/os-release"),
            reboot_required: root.join("var/run/reboot-required"),
            reboot_required_pkgs: root.join("var/run/reboot-required.pkgs"),
            unattended_upgrade: root.join("usr/bin/unattended-upgrade"),
        }
    }
}

impl Default for HostPaths {
    fn default() -> Self {
        Self::under(Path::new("/"))
    }
}

/// Where executables are looked up and where host files live.
#[derive(Debug, Clone)]
pub struct HostEnv {
    search_path: OsString,
    pub paths: HostPaths,
}

impl HostEnv {
    pub fn new(search_path: impl Into<OsString>, paths: HostPaths) -> Self {
        Self {
            search_path: search_path.into(),
            paths,
        }
    }

    /// `PATH` and `SERVERPATCHER_HOST_ROOT` of the current process.
    pub fn from_process() -> Self {
        let search_path =
            std::env::var_os("PATH").unwrap_or_else(|| OsString::from(FALLBACK_SEARCH_PATH));
        let paths = std::env::var_os(HOST_ROOT_ENV)
            .map(|root| HostPaths::under(Path::new(&root)))
            .unwrap_or_default();
        Self::new(search_path, paths)
    }

    pub fn search_path(&self) -> &OsString {
        &self.search_path
    }

    /// Absolute path of an executable on the search path.
    pub fn find(&self, program: &str) -> Option<PathBuf> {
        which::which_in(program, Some(&self.search_path), "/").ok()
    }

    pub fn has(&self, program: &str) -> bool {
        self.find(program).is_some()
    }

    /// Absolute path when discoverable, otherwise the name unchanged so the
    /// spawn error names what was missing.
    pub fn resolve(&self, program: &str) -> String {
        self.find(program)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.to_string())
    }
}
