// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("could not acquire lock {path} (is another run active?)")]
    Busy { path: PathBuf },
    #[error("failed to open lock file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to lock {path}: {source}")]
    Flock {
        path: PathBuf,
        #[source]
        source: Errno,
    },
}

/// Exclusive advisory lock on a file, held until dropped.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    _file: Flock<File>,
}

impl RunLock {
    /// Take the lock without waiting. A holder in this or any other process
    /// yields [`LockError::Busy`].
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let open_err = |source| LockError::Open {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(open_err)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(open_err)?;

        let mut locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, Errno::EWOULDBLOCK)) => {
                return Err(LockError::Busy {
                    path: path.to_path_buf(),
                });
            }
            Err((_, source)) => {
                return Err(LockError::Flock {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        // Holder pid, for operators only.
        if locked.set_len(0).is_ok() {
            let _ = write!(locked, "{}", std::process::id());
        }

        Ok(Self {
            path: path.to_path_buf(),
            _file: locked,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
