// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Pid-file acquisition and predecessor hand-off, ported from
//! `examples/original_source/gdnsd/main.c`'s `dmn_acquire_pidfile`/
//! `dmn_status`/`dmn_stop`/`dmn_signal` family. An exclusive `fcntl` lock
//! on the pid file (not just its presence) is the actual acquisition
//! mechanism, following the same "try_rw_lock, then someone else holds it"
//! idiom as `ddtelemetry/src/ipc/platform/unix/locks.rs`'s `FLock`, reworked
//! against raw `libc` (no `nix`) since that's the only Unix-surface crate
//! this daemon otherwise needs.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("failed to open pid file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read pid file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write pid file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("pid file {path} is locked by another running instance (pid {pid}) and it would not exit")]
    PredecessorWouldNotDie { path: PathBuf, pid: libc::pid_t },
}

/// How long to wait for a predecessor to exit after `SIGTERM` before giving
/// up (spec §4.4's "stop: ... SIGTERM until pid gone").
const KILL_WAIT: Duration = Duration::from_secs(5);
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// An exclusively-locked, open pid file. The lock (and therefore the
/// daemon's claim to be "the" running instance) is held for as long as
/// this value lives; it is never explicitly unlinked, only re-truncated
/// and re-written by the next instance that acquires it.
pub struct PidFile {
    file: File,
    path: PathBuf,
}

fn try_exclusive_lock(fd: i32) -> bool {
    let lock = libc::flock {
        l_type: libc::F_WRLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    // SAFETY: `fd` is a valid, open file descriptor for the duration of
    // this call and `lock` is a well-formed `flock` value.
    unsafe { libc::fcntl(fd, libc::F_SETLK, &lock) == 0 }
}

/// Sends signal 0 to check liveness without actually signaling; mirrors
/// the common `kill(pid, 0)` existence check used throughout `main.c`.
fn process_alive(pid: libc::pid_t) -> bool {
    // SAFETY: `kill` with signal 0 performs no action beyond existence and
    // permission checks.
    unsafe { libc::kill(pid, 0) == 0 }
}

fn read_pid(file: &mut File, path: &Path) -> Result<Option<libc::pid_t>, PidFileError> {
    file.seek(SeekFrom::Start(0))
        .map_err(|source| PidFileError::Read { path: path.to_path_buf(), source })?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)
        .map_err(|source| PidFileError::Read { path: path.to_path_buf(), source })?;
    Ok(buf.trim().parse::<libc::pid_t>().ok())
}

fn write_own_pid(file: &mut File, path: &Path) -> Result<(), PidFileError> {
    file.set_len(0)
        .map_err(|source| PidFileError::Write { path: path.to_path_buf(), source })?;
    file.seek(SeekFrom::Start(0))
        .map_err(|source| PidFileError::Write { path: path.to_path_buf(), source })?;
    // SAFETY: getpid() has no preconditions.
    let pid = unsafe { libc::getpid() };
    write!(file, "{pid}").map_err(|source| PidFileError::Write { path: path.to_path_buf(), source })?;
    file.flush()
        .map_err(|source| PidFileError::Write { path: path.to_path_buf(), source })
}

fn open_pidfile(path: &Path) -> Result<File, PidFileError> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| PidFileError::Open { path: path.to_path_buf(), source })
}

impl PidFile {
    /// Reads the pid file (if any) without locking it, returning the
    /// recorded pid only if that process is still alive. Used by the
    /// `status` action, which never wants to take the lock itself.
    pub fn status(path: &Path) -> Result<Option<libc::pid_t>, PidFileError> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PidFileError::Read { path: path.to_path_buf(), source }),
        };
        match read_pid(&mut file, path)? {
            Some(pid) if process_alive(pid) => Ok(Some(pid)),
            _ => Ok(None),
        }
    }

    /// Sends `sig` to whatever pid the file records, if that process is
    /// alive. Returns whether a live process was signaled.
    pub fn send_signal(path: &Path, sig: i32) -> Result<bool, PidFileError> {
        match Self::status(path)? {
            Some(pid) => {
                // SAFETY: pid came from a liveness-checked read of the pid file.
                unsafe { libc::kill(pid, sig) };
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The `stop` action: send `SIGTERM` and wait up to [`KILL_WAIT`] for
    /// the pid to stop responding to signal 0.
    pub fn stop(path: &Path) -> Result<bool, PidFileError> {
        let Some(pid) = Self::status(path)? else {
            return Ok(false);
        };
        // SAFETY: pid was just confirmed alive.
        unsafe { libc::kill(pid, libc::SIGTERM) };
        let deadline = Instant::now() + KILL_WAIT;
        while Instant::now() < deadline {
            if !process_alive(pid) {
                return Ok(true);
            }
            std::thread::sleep(KILL_POLL_INTERVAL);
        }
        Ok(!process_alive(pid))
    }

    /// Acquires the pid file exclusively, killing any predecessor that
    /// currently holds it and waiting for it to fully exit first. This is
    /// the only path that writes our own pid into the file.
    pub fn acquire(path: &Path) -> Result<Self, PidFileError> {
        let mut file = open_pidfile(path)?;
        if try_exclusive_lock(file.as_raw_fd()) {
            write_own_pid(&mut file, path)?;
            return Ok(PidFile { file, path: path.to_path_buf() });
        }

        // Someone else holds the lock; find out who and kill them.
        let predecessor = read_pid(&mut file, path)?;
        if let Some(pid) = predecessor {
            info!(pid, "killing predecessor instance");
            // SAFETY: see process_alive/kill usage above.
            unsafe { libc::kill(pid, libc::SIGTERM) };
            let deadline = Instant::now() + KILL_WAIT;
            while Instant::now() < deadline && process_alive(pid) {
                std::thread::sleep(KILL_POLL_INTERVAL);
            }
            if process_alive(pid) {
                return Err(PidFileError::PredecessorWouldNotDie { path: path.to_path_buf(), pid });
            }
        } else {
            warn!("pid file is locked but unreadable; waiting briefly for the lock to clear");
        }

        // Retry the lock now that the predecessor (should) be gone.
        let deadline = Instant::now() + KILL_WAIT;
        loop {
            if try_exclusive_lock(file.as_raw_fd()) {
                write_own_pid(&mut file, path)?;
                return Ok(PidFile { file, path: path.to_path_buf() });
            }
            if Instant::now() >= deadline {
                return Err(PidFileError::PredecessorWouldNotDie {
                    path: path.to_path_buf(),
                    pid: predecessor.unwrap_or(0),
                });
            }
            std::thread::sleep(KILL_POLL_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // The lock releases automatically on close; we deliberately leave
        // the file and its contents in place (mirrors dmn's behavior: the
        // next instance to start overwrites it, `status`/`stop` read it
        // right up until the process table agrees no one's home).
        let _ = self.file.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_own_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gdnsd.pid");
        let pf = PidFile::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), unsafe { libc::getpid() }.to_string());
        drop(pf);
    }

    #[test]
    fn status_none_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.pid");
        assert_eq!(PidFile::status(&path).unwrap(), None);
    }

    #[test]
    fn status_reports_self_when_acquired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gdnsd.pid");
        let _pf = PidFile::acquire(&path).unwrap();
        assert_eq!(PidFile::status(&path).unwrap(), Some(unsafe { libc::getpid() }));
    }

    #[test]
    fn status_ignores_stale_pid_of_dead_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gdnsd.pid");
        // a pid very unlikely to be alive and not locked by anyone
        std::fs::write(&path, "999999").unwrap();
        assert_eq!(PidFile::status(&path).unwrap(), None);
    }
}
