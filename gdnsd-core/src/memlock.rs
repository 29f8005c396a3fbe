// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Optional memory locking (spec §4.4 "Memory locking"), ported from
//! `main.c`'s `memlock_rlimits` + the `mlockall(MCL_CURRENT|MCL_FUTURE)`
//! call site. Raises `RLIMIT_MEMLOCK` before locking: to the hard limit
//! when not root (failing if that's still unreasonably low), to infinity
//! when root.

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum MemlockError {
    #[error("getrlimit(RLIMIT_MEMLOCK) failed: {0}")]
    GetRlimit(std::io::Error),
    #[error("setrlimit(RLIMIT_MEMLOCK) failed: {0}")]
    SetRlimit(std::io::Error),
    #[error(
        "not started as root, lock_mem was set, and the rlimit for locked memory is unreasonably low \
         ({0} bytes); disable lock_mem or raise the limit"
    )]
    LimitTooLow(u64),
    #[error("mlockall(MCL_CURRENT|MCL_FUTURE) failed: {0} (you may need to disable lock_mem if your system or ulimits do not allow it)")]
    Mlockall(std::io::Error),
}

/// Below this many locked bytes, a non-root process's rlimit is treated as
/// too low to bother trying (matches `main.c`'s `1048576`-byte floor).
const MIN_USEFUL_LIMIT: u64 = 1_048_576;

fn getrlimit_memlock() -> Result<libc::rlimit, MemlockError> {
    let mut rlim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
    // SAFETY: `rlim` is a valid, appropriately-sized out-param.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rlim) };
    if rc != 0 {
        return Err(MemlockError::GetRlimit(std::io::Error::last_os_error()));
    }
    Ok(rlim)
}

fn setrlimit_memlock(rlim: &libc::rlimit) -> Result<(), MemlockError> {
    // SAFETY: `rlim` is a valid, fully-initialized `rlimit`.
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, rlim) };
    if rc != 0 {
        return Err(MemlockError::SetRlimit(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Raises the locked-memory rlimit so that the subsequent `mlockall` call
/// has a chance of succeeding. `started_as_root` governs whether we raise
/// to the hard limit (non-root; the most we're allowed) or to infinity
/// (root; nothing stops us).
pub fn raise_rlimits(started_as_root: bool) -> Result<(), MemlockError> {
    let mut rlim = getrlimit_memlock()?;
    if rlim.rlim_cur == libc::RLIM_INFINITY {
        return Ok(());
    }

    if !started_as_root {
        if rlim.rlim_cur != rlim.rlim_max {
            rlim.rlim_cur = rlim.rlim_max;
            setrlimit_memlock(&rlim)?;
        }
        if rlim.rlim_cur < MIN_USEFUL_LIMIT {
            return Err(MemlockError::LimitTooLow(rlim.rlim_cur as u64));
        }
        info!(
            limit_mb = rlim.rlim_cur >> 20,
            "not started as root; locked-memory rlimit may be too small at runtime"
        );
    } else {
        rlim.rlim_max = libc::RLIM_INFINITY;
        setrlimit_memlock(&rlim)?;
        rlim.rlim_cur = libc::RLIM_INFINITY;
        setrlimit_memlock(&rlim)?;
    }
    Ok(())
}

/// Locks the process's current and future address space into RAM.
pub fn lock_all() -> Result<(), MemlockError> {
    // SAFETY: no preconditions beyond what the OS itself enforces
    // (typically `CAP_IPC_LOCK` or an adequate rlimit).
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc != 0 {
        return Err(MemlockError::Mlockall(std::io::Error::last_os_error()));
    }
    Ok(())
}
