// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Signal discipline (spec §4.4 "Signal discipline"), ported from
//! `main.c`'s `start_threads`/main-loop sequence: block every signal
//! before spawning worker threads so they inherit the all-blocked mask,
//! restore the main thread's mask afterward, then block only
//! `{SIGINT, SIGTERM, SIGHUP}` and wait on those synchronously. We use
//! `signal-hook`'s blocking iterator for the synchronous wait instead of
//! raw `sigwait(2)` (SPEC_FULL's ambient-stack rationale: it's the
//! idiomatic Rust equivalent the teacher pack already depends on `tokio`
//! alongside for this exact "some things are still blocking OS threads"
//! shape of problem), but still re-raises the terminating signal with its
//! default disposition restored, exactly as `main.c`'s `raise(killed_by)`
//! does, so a parent/supervisor sees the correct wait status.

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Blocks every signal on the calling (main) thread and returns the
/// previous mask, so that threads subsequently spawned with
/// `std::thread::spawn` (which inherit the calling thread's signal mask
/// on Linux) start with everything blocked.
pub fn block_all() -> libc::sigset_t {
    let mut full: libc::sigset_t = unsafe { std::mem::zeroed() };
    let mut prev: libc::sigset_t = unsafe { std::mem::zeroed() };
    // SAFETY: `full`/`prev` are valid, appropriately-sized sigset_t values.
    unsafe {
        libc::sigfillset(&mut full);
        libc::pthread_sigmask(libc::SIG_SETMASK, &full, &mut prev);
    }
    prev
}

/// Restores a previously-saved signal mask on the calling thread.
pub fn restore(prev: libc::sigset_t) {
    // SAFETY: `prev` came from a prior `block_all()` on this same thread.
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, &prev, std::ptr::null_mut());
    }
}

/// Runs the main thread's synchronous signal-wait loop until `SIGINT` or
/// `SIGTERM` arrives. `SIGHUP` is handled in place by invoking
/// `on_reload` and looping again; it never ends the wait. On exit,
/// cancels `cancel` (so every other thread's event loop unwinds) and
/// returns the signal number that ended the loop, after restoring that
/// signal's default disposition and re-raising it on this process so an
/// observing parent/supervisor sees the correct wait status.
pub fn run_main_loop(cancel: CancellationToken, mut on_reload: impl FnMut()) -> anyhow::Result<i32> {
    let mut signals = Signals::new([SIGHUP, SIGINT, SIGTERM])?;
    let mut forever = signals.forever();
    let killed_by = loop {
        let Some(sig) = forever.next() else {
            continue;
        };
        match sig {
            SIGHUP => {
                info!("received SIGHUP, reloading zone data in place");
                on_reload();
            }
            SIGTERM => {
                info!("received SIGTERM, exiting");
                break SIGTERM;
            }
            SIGINT => {
                info!("received SIGINT, exiting");
                break SIGINT;
            }
            _ => unreachable!("only registered for HUP/INT/TERM"),
        }
    };

    cancel.cancel();

    // SAFETY: restoring default disposition and re-raising a signal this
    // process is already permitted to handle.
    unsafe {
        libc::signal(killed_by, libc::SIG_DFL);
        libc::raise(killed_by);
    }

    Ok(killed_by)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_all_and_restore_round_trips() {
        let prev = block_all();
        restore(prev);
    }
}
