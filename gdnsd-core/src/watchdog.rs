// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! `sd_notify`-style watchdog pings (spec §4.4 "Watchdog"), read off the
//! same two env vars systemd sets for any supervised unit
//! (`WATCHDOG_USEC`, `NOTIFY_SOCKET`), and sent as the literal
//! `WATCHDOG=1` datagram systemd's own `sd_notify()` would send — no
//! `libsystemd`/`sd-notify` crate dependency needed for one fire-and-forget
//! datagram, matching spec §9's general preference for doing the minimal
//! thing over pulling in a whole client library for a one-line protocol.

use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::Duration;

/// Parses `WATCHDOG_USEC`/`NOTIFY_SOCKET` out of the process environment.
/// Returns `None` when the daemon isn't running under watchdog
/// supervision at all (the common case).
pub fn ping_interval_from_env() -> Option<(Duration, PathBuf)> {
    let usec: u64 = std::env::var("WATCHDOG_USEC").ok()?.parse().ok()?;
    let sock_path = std::env::var("NOTIFY_SOCKET").ok()?;
    let sock_path = if let Some(abstract_name) = sock_path.strip_prefix('@') {
        PathBuf::from(format!("\0{abstract_name}"))
    } else {
        PathBuf::from(sock_path)
    };
    Some((Duration::from_micros(usec), sock_path))
}

/// Sends one `WATCHDOG=1` keepalive datagram. Errors are non-fatal by
/// design (a missed ping just risks the supervisor restarting us, which
/// is the supervisor's call to make, not ours).
pub fn ping(notify_socket: &PathBuf) {
    let Ok(sock) = UnixDatagram::unbound() else { return };
    let _ = sock.send_to(b"WATCHDOG=1", notify_socket);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_to_nonexistent_socket_does_not_panic() {
        ping(&PathBuf::from("/tmp/gdnsd-test-notify-socket-that-does-not-exist"));
    }

    #[test]
    fn interval_parse_roundtrips_abstract_socket() {
        std::env::set_var("WATCHDOG_USEC", "5000000");
        std::env::set_var("NOTIFY_SOCKET", "@gdnsd-test");
        let (dur, path) = ping_interval_from_env().unwrap();
        assert_eq!(dur, Duration::from_secs(5));
        assert_eq!(path.as_os_str().to_str().unwrap().as_bytes()[0], 0);
        std::env::remove_var("WATCHDOG_USEC");
        std::env::remove_var("NOTIFY_SOCKET");
    }
}
