// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Privileged socket binding (spec §4.4 "Privileged bind + hand-off").
//! `main.c` does this via `dmn_add_pcall`/`dmn_pcall`: a function pointer
//! registered before `dmn_fork()` that the still-root parent half of the
//! daemon-supervisor process executes synchronously on request, so the
//! unprivileged child can ask for privileged socket binds without ever
//! holding the capability itself. We don't fork a second supervisor
//! process here (that's the OS-level daemonization machinery `dmn_init1`/
//! `dmn_fork` owns, and is mechanical compared to the bind-retry/hand-off
//! *policy*, which is what spec §4.4 actually specifies) — instead
//! `PrivilegedBinder` is the capability itself, called in-process, with a
//! real implementation that actually does the `SO_REUSEPORT` dance and a
//! `MockBinder` for driving hand-off scenarios in tests without root or
//! real listening sockets.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to bind {addr} ({proto}): {source}")]
    Bind {
        addr: SocketAddr,
        proto: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// One successfully bound listener.
pub enum BoundSocket {
    Udp(std::net::UdpSocket),
    Tcp(std::net::TcpListener),
}

/// The privileged-bind capability. `bind_all` is called once per attempt
/// (spec: soft first attempt, hard second attempt); a failure on any one
/// address fails the whole attempt, matching `socks_daemon_check_all`'s
/// all-or-nothing semantics in `main.c`.
pub trait PrivilegedBinder: Send + Sync {
    fn bind_all(&self, listen: &[SocketAddr]) -> Result<Vec<BoundSocket>, BindError>;
}

/// Binds real UDP and TCP sockets with `SO_REUSEPORT` (when the platform
/// supports it), so a new instance can bind the same port(s) a live
/// predecessor still holds.
#[derive(Default)]
pub struct RealBinder;

impl RealBinder {
    fn bind_udp(addr: SocketAddr) -> Result<std::net::UdpSocket, BindError> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|source| BindError::Bind { addr, proto: "udp", source })?;
        sock.set_reuse_address(true)
            .map_err(|source| BindError::Bind { addr, proto: "udp", source })?;
        let _ = sock.set_reuse_port(true);
        sock.bind(&addr.into())
            .map_err(|source| BindError::Bind { addr, proto: "udp", source })?;
        sock.set_nonblocking(true)
            .map_err(|source| BindError::Bind { addr, proto: "udp", source })?;
        Ok(sock.into())
    }

    fn bind_tcp(addr: SocketAddr) -> Result<std::net::TcpListener, BindError> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|source| BindError::Bind { addr, proto: "tcp", source })?;
        sock.set_reuse_address(true)
            .map_err(|source| BindError::Bind { addr, proto: "tcp", source })?;
        let _ = sock.set_reuse_port(true);
        sock.bind(&addr.into())
            .map_err(|source| BindError::Bind { addr, proto: "tcp", source })?;
        sock.listen(1024)
            .map_err(|source| BindError::Bind { addr, proto: "tcp", source })?;
        sock.set_nonblocking(true)
            .map_err(|source| BindError::Bind { addr, proto: "tcp", source })?;
        Ok(sock.into())
    }
}

impl PrivilegedBinder for RealBinder {
    fn bind_all(&self, listen: &[SocketAddr]) -> Result<Vec<BoundSocket>, BindError> {
        let mut out = Vec::with_capacity(listen.len() * 2);
        for &addr in listen {
            out.push(BoundSocket::Udp(Self::bind_udp(addr)?));
            out.push(BoundSocket::Tcp(Self::bind_tcp(addr)?));
        }
        Ok(out)
    }
}

/// A test double that never touches the requested addresses: it binds
/// each listener to an ephemeral loopback port instead, and can be told
/// to fail its next `bind_all` call to simulate the no-`SO_REUSEPORT`
/// soft-failure path (spec §8 scenario *E*/property 10).
pub struct MockBinder {
    pub fail_next: std::sync::atomic::AtomicBool,
}

impl Default for MockBinder {
    fn default() -> Self {
        Self { fail_next: std::sync::atomic::AtomicBool::new(false) }
    }
}

impl MockBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_call(&self) {
        self.fail_next.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

impl PrivilegedBinder for MockBinder {
    fn bind_all(&self, listen: &[SocketAddr]) -> Result<Vec<BoundSocket>, BindError> {
        if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
            let addr = listen.first().copied().unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
            return Err(BindError::Bind {
                addr,
                proto: "udp",
                source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
            });
        }
        let mut out = Vec::with_capacity(listen.len() * 2);
        for _ in listen {
            let udp = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind ephemeral udp");
            let tcp = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral tcp");
            udp.set_nonblocking(true).expect("set udp nonblocking");
            tcp.set_nonblocking(true).expect("set tcp nonblocking");
            out.push(BoundSocket::Udp(udp));
            out.push(BoundSocket::Tcp(tcp));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_binder_succeeds_by_default() {
        let binder = MockBinder::new();
        let addrs = vec!["127.0.0.1:5353".parse().unwrap()];
        let socks = binder.bind_all(&addrs).unwrap();
        assert_eq!(socks.len(), 2);
    }

    #[test]
    fn mock_binder_fails_once_when_armed() {
        let binder = MockBinder::new();
        binder.fail_next_call();
        let addrs = vec!["127.0.0.1:5353".parse().unwrap()];
        assert!(binder.bind_all(&addrs).is_err());
        // second attempt succeeds (mirrors the soft-then-hard retry policy)
        assert!(binder.bind_all(&addrs).is_ok());
    }
}
