// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! The action dispatcher, ported from `main.c`'s `main()`: turns a parsed
//! [`Action`] plus a loaded [`DaemonConfig`] into whichever of checkconf,
//! start, stop, reload, restart, condrestart, or status actually runs,
//! including the privileged-bind-with-predecessor-handoff sequence and the
//! thread orchestration a live `start`/`restart` needs.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gdnsd_plugin_extmon::ExtmonRuntime;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{Action, Flags};
use crate::config::{ConfigError, DaemonConfig};
use crate::dns_io::{self, NullHandler, QueryHandler};
use crate::memlock::{self, MemlockError};
use crate::pidfile::{PidFile, PidFileError};
use crate::plugins::{self, PluginLoadError};
use crate::privsock::{BindError, BoundSocket, PrivilegedBinder, RealBinder};
use crate::signals;
use crate::stats::{self, source_from_monitors};
use crate::zone::{self, ZoneHandle, ZoneSource, ZoneTree};

/// The compiled-in default path to the extmon helper binary; overridable
/// per-instance via `plugins.extmon.helper_path`.
const DEFAULT_EXTMON_HELPER: &str = "/usr/libexec/gdnsd/gdnsd_extmon_helper";

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    PidFile(#[from] PidFileError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Memlock(#[from] MemlockError),
    #[error(transparent)]
    PluginLoad(#[from] PluginLoadError),
    #[error("daemon is not running")]
    NotRunning,
    #[error("predecessor did not stop in time")]
    StopFailed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Process exit codes, per `main.c`'s convention and spec §6: `0` success,
/// `1` a requested stop/condition failed, `3` status reports "not
/// running", anything else unhandled is a fatal startup error.
pub fn exit_code(action: Action, result: &Result<(), DaemonError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(DaemonError::NotRunning) if action == Action::Status => 3,
        Err(DaemonError::StopFailed) => 1,
        Err(_) => 1,
    }
}

/// Runs whichever action `args.action` names against `config`, blocking
/// until that action (and, for `start`/`restart`, the whole daemon
/// lifetime) completes.
pub fn run(config_dir: &Path, flags: &Flags, action: Action) -> Result<(), DaemonError> {
    let mut config = crate::config::load(config_dir)?;

    match action {
        Action::CheckConfig => check_config(&mut config),
        Action::Status => status(&config),
        Action::Stop => stop(&config),
        Action::Reload => reload(&config),
        Action::CondRestart => cond_restart(config_dir, flags, &config),
        Action::Start | Action::Restart => start(&mut config, flags),
    }
}

fn check_config(config: &mut DaemonConfig) -> Result<(), DaemonError> {
    let _loaded = plugins::load(config, PathBuf::from(DEFAULT_EXTMON_HELPER))?;
    info!("configuration is valid");
    Ok(())
}

fn status(config: &DaemonConfig) -> Result<(), DaemonError> {
    match PidFile::status(&config.pidfile_path())? {
        Some(pid) => {
            info!(pid, "gdnsdd is running");
            Ok(())
        }
        None => Err(DaemonError::NotRunning),
    }
}

fn stop(config: &DaemonConfig) -> Result<(), DaemonError> {
    if PidFile::stop(&config.pidfile_path())? {
        info!("gdnsdd stopped");
        Ok(())
    } else {
        warn!("predecessor did not exit within the timeout");
        Err(DaemonError::StopFailed)
    }
}

fn reload(config: &DaemonConfig) -> Result<(), DaemonError> {
    if PidFile::send_signal(&config.pidfile_path(), libc::SIGHUP)? {
        info!("sent SIGHUP for zone data reload");
        Ok(())
    } else {
        Err(DaemonError::NotRunning)
    }
}

fn cond_restart(config_dir: &Path, flags: &Flags, config: &DaemonConfig) -> Result<(), DaemonError> {
    if PidFile::status(&config.pidfile_path())?.is_none() {
        info!("not currently running, condrestart is a no-op");
        return Ok(());
    }
    let mut config = crate::config::load(config_dir)?;
    start(&mut config, flags)
}

fn parse_listen_addrs(config: &DaemonConfig) -> Result<Vec<SocketAddr>, DaemonError> {
    let mut out = Vec::with_capacity(config.listen.len());
    for s in &config.listen {
        let addr: SocketAddr = s
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid listen address '{s}'"))?;
        out.push(addr);
    }
    Ok(out)
}

/// Performs the privileged bind with predecessor hand-off (spec §4.4,
/// §8 scenario *E*): a first ("soft") attempt is made without touching
/// any predecessor; if that fails (most commonly `AddrInUse` from a still-
/// live predecessor holding the port without `SO_REUSEPORT`), the
/// predecessor is killed via [`PidFile::acquire`] and a second ("hard")
/// attempt is made, which is allowed to fail for good.
fn bind_with_handoff(
    binder: &dyn PrivilegedBinder,
    listen: &[SocketAddr],
    pidfile_path: &Path,
) -> Result<(Vec<BoundSocket>, PidFile), DaemonError> {
    match binder.bind_all(listen) {
        Ok(socks) => {
            // first attempt succeeded; the predecessor (if any) may still be
            // holding the pid file lock, so acquiring it now may still kill
            // it, but only after we're already listening ourselves.
            let pidfile = PidFile::acquire(pidfile_path)?;
            Ok((socks, pidfile))
        }
        Err(soft_err) => {
            warn!(error = %soft_err, "soft bind attempt failed, taking over any predecessor");
            let pidfile = PidFile::acquire(pidfile_path)?;
            let socks = binder.bind_all(listen)?;
            Ok((socks, pidfile))
        }
    }
}

fn split_bound_sockets(socks: Vec<BoundSocket>) -> (Vec<std::net::UdpSocket>, Vec<std::net::TcpListener>) {
    let mut udp = Vec::new();
    let mut tcp = Vec::new();
    for s in socks {
        match s {
            BoundSocket::Udp(u) => udp.push(u),
            BoundSocket::Tcp(t) => tcp.push(t),
        }
    }
    (udp, tcp)
}

/// The `start`/`restart` action: binds privileged sockets (taking over a
/// live predecessor if needed), loads plugins, locks memory if configured,
/// then spawns one OS thread per DNS I/O listener plus the zone-data,
/// monitor/stats, and (if a watchdog is present) watchdog threads, each
/// blocking its own single-threaded `tokio` runtime — mirroring `main.c`'s
/// `start_threads()` one-reactor-per-thread model. Blocks until `SIGINT`/
/// `SIGTERM` on the main thread's synchronous signal-wait loop.
fn start(config: &mut DaemonConfig, flags: &Flags) -> Result<(), DaemonError> {
    let listen = parse_listen_addrs(config)?;
    let started_as_root = unsafe { libc::geteuid() } == 0;

    let binder = RealBinder;
    let (socks, pidfile) = bind_with_handoff(&binder, &listen, &config.pidfile_path())?;
    let (udp_socks, tcp_socks) = split_bound_sockets(socks);

    if config.lock_mem {
        memlock::raise_rlimits(started_as_root)?;
        memlock::lock_all()?;
    }

    let loaded = plugins::load(config, PathBuf::from(DEFAULT_EXTMON_HELPER))?;
    info!(
        udp_listeners = udp_socks.len(),
        tcp_listeners = tcp_socks.len(),
        monitors = loaded.monitors.len(),
        "startup complete, entering service"
    );

    if flags.foreground {
        info!("running in foreground (-f)");
    }

    let cancel = CancellationToken::new();
    let handler: Arc<dyn QueryHandler> = Arc::new(NullHandler);
    let zone_tree = zone::initial_load(&NoZones);
    let zone_handle = ZoneHandle::new(zone_tree);
    let (rescan_tx, rescan_rx) = tokio::sync::mpsc::unbounded_channel();

    // everything after this point runs with every signal blocked, so the
    // worker threads we're about to spawn inherit an all-blocked mask and
    // only the main thread ever observes SIGHUP/SIGINT/SIGTERM.
    let prev_mask = signals::block_all();

    let mut join_handles = Vec::new();
    let mut num_udp_reactors = 0usize;
    let mut num_tcp_reactors = 0usize;

    // each bound socket gets `num_udp_threads`/`num_tcp_threads` independent
    // reactor threads reading from clones of the same fd, so the kernel
    // (rather than any coordination of ours) distributes incoming
    // datagrams/connections across them.
    for (listener_idx, sock) in udp_socks.into_iter().enumerate() {
        for thread_idx in 0..config.num_udp_threads.max(1) {
            let cloned = sock
                .try_clone()
                .unwrap_or_else(|e| panic!("failed to clone udp socket for additional reactor thread: {e}"));
            let handler = handler.clone();
            let cancel = cancel.clone();
            let thread_num = num_udp_reactors;
            num_udp_reactors += 1;
            join_handles.push(spawn_reactor_thread(
                format!("gdnsdd-udp-{listener_idx}-{thread_idx}"),
                move || {
                    let sock = tokio::net::UdpSocket::from_std(cloned)
                        .expect("std socket is already non-blocking-compatible");
                    dns_io::run_udp(sock, handler, thread_num, cancel)
                },
            ));
        }
    }

    for (listener_idx, sock) in tcp_socks.into_iter().enumerate() {
        for thread_idx in 0..config.num_tcp_threads.max(1) {
            let cloned = sock
                .try_clone()
                .unwrap_or_else(|e| panic!("failed to clone tcp listener for additional reactor thread: {e}"));
            let handler = handler.clone();
            let cancel = cancel.clone();
            let thread_num = num_tcp_reactors;
            num_tcp_reactors += 1;
            join_handles.push(spawn_reactor_thread(
                format!("gdnsdd-tcp-{listener_idx}-{thread_idx}"),
                move || {
                    let sock = tokio::net::TcpListener::from_std(cloned)
                        .expect("std listener is already non-blocking-compatible");
                    dns_io::run_tcp(sock, handler, thread_num, cancel)
                },
            ));
        }
    }

    {
        let cancel = cancel.clone();
        let zone_handle = zone_handle.clone();
        join_handles.push(spawn_reactor_thread("gdnsdd-zone".to_string(), move || {
            zone::run(zone_handle, Arc::new(NoZones), rescan_rx, cancel)
        }));
    }

    {
        let cancel = cancel.clone();
        let monitors = loaded.monitors.clone();
        let num_udp = num_udp_reactors;
        let num_tcp = num_tcp_reactors;
        let zone_handle_for_stats = zone_handle.clone();
        join_handles.push(spawn_reactor_thread("gdnsdd-monitor".to_string(), move || {
            let source = Arc::new(source_from_monitors(monitors, num_udp, num_tcp, move || {
                zone_handle_for_stats.current().zone_names.len()
            }));
            let addr: SocketAddr = "127.0.0.1:3506".parse().expect("static stats addr");
            stats::run(addr, source, cancel)
        }));
    }

    if let Some(runtime) = loaded.extmon {
        let cancel = cancel.clone();
        let monitors = loaded.monitors.clone();
        join_handles.push(spawn_reactor_thread("gdnsdd-extmon".to_string(), move || {
            run_extmon(runtime, monitors, cancel)
        }));
    }

    if let Some((interval, notify_socket)) = crate::watchdog::ping_interval_from_env() {
        let cancel = cancel.clone();
        join_handles.push(spawn_reactor_thread("gdnsdd-watchdog".to_string(), move || {
            run_watchdog(interval, notify_socket, cancel)
        }));
    }

    signals::restore(prev_mask);

    let killed_by = signals::run_main_loop(cancel.clone(), || {
        let _ = rescan_tx.send(());
    })?;
    info!(signal = killed_by, "shutting down");

    for jh in join_handles {
        let _ = jh.join();
    }

    drop(pidfile);
    Ok(())
}

/// A zone source with no actual backing store; the real zone-file parsers
/// (RFC1035 text, tinydns-data) are an excluded collaborator (spec §1),
/// so the daemon always starts with an empty, reload-safe zone tree.
struct NoZones;

impl ZoneSource for NoZones {
    fn load(&self) -> ZoneTree {
        ZoneTree::default()
    }
}

/// Spawns one OS thread running a single-threaded `tokio` current-thread
/// runtime around `body`, matching `main.c`'s one-pthread-per-reactor
/// model instead of a shared multi-threaded executor.
fn spawn_reactor_thread<F, Fut>(name: String, body: F) -> std::thread::JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + 'static,
{
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap_or_else(|e| panic!("thread '{name}': failed to build tokio runtime: {e}"));
            rt.block_on(body());
        })
        .unwrap_or_else(|e| panic!("failed to spawn thread: {e}"))
}

async fn run_extmon(runtime: ExtmonRuntime, monitors: Arc<gdnsd_plugin_api::MonitorTable>, cancel: CancellationToken) {
    if let Err(e) = runtime.spawn_and_run(&monitors, cancel).await {
        error!(error = %e, "extmon monitoring helper failed fatally");
    }
}

async fn run_watchdog(interval: std::time::Duration, notify_socket: PathBuf, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval / 2);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => crate::watchdog::ping(&notify_socket),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::privsock::MockBinder;

    #[test]
    fn exit_code_maps_status_not_running_to_three() {
        let result = Err(DaemonError::NotRunning);
        assert_eq!(exit_code(Action::Status, &result), 3);
    }

    #[test]
    fn exit_code_success_is_zero() {
        assert_eq!(exit_code(Action::Start, &Ok(())), 0);
    }

    #[test]
    fn bind_with_handoff_retries_after_soft_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile_path = dir.path().join("gdnsd.pid");
        let binder = MockBinder::new();
        binder.fail_next_call();
        let addrs = vec!["127.0.0.1:5353".parse().unwrap()];
        let (socks, pf) = bind_with_handoff(&binder, &addrs, &pidfile_path).unwrap();
        assert_eq!(socks.len(), 2);
        drop(pf);
    }

    #[test]
    fn bind_with_handoff_succeeds_immediately_when_soft_attempt_works() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile_path = dir.path().join("gdnsd.pid");
        let binder = MockBinder::new();
        let addrs = vec!["127.0.0.1:5353".parse().unwrap()];
        let (socks, pf) = bind_with_handoff(&binder, &addrs, &pidfile_path).unwrap();
        assert_eq!(socks.len(), 2);
        drop(pf);
    }
}
