// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Drives the privileged monitoring helper: spawns it, hands it the full
//! command set once at startup, then watches for result frames for the
//! life of the process. A per-monitor local timeout stands in for the
//! helper when it goes quiet for too long, so a wedged or dead helper
//! degrades individual monitors to down rather than leaving them stuck on
//! their last-known state forever.

use std::cmp::Reverse;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, Instant};

use gdnsd_plugin_api::{MonitorIndex, MonitorTable};
use priority_queue::PriorityQueue;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::protocol::{self, CommandFrame, ProtocolError};
use crate::svc::ServiceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Stasis,
    KillDaemon,
}

#[derive(Debug, Clone)]
pub struct ExtmonConfig {
    pub helper_path: PathBuf,
    pub failure_action: FailureAction,
}

struct MonEntry {
    desc: String,
    svc: usize,
    thing: String,
    index: MonitorIndex,
    seen_once: bool,
}

/// Accumulates service types and monitors at config-load time, then hands
/// off to a running event loop once `spawn_and_run` takes ownership.
pub struct ExtmonRuntime {
    config: ExtmonConfig,
    svc_types: Vec<ServiceType>,
    monitors: Vec<MonEntry>,
}

impl ExtmonRuntime {
    pub fn new(config: ExtmonConfig) -> Self {
        Self {
            config,
            svc_types: Vec::new(),
            monitors: Vec::new(),
        }
    }

    pub fn add_svc_type(&mut self, svc: ServiceType) -> usize {
        let idx = self.svc_types.len();
        self.svc_types.push(svc);
        idx
    }

    pub fn find_svc_type(&self, name: &str) -> Option<usize> {
        self.svc_types.iter().position(|s| s.name == name)
    }

    /// Registers one monitored thing (an address or CNAME target) against
    /// a service type, allocating an admin-state entry in `monitors`.
    pub fn add_monitor(
        &mut self,
        desc: &str,
        svc: usize,
        thing: &str,
        monitors: &MonitorTable,
    ) -> MonitorIndex {
        let index = monitors.register_admin(desc.to_string());
        self.monitors.push(MonEntry {
            desc: desc.to_string(),
            svc,
            thing: thing.to_string(),
            index,
            seen_once: false,
        });
        index
    }

    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// Spawns the helper, performs the full command handshake, then runs
    /// the result/timeout loop until `cancel` fires or the helper dies.
    /// Consumes `self` because the monitor list is immutable for the rest
    /// of the process's life once the helper has been told about it.
    pub async fn spawn_and_run(
        mut self,
        monitors: &MonitorTable,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        if self.monitors.is_empty() {
            return Ok(());
        }

        let mut child = Command::new(&self.config.helper_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take().expect("piped stdin");
        let mut stdout = child.stdout.take().expect("piped stdout");

        protocol::parent_handshake(&mut stdin, &mut stdout, self.monitors.len() as u16).await?;

        for i in 0..self.monitors.len() {
            let frame = self.command_frame_for(i);
            protocol::parent_send_command(&mut stdin, &mut stdout, &frame).await?;
        }

        protocol::parent_finish_commands(&mut stdin, &mut stdout).await?;
        // the helper needs nothing further from us; closing stdin lets it
        // detect our own death via EOF if we ever exit uncleanly.
        drop(stdin);

        self.run_loop(stdout, child, monitors, cancel).await
    }

    fn command_frame_for(&self, i: usize) -> CommandFrame {
        let mon = &self.monitors[i];
        let svc = &self.svc_types[mon.svc];
        CommandFrame {
            idx: i as u32,
            timeout: svc.timeout,
            interval: svc.interval,
            args: svc.bind_args(&mon.thing),
            desc: mon.desc.clone(),
        }
    }

    fn local_timeout_duration(&self, i: usize) -> Duration {
        let svc = &self.svc_types[self.monitors[i].svc];
        Duration::from_secs(((svc.timeout + svc.interval) * 2) as u64)
    }

    async fn run_loop(
        mut self,
        mut stdout: impl AsyncRead + Unpin,
        mut child: Child,
        monitors: &MonitorTable,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut init_phase = true;
        let mut init_seen = 0usize;
        let total = self.monitors.len();

        let mut deadlines: PriorityQueue<usize, Reverse<Instant>> = PriorityQueue::new();
        let now = Instant::now();
        for i in 0..total {
            deadlines.push(i, Reverse(now + self.local_timeout_duration(i)));
        }

        loop {
            let sleep_fut: Pin<Box<dyn std::future::Future<Output = usize> + Send>> =
                match deadlines.peek() {
                    Some((&idx, &Reverse(when))) => Box::pin(async move {
                        sleep_until(when.into()).await;
                        idx
                    }),
                    None => Box::pin(std::future::pending()),
                };

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("extmon: shutting down monitoring helper");
                    let _ = child.start_kill();
                    return Ok(());
                }
                result = protocol::read_result(&mut stdout) => {
                    match result {
                        Ok(Some((idx, failed))) => {
                            if idx as usize >= total {
                                error!(idx, "extmon: helper returned out-of-range monitor index");
                                continue;
                            }
                            monitors.update(self.monitors[idx as usize].index, !failed);
                            deadlines.remove(&(idx as usize));
                            let entry = &mut self.monitors[idx as usize];
                            if init_phase {
                                if !entry.seen_once {
                                    entry.seen_once = true;
                                    init_seen += 1;
                                    if init_seen == total {
                                        init_phase = false;
                                    }
                                }
                            } else {
                                let when = Instant::now() + self.local_timeout_duration(idx as usize);
                                deadlines.push(idx as usize, Reverse(when));
                            }
                        }
                        Ok(None) => {
                            return self.handle_helper_failure(&mut child).await;
                        }
                        Err(ProtocolError::Eof) => {
                            return self.handle_helper_failure(&mut child).await;
                        }
                        Err(e) => {
                            error!(error = %e, "extmon: helper protocol error");
                            return self.handle_helper_failure(&mut child).await;
                        }
                    }
                }
                idx = sleep_fut => {
                    warn!(
                        desc = %self.monitors[idx].desc,
                        "extmon: helper is very late for a status update, applying a local negative update"
                    );
                    monitors.update(self.monitors[idx].index, false);
                    deadlines.remove(&idx);
                    if init_phase {
                        let entry = &mut self.monitors[idx];
                        if !entry.seen_once {
                            entry.seen_once = true;
                            init_seen += 1;
                            if init_seen == total {
                                init_phase = false;
                            }
                        }
                    } else {
                        let when = Instant::now() + self.local_timeout_duration(idx);
                        deadlines.push(idx, Reverse(when));
                    }
                }
            }
        }
    }

    async fn handle_helper_failure(&self, child: &mut Child) -> anyhow::Result<()> {
        let msg = "extmon: monitoring helper failed, no further status updates will arrive";
        let _ = child.start_kill();
        match self.config.failure_action {
            FailureAction::KillDaemon => anyhow::bail!(msg),
            FailureAction::Stasis => {
                error!("{msg}");
                Ok(())
            }
        }
    }
}
