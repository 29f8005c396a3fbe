// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! The privileged monitoring helper. Spawned by the daemon before it
//! drops privileges, it inherits whatever capabilities probe commands
//! need (raw sockets, privileged ports) and keeps running as the
//! original user for the life of the daemon. It speaks a small protocol
//! over its own stdin/stdout: receive the full command set once, then
//! run each command on its configured interval forever, reporting
//! success/failure back as 4-byte result frames.

use std::process::Stdio;
use std::time::Duration;

use gdnsd_plugin_extmon::{protocol, CommandFrame};
use tokio::io::{stdin, stdout};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn run_probe_once(args: &[String]) -> bool {
    let Some((prog, rest)) = args.split_first() else {
        return false;
    };
    match Command::new(prog)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}

/// Runs one monitor forever: probe, report, sleep for `interval`, repeat.
/// A probe that outruns `timeout` counts as a failure.
async fn monitor_loop(frame: CommandFrame, results: mpsc::UnboundedSender<(u32, bool)>) {
    loop {
        let ok = match timeout(
            Duration::from_secs(frame.timeout as u64),
            run_probe_once(&frame.args),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => false,
        };
        if results.send((frame.idx, !ok)).is_err() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(frame.interval as u64)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    #[cfg(feature = "helper-tracing")]
    if std::env::var_os("GDNSD_EXTMON_HELPER_TRACING").is_some() {
        tracing_subscriber::fmt::init();
    }

    let mut r = stdin();
    let mut w = stdout();

    let num_mons = protocol::child_handshake(&mut r, &mut w).await?;

    let mut frames = Vec::with_capacity(num_mons as usize);
    while frames.len() < num_mons as usize {
        frames.push(protocol::child_recv_command(&mut r, &mut w).await?);
    }
    protocol::child_finish_commands(&mut r, &mut w).await?;
    drop(r);

    let (tx, mut rx) = mpsc::unbounded_channel();
    for frame in frames {
        tokio::spawn(monitor_loop(frame, tx.clone()));
    }
    drop(tx);

    while let Some((idx, failed)) = rx.recv().await {
        protocol::write_result(&mut w, idx, failed).await?;
    }

    Ok(())
}
