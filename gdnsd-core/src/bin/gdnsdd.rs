// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Process entry point: parse argv, set up logging, and hand off to
//! [`gdnsd_core::daemon::run`]. Kept thin on purpose — everything that
//! matters lives in the library so it's testable without a process.

use std::path::PathBuf;

use gdnsd_core::cli::{self, ParsedArgs};
use gdnsd_core::daemon;

const DEFAULT_CONFIG_DIR: &str = "/etc/gdnsd";

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let ParsedArgs { flags, action } = match cli::parse_args(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("gdnsdd: {e}\n\n{}", cli::USAGE);
            std::process::exit(2);
        }
    };

    let filter = if flags.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let config_dir = flags
        .config_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR));

    let result = daemon::run(&config_dir, &flags, action);
    if let Err(ref e) = result {
        tracing::error!(error = %e, "fatal error");
    }
    std::process::exit(daemon::exit_code(action, &result));
}
