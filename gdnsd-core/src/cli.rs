// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Argument parsing, ported from
//! `examples/original_source/gdnsd/main.c`'s `parse_args`/`match_action`.
//! No arg-parsing crate: the surface is six flags and one positional
//! action word, and a hand-rolled loop is more direct than pulling in a
//! dependency for it.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CheckConfig,
    Start,
    Stop,
    Reload,
    Restart,
    CondRestart,
    Status,
}

impl Action {
    fn from_word(word: &str) -> Option<Self> {
        Some(match word {
            "checkconf" | "check-config" => Action::CheckConfig,
            "start" => Action::Start,
            "stop" => Action::Stop,
            "reload" => Action::Reload,
            "restart" | "force-reload" => Action::Restart,
            "condrestart" | "try-restart" => Action::CondRestart,
            "status" => Action::Status,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Flags {
    pub debug: bool,
    pub foreground: bool,
    pub strict_startup: bool,
    pub strict_data: bool,
    pub config_dir: Option<PathBuf>,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            debug: false,
            foreground: false,
            strict_startup: false,
            strict_data: false,
            config_dir: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedArgs {
    pub flags: Flags,
    pub action: Action,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("unknown flag '-{0}'")]
    UnknownFlag(char),
    #[error("-c requires a config directory argument")]
    MissingConfigDir,
    #[error("no action given")]
    MissingAction,
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("too many arguments")]
    TooManyArguments,
}

pub const USAGE: &str = "\
Usage: gdnsdd [-fsSD] [-c CFGDIR] <action>
  -D - Enable verbose debug output
  -f - Foreground mode for start/restart-like actions
  -s - Force 'zones_strict_startup = true' for this invocation
  -S - Force 'zones_strict_data = true' for this invocation
  -c - Configuration directory
Actions:
  checkconf    - Checks validity of config and zone files
  start        - Start gdnsdd as a regular daemon
  stop         - Stops a running daemon previously started by 'start'
  reload       - Send SIGHUP to running daemon for zone data reload
  restart      - Equivalent to checkconf && stop && start, but faster
  force-reload - Aliases 'restart'
  condrestart  - Does 'restart' action only if already running
  try-restart  - Aliases 'condrestart'
  status       - Checks the status of the running daemon";

/// Parses `argv[1..]`. Flags may be bundled (`-fD`) or separate; `-c`
/// always consumes the following token as its argument.
pub fn parse_args(args: &[String]) -> Result<ParsedArgs, CliError> {
    let mut flags = Flags::default();
    let mut action_word: Option<String> = None;

    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if let Some(stripped) = arg.strip_prefix('-') {
            if stripped.is_empty() || stripped == "-" {
                return Err(CliError::UnknownFlag('-'));
            }
            let mut chars = stripped.chars().peekable();
            while let Some(c) = chars.next() {
                match c {
                    'D' => flags.debug = true,
                    'f' => flags.foreground = true,
                    's' => flags.strict_startup = true,
                    'S' => flags.strict_data = true,
                    'c' => {
                        let rest: String = chars.by_ref().collect();
                        let dir = if rest.is_empty() {
                            iter.next().cloned().ok_or(CliError::MissingConfigDir)?
                        } else {
                            rest
                        };
                        flags.config_dir = Some(PathBuf::from(dir));
                        break;
                    }
                    other => return Err(CliError::UnknownFlag(other)),
                }
            }
        } else if action_word.is_none() {
            action_word = Some(arg.clone());
        } else {
            return Err(CliError::TooManyArguments);
        }
    }

    let word = action_word.ok_or(CliError::MissingAction)?;
    let action = Action::from_word(&word).ok_or(CliError::UnknownAction(word))?;

    Ok(ParsedArgs { flags, action })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_bundled_flags_and_action() {
        let parsed = parse_args(&argv(&["-fD", "start"])).unwrap();
        assert!(parsed.flags.foreground);
        assert!(parsed.flags.debug);
        assert_eq!(parsed.action, Action::Start);
    }

    #[test]
    fn dash_c_consumes_next_token() {
        let parsed = parse_args(&argv(&["-c", "/etc/gdnsd", "reload"])).unwrap();
        assert_eq!(parsed.flags.config_dir, Some(PathBuf::from("/etc/gdnsd")));
        assert_eq!(parsed.action, Action::Reload);
    }

    #[test]
    fn dash_c_glued_to_value() {
        let parsed = parse_args(&argv(&["-c/etc/gdnsd", "status"])).unwrap();
        assert_eq!(parsed.flags.config_dir, Some(PathBuf::from("/etc/gdnsd")));
    }

    #[test]
    fn aliases_resolve() {
        assert_eq!(parse_args(&argv(&["force-reload"])).unwrap().action, Action::Restart);
        assert_eq!(parse_args(&argv(&["try-restart"])).unwrap().action, Action::CondRestart);
    }

    #[test]
    fn missing_action_is_an_error() {
        assert!(matches!(parse_args(&argv(&["-f"])), Err(CliError::MissingAction)));
    }

    #[test]
    fn unknown_action_is_an_error() {
        assert!(matches!(
            parse_args(&argv(&["frobnicate"])),
            Err(CliError::UnknownAction(_))
        ));
    }

    #[test]
    fn unknown_flag_is_an_error() {
        assert!(matches!(parse_args(&argv(&["-x", "start"])), Err(CliError::UnknownFlag('x'))));
    }
}
