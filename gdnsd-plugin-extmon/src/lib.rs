// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Monitoring-only plugin: supervises a privileged child process that
//! runs probe commands outside the daemon's post-privilege-drop
//! restrictions, and folds its results back into the shared monitor-state
//! table. Unlike the resolver plugins, this one never implements
//! `ResolverPlugin` — it has no resources to resolve, only monitors to
//! update.

pub mod protocol;
mod runtime;
mod svc;

pub use protocol::{CommandFrame, ProtocolError};
pub use runtime::{ExtmonConfig, ExtmonRuntime, FailureAction};
pub use svc::ServiceType;

use gdnsd_plugin_api::{ConfigValue, PluginError};

/// Keys this stanza itself consumes, plus `service_types`/`monitors`,
/// which belong to it but are read out of the same `ConfigValue` directly
/// by `gdnsd-core::plugins::load_extmon` rather than through this
/// function. Anything else is an unrecognized key.
const RECOGNIZED_KEYS: &[&str] = &["helper_path", "helper_failure_action", "service_types", "monitors"];

/// Parses the plugin's own `plugins => { extmon => { ... } }` stanza:
/// `helper_path` (defaulting to a compiled-in libexec path the daemon
/// resolves) and `helper_failure_action` (`"stasis"` or `"kill_daemon"`,
/// default `"stasis"`). Per spec §6, any key besides those two (and the
/// sibling `service_types`/`monitors` keys) is fatal, mirroring
/// `extmon.c`'s `bad_opt` hash-iteration check.
pub fn parse_runtime_config(
    config: Option<&ConfigValue>,
    default_helper_path: std::path::PathBuf,
) -> Result<ExtmonConfig, PluginError> {
    let mut helper_path = default_helper_path;
    let mut failure_action = FailureAction::Stasis;

    if let Some(config) = config {
        for key in config.hash_keys() {
            if !RECOGNIZED_KEYS.contains(&key) {
                return Err(PluginError::Config(format!("extmon: unknown config key '{key}'")));
            }
        }

        if let Some(path_cfg) = config.hash_get("helper_path") {
            let path = path_cfg
                .as_str()
                .ok_or_else(|| PluginError::Config("extmon: 'helper_path' must be a simple string".to_string()))?;
            helper_path = std::path::PathBuf::from(path);
        }
        if let Some(action_cfg) = config.hash_get("helper_failure_action") {
            let action = action_cfg.as_str().ok_or_else(|| {
                PluginError::Config("extmon: 'helper_failure_action' must be a simple string".to_string())
            })?;
            failure_action = match action {
                "stasis" => FailureAction::Stasis,
                "kill_daemon" => FailureAction::KillDaemon,
                other => {
                    return Err(PluginError::Config(format!(
                        "extmon: 'helper_failure_action' must be 'stasis' or 'kill_daemon', got '{other}'"
                    )))
                }
            };
        }
    }

    Ok(ExtmonConfig {
        helper_path,
        failure_action,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_stasis() {
        let cfg = parse_runtime_config(None, "/usr/libexec/gdnsd/gdnsd_extmon_helper".into()).unwrap();
        assert_eq!(cfg.failure_action, FailureAction::Stasis);
    }

    #[test]
    fn parses_kill_daemon() {
        let mut c = ConfigValue::hash();
        c.hash_insert("helper_failure_action", ConfigValue::scalar("kill_daemon"));
        let cfg = parse_runtime_config(Some(&c), "/x".into()).unwrap();
        assert_eq!(cfg.failure_action, FailureAction::KillDaemon);
    }

    #[test]
    fn rejects_bad_action() {
        let mut c = ConfigValue::hash();
        c.hash_insert("helper_failure_action", ConfigValue::scalar("nonsense"));
        assert!(parse_runtime_config(Some(&c), "/x".into()).is_err());
    }

    #[test]
    fn rejects_unknown_key() {
        let mut c = ConfigValue::hash();
        c.hash_insert("bogus_key", ConfigValue::scalar("whatever"));
        assert!(parse_runtime_config(Some(&c), "/x".into()).is_err());
    }

    #[test]
    fn accepts_sibling_keys_read_elsewhere() {
        let mut c = ConfigValue::hash();
        c.hash_insert("service_types", ConfigValue::hash());
        c.hash_insert("monitors", ConfigValue::array(vec![]));
        assert!(parse_runtime_config(Some(&c), "/x".into()).is_ok());
    }
}
