// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! The daemon's own settings, loaded from `<config_dir>/config.toml`. This
//! covers only the ambient concerns the distilled spec doesn't define a
//! format for (username, listen addresses, run-dir, thread counts,
//! memory-locking); each plugin's own stanza is handed through untouched as
//! a [`ConfigValue`] tree, which is the shape the spec *does* define.

use std::path::{Path, PathBuf};

use gdnsd_plugin_api::ConfigValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path} as TOML: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// User to drop privileges to after binding, if started as root.
    pub username: Option<String>,
    /// `host:port` strings for UDP+TCP DNS listeners.
    pub listen: Vec<String>,
    pub num_udp_threads: usize,
    pub num_tcp_threads: usize,
    pub lock_mem: bool,
    pub run_dir: PathBuf,
    /// Each top-level key under `plugins`, untouched, for plugins to parse
    /// themselves (and for `gdnsd-plugin-meta`'s config rewriter to mutate
    /// before any plugin loads).
    pub plugins: ConfigValue,
}

impl DaemonConfig {
    pub fn pidfile_path(&self) -> PathBuf {
        self.run_dir.join("gdnsd.pid")
    }
}

/// Loads `<dir>/config.toml`, translating the TOML document into a
/// [`DaemonConfig`] plus a [`ConfigValue`] tree for the `plugins` table.
pub fn load(dir: &Path) -> Result<DaemonConfig, ConfigError> {
    let path = dir.join("config.toml");
    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    parse(&text, &path)
}

fn parse(text: &str, path: &Path) -> Result<DaemonConfig, ConfigError> {
    let doc: toml::Value = toml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    let table = doc
        .as_table()
        .ok_or_else(|| ConfigError::Invalid("top-level document must be a table".to_string()))?;

    let username = table
        .get("username")
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| ConfigError::Invalid("'username' must be a string".to_string()))
        })
        .transpose()?;

    let listen = match table.get("listen") {
        Some(toml::Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ConfigError::Invalid("'listen' entries must be strings".to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(ConfigError::Invalid("'listen' must be an array".to_string())),
        None => vec!["0.0.0.0:53".to_string()],
    };

    let num_udp_threads = table
        .get("num_udp_threads")
        .map(as_usize)
        .transpose()?
        .unwrap_or(1);
    let num_tcp_threads = table
        .get("num_tcp_threads")
        .map(as_usize)
        .transpose()?
        .unwrap_or(1);

    let lock_mem = table
        .get("lock_mem")
        .map(|v| {
            v.as_bool()
                .ok_or_else(|| ConfigError::Invalid("'lock_mem' must be a bool".to_string()))
        })
        .transpose()?
        .unwrap_or(false);

    let run_dir = table
        .get("run_dir")
        .map(|v| {
            v.as_str()
                .map(PathBuf::from)
                .ok_or_else(|| ConfigError::Invalid("'run_dir' must be a string".to_string()))
        })
        .transpose()?
        .unwrap_or_else(|| PathBuf::from("/var/run/gdnsd"));

    let plugins = match table.get("plugins") {
        Some(v) => toml_to_config_value(v)?,
        None => ConfigValue::hash(),
    };

    Ok(DaemonConfig {
        username,
        listen,
        num_udp_threads,
        num_tcp_threads,
        lock_mem,
        run_dir,
        plugins,
    })
}

fn as_usize(v: &toml::Value) -> Result<usize, ConfigError> {
    v.as_integer()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| ConfigError::Invalid("expected a non-negative integer".to_string()))
}

/// Converts a parsed TOML value into the plugin-facing [`ConfigValue`]
/// tree, collapsing every scalar TOML type to its string representation
/// (vscf itself is untyped at the value level; type-specific parsing, e.g.
/// of addresses or TTLs, happens at each reader).
fn toml_to_config_value(v: &toml::Value) -> Result<ConfigValue, ConfigError> {
    Ok(match v {
        toml::Value::Table(entries) => {
            let mut hash = ConfigValue::hash();
            for (k, v) in entries {
                hash.hash_insert(k.clone(), toml_to_config_value(v)?);
            }
            hash
        }
        toml::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(toml_to_config_value(item)?);
            }
            ConfigValue::array(out)
        }
        toml::Value::String(s) => ConfigValue::scalar(s.clone()),
        toml::Value::Integer(n) => ConfigValue::scalar(n.to_string()),
        toml::Value::Float(f) => ConfigValue::scalar(f.to_string()),
        toml::Value::Boolean(b) => ConfigValue::scalar(b.to_string()),
        toml::Value::Datetime(d) => ConfigValue::scalar(d.to_string()),
    })
}

/// Looks up one named plugin's raw stanza (if present) out of the
/// top-level `plugins` table, for handing to that plugin's own loader.
pub fn plugin_stanza<'a>(plugins: &'a ConfigValue, name: &str) -> Option<&'a ConfigValue> {
    plugins.hash_get(name)
}

/// The cascading flags a `-s`/`-S` CLI override forces on top of whatever
/// the config file says; kept separate from [`DaemonConfig`] since they're
/// per-invocation, not part of the on-disk document.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOverrides {
    pub strict_startup: bool,
    pub strict_data: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let cfg = parse(
            r#"
            username = "gdnsd"
            listen = ["127.0.0.1:5353"]
            lock_mem = true
            "#,
            Path::new("config.toml"),
        )
        .unwrap();
        assert_eq!(cfg.username.as_deref(), Some("gdnsd"));
        assert_eq!(cfg.listen, vec!["127.0.0.1:5353"]);
        assert!(cfg.lock_mem);
        assert_eq!(cfg.num_udp_threads, 1);
    }

    #[test]
    fn defaults_when_absent() {
        let cfg = parse("", Path::new("config.toml")).unwrap();
        assert_eq!(cfg.listen, vec!["0.0.0.0:53"]);
        assert!(!cfg.lock_mem);
        assert_eq!(cfg.run_dir, PathBuf::from("/var/run/gdnsd"));
    }

    #[test]
    fn converts_plugins_table_to_config_value() {
        let cfg = parse(
            r#"
            [plugins.extmon]
            helper_failure_action = "kill_daemon"

            [plugins.extmon.services.ping]
            interval = 5
            "#,
            Path::new("config.toml"),
        )
        .unwrap();
        let extmon = cfg.plugins.hash_get("extmon").unwrap();
        assert_eq!(
            extmon.hash_get("helper_failure_action").unwrap().as_str(),
            Some("kill_daemon")
        );
        let svc = extmon.hash_get("services").unwrap().hash_get("ping").unwrap();
        assert_eq!(svc.hash_get("interval").unwrap().as_str(), Some("5"));
    }

    #[test]
    fn rejects_non_table_top_level() {
        // toml::from_str never actually produces a non-table top-level document
        // for valid TOML text, so exercise the 'listen' type-check path instead.
        let err = parse("listen = \"not-an-array\"", Path::new("config.toml"));
        assert!(err.is_err());
    }
}
