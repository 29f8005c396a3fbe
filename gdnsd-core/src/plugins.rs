// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Plugin loading at startup: builds the shared [`MonitorTable`] and
//! [`PluginRegistry`], runs `meta`'s config-rewriting pass against the
//! daemon's top-level `plugins` table (which mutates it in place, see
//! `gdnsd-plugin-meta::plugin::MetaPlugin::configure`), then loads every
//! resulting plugin stanza in the table. This is the same sequencing
//! `gdnsd-plugin-meta`'s own test helper exercises, just driven off a real
//! on-disk config instead of a hand-built one.

use std::sync::{Arc, Mutex};

use gdnsd_plugin_api::{ConfigValue, MonitorTable, PluginError, PluginRegistry};
use gdnsd_plugin_extmon::{parse_runtime_config, ExtmonRuntime, ServiceType};
use gdnsd_plugin_meta::MetaPlugin;
use gdnsd_plugin_multifo::MultifoPlugin;
use thiserror::Error;
use tracing::info;

use crate::config::{plugin_stanza, DaemonConfig};

#[derive(Debug, Error)]
pub enum PluginLoadError {
    #[error("plugin '{name}': {source}")]
    Plugin {
        name: String,
        #[source]
        source: PluginError,
    },
    #[error(transparent)]
    Other(#[from] PluginError),
}

/// Everything the daemon needs after plugin load: the monitor table shared
/// by every resolver and the extmon helper, the registry resolver plugins
/// get looked up through, and (if configured) a runtime ready to spawn the
/// external monitoring helper.
pub struct LoadedPlugins {
    pub monitors: Arc<MonitorTable>,
    pub registry: Arc<Mutex<PluginRegistry>>,
    pub extmon: Option<ExtmonRuntime>,
}

/// Loads every plugin named (directly or synthesized) by `config.plugins`.
/// `default_extmon_helper` is the compiled-in libexec path used when the
/// `extmon` stanza doesn't override `helper_path`.
pub fn load(config: &mut DaemonConfig, default_extmon_helper: std::path::PathBuf) -> Result<LoadedPlugins, PluginLoadError> {
    let monitors = Arc::new(MonitorTable::new());
    let registry = Arc::new(Mutex::new(PluginRegistry::new()));
    registry.lock().unwrap_or_else(|e| e.into_inner()).register(Box::new(MultifoPlugin::new()));

    let mut meta = MetaPlugin::new();
    if let Some(meta_cfg) = plugin_stanza(&config.plugins, "meta").cloned() {
        meta.configure(&meta_cfg, &mut config.plugins, &monitors, registry.clone())
            .map_err(|source| PluginLoadError::Plugin {
                name: "meta".to_string(),
                source,
            })?;
    }
    registry.lock().unwrap_or_else(|e| e.into_inner()).register(Box::new(meta));

    // load_config every stanza meta's rewriting pass may have synthesized,
    // plus every plugin that was already present verbatim. extmon is
    // loaded separately below since it has no ResolverPlugin stanza shape.
    let plugin_names: Vec<String> = config.plugins.hash_keys().map(str::to_string).collect();
    for name in &plugin_names {
        if name == "meta" || name == "extmon" {
            continue;
        }
        let Some(handle) = registry.lock().unwrap_or_else(|e| e.into_inner()).find(name) else {
            // a bare config stanza for a plugin this binary doesn't carry
            // is only an error once something actually tries to resolve
            // through it; checkconf-style validation would want to be
            // stricter here, but at daemon startup we load what we can.
            continue;
        };
        let stanza = plugin_stanza(&config.plugins, name).cloned();
        let mut plugin = handle.lock().unwrap_or_else(|e| e.into_inner());
        plugin
            .load_config(stanza.as_ref(), &monitors)
            .map_err(|source| PluginLoadError::Plugin {
                name: name.clone(),
                source,
            })?;
        info!(plugin = %name, "loaded");
    }

    let extmon = load_extmon(config, &monitors, default_extmon_helper)?;

    Ok(LoadedPlugins {
        monitors,
        registry,
        extmon,
    })
}

fn load_extmon(
    config: &DaemonConfig,
    monitors: &Arc<MonitorTable>,
    default_helper: std::path::PathBuf,
) -> Result<Option<ExtmonRuntime>, PluginLoadError> {
    let Some(extmon_cfg) = plugin_stanza(&config.plugins, "extmon") else {
        return Ok(None);
    };

    let runtime_cfg = parse_runtime_config(Some(extmon_cfg), default_helper).map_err(|source| PluginLoadError::Plugin {
        name: "extmon".to_string(),
        source,
    })?;
    let mut runtime = ExtmonRuntime::new(runtime_cfg);

    if let Some(svc_types_cfg) = extmon_cfg.hash_get("service_types") {
        let entries = svc_types_cfg.as_hash().ok_or_else(|| PluginLoadError::Other(
            PluginError::Config("extmon: 'service_types' must be a hash".to_string()),
        ))?;
        for (svc_name, svc_cfg) in entries {
            let interval = cfg_u32(svc_cfg, "interval", 10)?;
            let timeout = cfg_u32(svc_cfg, "timeout", 5)?;
            let svc = ServiceType::from_config(svc_name, svc_cfg, interval, timeout)
                .map_err(|source| PluginLoadError::Plugin {
                    name: "extmon".to_string(),
                    source,
                })?;
            runtime.add_svc_type(svc);
        }
    }

    if let Some(monitors_cfg) = extmon_cfg.hash_get("monitors") {
        let entries = monitors_cfg.as_array().ok_or_else(|| PluginLoadError::Other(
            PluginError::Config("extmon: 'monitors' must be an array".to_string()),
        ))?;
        for entry in entries {
            let desc = entry
                .hash_get("desc")
                .and_then(ConfigValue::as_str)
                .ok_or_else(|| PluginLoadError::Other(PluginError::Config("extmon: monitor entry missing 'desc'".to_string())))?;
            let svc_name = entry
                .hash_get("service_type")
                .and_then(ConfigValue::as_str)
                .ok_or_else(|| PluginLoadError::Other(PluginError::Config(format!("extmon: monitor '{desc}' missing 'service_type'"))))?;
            let thing = entry
                .hash_get("thing")
                .and_then(ConfigValue::as_str)
                .ok_or_else(|| PluginLoadError::Other(PluginError::Config(format!("extmon: monitor '{desc}' missing 'thing'"))))?;
            let svc_idx = runtime.find_svc_type(svc_name).ok_or_else(|| {
                PluginLoadError::Other(PluginError::Config(format!(
                    "extmon: monitor '{desc}' references unknown service_type '{svc_name}'"
                )))
            })?;
            runtime.add_monitor(desc, svc_idx, thing, monitors);
        }
    }

    Ok(Some(runtime))
}

fn cfg_u32(cfg: &ConfigValue, key: &str, default: u32) -> Result<u32, PluginLoadError> {
    match cfg.hash_get(key) {
        Some(v) => v
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| PluginLoadError::Other(PluginError::Config(format!("extmon: '{key}' must be an integer")))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> DaemonConfig {
        DaemonConfig {
            username: None,
            listen: vec!["127.0.0.1:5353".to_string()],
            num_udp_threads: 1,
            num_tcp_threads: 1,
            lock_mem: false,
            run_dir: std::env::temp_dir(),
            plugins: ConfigValue::hash(),
        }
    }

    #[test]
    fn loads_with_no_plugins_configured() {
        let mut cfg = minimal_config();
        let loaded = load(&mut cfg, "/usr/libexec/gdnsd/gdnsd_extmon_helper".into()).unwrap();
        assert!(loaded.extmon.is_none());
        assert_eq!(loaded.monitors.len(), 0);
    }

    #[test]
    fn loads_meta_and_synthesizes_multifo() {
        let mut cfg = minimal_config();
        let mut dcmap = ConfigValue::hash();
        dcmap.hash_insert("us", ConfigValue::scalar("192.0.2.1"));
        let mut web = ConfigValue::hash();
        web.hash_insert("dcmap", dcmap);
        let mut resources = ConfigValue::hash();
        resources.hash_insert("web", web);
        let mut meta_cfg = ConfigValue::hash();
        meta_cfg.hash_insert("resources", resources);
        cfg.plugins.hash_insert("meta", meta_cfg);

        let loaded = load(&mut cfg, "/usr/libexec/gdnsd/gdnsd_extmon_helper".into()).unwrap();
        let reg = loaded.registry.lock().unwrap();
        assert!(reg.find("multifo").is_some());
        assert!(reg.find("meta").is_some());
    }

    #[test]
    fn loads_extmon_monitors() {
        let mut cfg = minimal_config();
        let mut extmon_cfg = ConfigValue::hash();

        let mut svc = ConfigValue::hash();
        svc.hash_insert(
            "cmd",
            ConfigValue::array(vec![ConfigValue::scalar("/bin/true"), ConfigValue::scalar("%%ITEM%%")]),
        );
        svc.hash_insert("interval", ConfigValue::scalar("5"));
        svc.hash_insert("timeout", ConfigValue::scalar("3"));
        let mut svc_types = ConfigValue::hash();
        svc_types.hash_insert("ping", svc);
        extmon_cfg.hash_insert("service_types", svc_types);

        let mut mon = ConfigValue::hash();
        mon.hash_insert("desc", ConfigValue::scalar("www-us"));
        mon.hash_insert("service_type", ConfigValue::scalar("ping"));
        mon.hash_insert("thing", ConfigValue::scalar("192.0.2.1"));
        extmon_cfg.hash_insert("monitors", ConfigValue::array(vec![mon]));

        cfg.plugins.hash_insert("extmon", extmon_cfg);

        let loaded = load(&mut cfg, "/usr/libexec/gdnsd/gdnsd_extmon_helper".into()).unwrap();
        let runtime = loaded.extmon.expect("extmon configured");
        assert!(!runtime.is_empty());
        assert_eq!(loaded.monitors.len(), 1);
    }
}
