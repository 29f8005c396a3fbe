// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! A minimal stand-in for gdnsd's `multifo` leaf plugin: a named resource
//! resolves to a small, fixed set of addresses, round-robined on each
//! resolve. This exists only so the meta/geo engine has a real non-`meta`
//! child to delegate to — gdnsd's actual `multifo` (weighting, per-address
//! monitors, live failover) is not reproduced here.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use gdnsd_plugin_api::{ClientInfo, ConfigValue, Dname, DynResult, MonitorTable, PluginError, ResolverPlugin};
use gdnsd_sttl::Sttl;

struct MultifoResource {
    name: String,
    addrs: Vec<IpAddr>,
    ttl: u32,
    rr_cursor: AtomicUsize,
}

/// The `multifo` stand-in plugin: named resources, each a short address
/// list, round-robined on resolve.
#[derive(Default)]
pub struct MultifoPlugin {
    resources: Vec<MultifoResource>,
}

impl MultifoPlugin {
    pub fn new() -> Self {
        Self::default()
    }
}

fn parse_resource(name: &str, cfg: &ConfigValue) -> Result<MultifoResource, PluginError> {
    let entries = cfg.as_hash().ok_or_else(|| {
        PluginError::Config(format!("multifo: resource '{name}' must be a hash"))
    })?;

    let mut addrs = Vec::new();
    let mut ttl = gdnsd_sttl::DEFAULT_TTL;
    // numeric keys ("1", "2", ...) carry addresses, synthesized by the
    // meta/geo engine's config rewriter; a "ttl" key may override the
    // default, and a "plugin" key (always "multifo" here, injected by the
    // caller) is ignored.
    let mut numbered: Vec<(u32, &str)> = Vec::new();
    for (key, value) in entries {
        if key == "plugin" {
            continue;
        }
        if key == "ttl" {
            ttl = value
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| PluginError::Config(format!("multifo: resource '{name}': bad ttl")))?;
            continue;
        }
        let Ok(n) = key.parse::<u32>() else {
            return Err(PluginError::Config(format!(
                "multifo: resource '{name}': unexpected key '{key}'"
            )));
        };
        let addr_str = value.as_str().ok_or_else(|| {
            PluginError::Config(format!("multifo: resource '{name}': key '{key}' must be a scalar address"))
        })?;
        numbered.push((n, addr_str));
    }
    numbered.sort_by_key(|(n, _)| *n);
    for (_, addr_str) in numbered {
        let addr: IpAddr = addr_str
            .parse()
            .map_err(|_| PluginError::Config(format!("multifo: resource '{name}': invalid address '{addr_str}'")))?;
        addrs.push(addr);
    }

    if addrs.is_empty() {
        return Err(PluginError::Config(format!(
            "multifo: resource '{name}' has no addresses"
        )));
    }

    Ok(MultifoResource {
        name: name.to_string(),
        addrs,
        ttl,
        rr_cursor: AtomicUsize::new(0),
    })
}

impl ResolverPlugin for MultifoPlugin {
    fn name(&self) -> &'static str {
        "multifo"
    }

    fn load_config(
        &mut self,
        config: Option<&ConfigValue>,
        _monitors: &Arc<MonitorTable>,
    ) -> Result<(), PluginError> {
        let Some(config) = config else {
            return Ok(());
        };
        let resources_cfg = config
            .hash_get("resources")
            .ok_or_else(|| PluginError::Config("multifo: config has no 'resources' stanza".to_string()))?;
        let entries = resources_cfg
            .as_hash()
            .ok_or_else(|| PluginError::Config("multifo: 'resources' stanza must be a hash".to_string()))?;

        for (name, cfg) in entries {
            self.resources.push(parse_resource(name, cfg)?);
        }
        Ok(())
    }

    fn map_res(&mut self, resource_name: Option<&str>, _origin: Option<&Dname>) -> Result<u32, PluginError> {
        let name = resource_name
            .ok_or_else(|| PluginError::MapRes("multifo: a resource name is required".to_string()))?;
        self.resources
            .iter()
            .position(|r| r.name == name)
            .map(|i| i as u32)
            .ok_or_else(|| PluginError::MapRes(format!("multifo: invalid resource name '{name}'")))
    }

    fn resolve(
        &self,
        _thread_num: usize,
        res_num: u32,
        _origin: Option<&Dname>,
        _client: &ClientInfo,
        result: &mut DynResult,
    ) -> Sttl {
        let res = &self.resources[res_num as usize];
        let start = res.rr_cursor.fetch_add(1, Ordering::Relaxed) % res.addrs.len();
        result.is_cname = false;
        result.addrs = res
            .addrs
            .iter()
            .cycle()
            .skip(start)
            .take(res.addrs.len())
            .copied()
            .collect();
        Sttl::up(res.ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdnsd_plugin_api::MonitorTable;

    fn cfg_with_one_resource() -> ConfigValue {
        let mut web = ConfigValue::hash();
        web.hash_insert("1", ConfigValue::scalar("192.0.2.1"));
        web.hash_insert("2", ConfigValue::scalar("192.0.2.2"));

        let mut resources = ConfigValue::hash();
        resources.hash_insert("web", web);

        let mut top = ConfigValue::hash();
        top.hash_insert("resources", resources);
        top
    }

    #[test]
    fn loads_and_resolves_round_robin() {
        let mut plugin = MultifoPlugin::new();
        let monitors = Arc::new(MonitorTable::new());
        plugin.load_config(Some(&cfg_with_one_resource()), &monitors).unwrap();

        let res_num = plugin.map_res(Some("web"), None).unwrap();
        let client = ClientInfo {
            client_addr: "203.0.113.1".parse().unwrap(),
            edns_subnet: None,
            thread_num: 0,
        };

        let mut result = DynResult::default();
        let sttl = plugin.resolve(0, res_num, None, &client, &mut result);
        assert!(!sttl.is_down());
        assert_eq!(result.addrs.len(), 2);

        let first_start = result.addrs[0];
        let mut result2 = DynResult::default();
        plugin.resolve(0, res_num, None, &client, &mut result2);
        // round-robin cursor advances between calls
        assert_ne!(first_start, result2.addrs[0]);
    }

    #[test]
    fn unknown_resource_rejected() {
        let mut plugin = MultifoPlugin::new();
        let monitors = Arc::new(MonitorTable::new());
        plugin.load_config(Some(&cfg_with_one_resource()), &monitors).unwrap();
        assert!(plugin.map_res(Some("missing"), None).is_err());
    }
}
