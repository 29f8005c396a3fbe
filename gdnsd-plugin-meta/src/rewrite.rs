// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Configuration rewriting (spec §4.3 "Configuration rewriting"), ported
//! from `meta_core.c`'s `inject_child_plugin_config`/`config_res_perdc`.
//! `ConfigValue` carries no back-pointers (spec §9 "Cyclic configuration
//! references"), so the parent resource config and the sibling top-level
//! `plugins` table are threaded through explicitly instead of walked via
//! `vscf_get_parent`.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use gdnsd_plugin_api::{ConfigValue, Dname, MonitorTable, PluginError};

use crate::resource::{DcTarget, Datacenter};

const OWN_PLUGIN_NAME: &str = "meta";

/// Plugins whose resources live under a `resources` sub-stanza rather than
/// directly in the plugin's top-level table, mirroring `meta_core.c`'s
/// `metafo`-only special case (`if(!strcmp(plugin_name, "metafo"))`),
/// generalized to a small allowlist since this crate has more than one
/// resource-shaped child plugin (`multifo`, and `meta` itself, though the
/// latter can never legally be a synthesis target — see
/// [`reject_self_synthesis`]).
fn plugin_wants_resources_substanza(name: &str) -> bool {
    matches!(name, "multifo" | OWN_PLUGIN_NAME)
}

fn default_plugin_name(cfg: &ConfigValue) -> Result<String, PluginError> {
    match cfg.hash_get("plugin") {
        Some(v) => v
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| PluginError::Config("'plugin' must be a simple string".to_string())),
        None => Ok("multifo".to_string()),
    }
}

fn reject_self_synthesis(plugin_name: &str, resname: &str, dcname: &str) -> Result<(), PluginError> {
    if plugin_name == OWN_PLUGIN_NAME {
        return Err(PluginError::Config(format!(
            "meta: resource '{resname}': datacenter '{dcname}': plugin_meta cannot synthesize config for itself"
        )));
    }
    Ok(())
}

fn reject_self_reference(plugin_name: &str, resource_name: Option<&str>, resname: &str, dcname: &str) -> Result<(), PluginError> {
    if plugin_name == OWN_PLUGIN_NAME && resource_name == Some(resname) {
        return Err(PluginError::Config(format!(
            "meta: resource '{resname}': datacenter '{dcname}': not allowed to reference itself"
        )));
    }
    Ok(())
}

/// Synthesizes a `multifo`-shaped hash from a single address or an array of
/// addresses: keys `"1"..="n"`.
fn synthesize_multifo(addrs: &[IpAddr]) -> ConfigValue {
    let mut hash = ConfigValue::hash();
    hash.hash_insert("plugin", ConfigValue::scalar("multifo"));
    for (i, addr) in addrs.iter().enumerate() {
        hash.hash_insert((i + 1).to_string(), ConfigValue::scalar(addr.to_string()));
    }
    hash
}

/// Inserts `child_cfg` as a new child-plugin stanza, generating its name as
/// `meta_<resname>_<dcname>`, inheriting every resource-level key the child
/// doesn't already define, and failing if the name collides or the target
/// plugin is `meta` itself.
fn inject_child_plugin_config(
    resname: &str,
    dcname: &str,
    mut child_cfg: ConfigValue,
    resource_cfg: &ConfigValue,
    top_plugins: &mut ConfigValue,
) -> Result<(String, String), PluginError> {
    let child_resname = format!("{OWN_PLUGIN_NAME}_{resname}_{dcname}");

    child_cfg.hash_inherit_all(resource_cfg);

    let plugin_name = default_plugin_name(&child_cfg)?;
    reject_self_synthesis(&plugin_name, resname, dcname)?;

    if !top_plugins.hash_contains_key(&plugin_name) {
        top_plugins.hash_insert(plugin_name.clone(), ConfigValue::hash());
    }
    let plug_cfg = top_plugins.hash_get_mut(&plugin_name).expect("just inserted");

    let target_table = if plugin_wants_resources_substanza(&plugin_name) {
        if !plug_cfg.hash_contains_key("resources") {
            plug_cfg.hash_insert("resources", ConfigValue::hash());
        }
        plug_cfg.hash_get_mut("resources").expect("just inserted")
    } else {
        plug_cfg
    };

    if target_table.hash_contains_key(&child_resname) {
        return Err(PluginError::Config(format!(
            "meta: resource '{resname}': datacenter '{dcname}': synthesis of resource '{child_resname}' for plugin '{plugin_name}' failed (resource name already exists)"
        )));
    }
    target_table.hash_insert(child_resname.clone(), child_cfg);

    Ok((child_resname, plugin_name))
}

/// Parses one `dcmap` entry's value into a [`DcTarget`], per spec §4.3's
/// five-way dispatch: hash-as-is, `%plugin!resource`, `!resource`,
/// address-or-array synthesis, or CNAME target scalar.
#[allow(clippy::too_many_arguments)]
fn parse_dc_target(
    resname: &str,
    dcname: &str,
    value: &ConfigValue,
    resource_cfg: &ConfigValue,
    top_plugins: &mut ConfigValue,
    monitors: &Arc<MonitorTable>,
) -> Result<DcTarget, PluginError> {
    match value {
        ConfigValue::Hash(_) => {
            let (child_resname, plugin_name) =
                inject_child_plugin_config(resname, dcname, value.clone(), resource_cfg, top_plugins)?;
            Ok(DcTarget::Plugin {
                plugin_name,
                resource_name: Some(child_resname),
                bound: Mutex::new(None),
            })
        }
        ConfigValue::Array(items) => {
            let addrs = parse_addr_array(resname, dcname, items)?;
            let synthesized = synthesize_multifo(&addrs);
            let (child_resname, plugin_name) =
                inject_child_plugin_config(resname, dcname, synthesized, resource_cfg, top_plugins)?;
            Ok(DcTarget::Plugin {
                plugin_name,
                resource_name: Some(child_resname),
                bound: Mutex::new(None),
            })
        }
        ConfigValue::Scalar(s) => parse_scalar_dc_target(resname, dcname, s, resource_cfg, top_plugins, monitors),
    }
}

fn parse_addr_array(resname: &str, dcname: &str, items: &[ConfigValue]) -> Result<Vec<IpAddr>, PluginError> {
    items
        .iter()
        .map(|item| {
            let s = item.as_str().ok_or_else(|| {
                PluginError::Config(format!(
                    "meta: resource '{resname}': datacenter '{dcname}': array values must all be address strings"
                ))
            })?;
            s.parse::<IpAddr>().map_err(|_| {
                PluginError::Config(format!(
                    "meta: resource '{resname}': datacenter '{dcname}': invalid address '{s}'"
                ))
            })
        })
        .collect()
}

fn parse_scalar_dc_target(
    resname: &str,
    dcname: &str,
    s: &str,
    resource_cfg: &ConfigValue,
    top_plugins: &mut ConfigValue,
    monitors: &Arc<MonitorTable>,
) -> Result<DcTarget, PluginError> {
    if let Some(rest) = s.strip_prefix('%') {
        let (plugin_name, resource_name) = match rest.split_once('!') {
            Some((p, r)) => (p.to_string(), Some(r.to_string())),
            None => (rest.to_string(), None),
        };
        reject_self_reference(&plugin_name, resource_name.as_deref(), resname, dcname)?;
        return Ok(DcTarget::Plugin {
            plugin_name,
            resource_name,
            bound: Mutex::new(None),
        });
    }

    if let Some(rest) = s.strip_prefix('!') {
        let plugin_name = default_plugin_name(resource_cfg)?;
        let resource_name = Some(rest.to_string());
        reject_self_reference(&plugin_name, resource_name.as_deref(), resname, dcname)?;
        return Ok(DcTarget::Plugin {
            plugin_name,
            resource_name,
            bound: Mutex::new(None),
        });
    }

    if let Ok(addr) = s.parse::<IpAddr>() {
        let synthesized = synthesize_multifo(std::slice::from_ref(&addr));
        let (child_resname, plugin_name) =
            inject_child_plugin_config(resname, dcname, synthesized, resource_cfg, top_plugins)?;
        return Ok(DcTarget::Plugin {
            plugin_name,
            resource_name: Some(child_resname),
            bound: Mutex::new(None),
        });
    }

    let dname = Dname::parse(s).map_err(|e| {
        PluginError::Config(format!(
            "meta: resource '{resname}': CNAME for datacenter '{dcname}' is not a legal domainname: {e}"
        ))
    })?;
    let dname_idx = monitors.register_admin(format!("{OWN_PLUGIN_NAME}/{resname}/{dcname}/{s}"));
    Ok(DcTarget::Cname { dname, dname_idx })
}

/// Builds every [`Datacenter`] for one resource's `dcmap`, in the dcmap's
/// own key order (1-based, matching `dc_t* store[1..=num_dcs]`).
pub fn build_datacenters(
    resname: &str,
    dcmap_cfg: &ConfigValue,
    resource_cfg: &ConfigValue,
    top_plugins: &mut ConfigValue,
    monitors: &Arc<MonitorTable>,
) -> Result<Vec<Option<Datacenter>>, PluginError> {
    let entries = dcmap_cfg
        .as_hash()
        .ok_or_else(|| PluginError::Config(format!("meta: resource '{resname}': 'dcmap' must be a hash")))?;

    let mut datacenters: Vec<Option<Datacenter>> = Vec::with_capacity(entries.len() + 1);
    datacenters.push(None); // index 0 reserved
    for (dcname, value) in entries {
        let dc_mon_idx = monitors.register_admin(format!("{OWN_PLUGIN_NAME}/{dcname}"));
        let target = parse_dc_target(resname, dcname, value, resource_cfg, top_plugins, monitors)?;
        datacenters.push(Some(Datacenter {
            name: dcname.clone(),
            target,
            dc_mon_idx,
        }));
    }
    Ok(datacenters)
}
