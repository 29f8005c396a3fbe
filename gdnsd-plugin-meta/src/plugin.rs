// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! `MetaPlugin`: C3 as a single `ResolverPlugin` implementation, covering
//! both of gdnsd's `geoip`/`metafo` variants (spec §4.3's `CB_LOAD_CONFIG`/
//! `CB_MAP`/`CB_RES` — the `geoip` vs. `metafo` split in the original was
//! purely which `DcMap` got linked in via a C preprocessor trick; here
//! that's just the `DcMap` trait object stored per resource).

use std::sync::{Arc, Mutex};

use gdnsd_plugin_api::{
    ClientInfo, ConfigValue, Dname, DynResult, MonitorTable, PluginError, PluginRegistry, ResolverPlugin,
};
use gdnsd_sttl::Sttl;

use crate::dcmap::{DcMap, FixedOrderMap};
use crate::resource::{BoundChild, DcTarget, Resource};
use crate::rewrite::build_datacenters;

const DC_SHIFT: u32 = 24;
const RES_MASK: u32 = 0x00FF_FFFF;
const DC_MASK: u32 = 0xFF00_0000;
const MAX_RESOURCES: usize = 1 << 24;
const MAX_TTL: u32 = (1 << 24) - 1;

/// The meta/geo resolution engine. Config-load-time rewriting
/// ([`MetaPlugin::configure`]) needs mutable access to a sibling top-level
/// `plugins` config tree that the generic [`ResolverPlugin::load_config`]
/// signature has no room for, so the daemon calls `configure` directly on
/// the concrete type before boxing this into the shared
/// [`PluginRegistry`]; thereafter it's driven purely through the trait.
#[derive(Default)]
pub struct MetaPlugin {
    resources: Vec<Resource>,
    maps: Vec<Box<dyn DcMap>>,
    registry: Option<Arc<Mutex<PluginRegistry>>>,
    monitors: Option<Arc<MonitorTable>>,
}

impl MetaPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// The config-rewriting load phase (spec §4.3 "Configuration
    /// rewriting"). `top_plugins` is the daemon's full top-level `plugins`
    /// table; synthesized child stanzas are inserted into it directly, so
    /// this must run before the daemon loads any other plugin's config.
    pub fn configure(
        &mut self,
        own_config: &ConfigValue,
        top_plugins: &mut ConfigValue,
        monitors: &Arc<MonitorTable>,
        registry: Arc<Mutex<PluginRegistry>>,
    ) -> Result<(), PluginError> {
        let resources_cfg = own_config
            .hash_get("resources")
            .ok_or_else(|| PluginError::Config("meta: config has no 'resources' stanza".to_string()))?;
        let entries = resources_cfg
            .as_hash()
            .ok_or_else(|| PluginError::Config("meta: 'resources' stanza must be a hash".to_string()))?;

        if entries.len() > MAX_RESOURCES {
            return Err(PluginError::Config(format!(
                "meta: maximum number of resources ({MAX_RESOURCES}) exceeded"
            )));
        }

        for (resname, raw_res_cfg) in entries {
            if resname.contains('/') {
                return Err(PluginError::Config(format!(
                    "meta: resource name '{resname}' must not contain '/'"
                )));
            }

            let mut res_cfg = raw_res_cfg.clone();
            if !res_cfg.is_hash() {
                return Err(PluginError::Config(format!(
                    "meta: the value of resource '{resname}' must be a hash"
                )));
            }
            // cascade plugin-level keys down into the resource, excluding
            // 'resources' itself (own_config's sibling-resource table would
            // otherwise self-embed into every resource's config).
            let mut plugin_level = own_config.clone();
            if let ConfigValue::Hash(entries) = &mut plugin_level {
                entries.retain(|(k, _)| k != "resources");
            }
            res_cfg.hash_inherit_all(&plugin_level);

            let dcmap_cfg = res_cfg
                .hash_get("dcmap")
                .ok_or_else(|| PluginError::Config(format!("meta: resource '{resname}': missing required stanza 'dcmap'")))?
                .clone();

            let dc_names: Vec<String> = dcmap_cfg
                .as_hash()
                .ok_or_else(|| PluginError::Config(format!("meta: resource '{resname}': 'dcmap' must be a hash")))?
                .iter()
                .map(|(k, _)| k.clone())
                .collect();
            if dc_names.is_empty() {
                return Err(PluginError::Config(format!(
                    "meta: resource '{resname}': 'dcmap' must define at least one datacenter"
                )));
            }
            let map_number = self.maps.len();
            self.maps.push(Box::new(FixedOrderMap::new(dc_names)));

            let datacenters = build_datacenters(resname, &dcmap_cfg, &res_cfg, top_plugins, monitors)?;

            self.resources.push(Resource {
                name: resname.clone(),
                map_number,
                datacenters,
            });
        }

        self.monitors = Some(monitors.clone());
        self.registry = Some(registry);
        Ok(())
    }

    fn resolve_dc(
        &self,
        snapshot: &gdnsd_sttl::SttlSnapshot,
        dc: &crate::resource::Datacenter,
        thread_num: usize,
        origin: Option<&Dname>,
        client: &ClientInfo,
        result: &mut DynResult,
    ) -> Sttl {
        let rv = match &dc.target {
            DcTarget::Cname { dname, dname_idx } => {
                result.is_cname = true;
                let full = if dname.is_partial() {
                    dname
                        .complete(origin.expect("CB_MAP rejects CNAME datacenters used without an origin"))
                        .expect("CB_MAP validates CNAME completion before binding")
                } else {
                    dname.clone()
                };
                result.cname = Some(full);
                snapshot.get(*dname_idx)
            }
            DcTarget::Plugin { bound, plugin_name, .. } => {
                let guard = bound.lock().unwrap_or_else(|e| e.into_inner());
                let b = guard
                    .as_ref()
                    .unwrap_or_else(|| panic!("datacenter delegating to '{plugin_name}' was never bound by map_res"));
                let plugin = b.plugin.lock().unwrap_or_else(|e| e.into_inner());
                plugin.resolve(thread_num, b.res_num, origin, client, result)
            }
        };
        Sttl::min2(rv, snapshot.get(dc.dc_mon_idx))
    }

    fn bind_datacenter(&self, dc: &crate::resource::Datacenter, origin: Option<&Dname>) -> Result<(), PluginError> {
        match &dc.target {
            DcTarget::Cname { dname, .. } => {
                let origin = origin.ok_or_else(|| {
                    PluginError::MapRes(format!(
                        "datacenter '{}' is a fixed CNAME, cannot be used in an address-only usage",
                        dc.name
                    ))
                })?;
                if dname.is_partial() {
                    dname.complete(origin).map_err(|e| {
                        PluginError::MapRes(format!(
                            "datacenter '{}': CNAME completion at this origin failed: {e}",
                            dc.name
                        ))
                    })?;
                }
                Ok(())
            }
            DcTarget::Plugin {
                plugin_name,
                resource_name,
                bound,
            } => {
                let mut guard = bound.lock().unwrap_or_else(|e| e.into_inner());
                if guard.is_some() {
                    return Ok(());
                }
                let registry = self
                    .registry
                    .as_ref()
                    .ok_or_else(|| PluginError::MapRes("meta plugin used before configure()".to_string()))?;
                let handle = {
                    let reg = registry.lock().unwrap_or_else(|e| e.into_inner());
                    reg.find(plugin_name)
                        .ok_or_else(|| PluginError::MapRes(format!("invalid plugin name '{plugin_name}'")))?
                };
                let res_num = {
                    let mut child = handle.lock().unwrap_or_else(|e| e.into_inner());
                    child.map_res(resource_name.as_deref(), origin)?
                };
                *guard = Some(BoundChild { plugin: handle, res_num });
                Ok(())
            }
        }
    }
}

impl ResolverPlugin for MetaPlugin {
    fn name(&self) -> &'static str {
        "meta"
    }

    fn load_config(&mut self, _config: Option<&ConfigValue>, _monitors: &Arc<MonitorTable>) -> Result<(), PluginError> {
        if self.resources.is_empty() {
            return Err(PluginError::Config(
                "meta: must be loaded via MetaPlugin::configure() (which needs mutable access to the sibling \
                 top-level plugins table), not the generic load_config entry point"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn map_res(&mut self, resource_name: Option<&str>, origin: Option<&Dname>) -> Result<u32, PluginError> {
        let resource_name =
            resource_name.ok_or_else(|| PluginError::MapRes("meta: a resource name is required".to_string()))?;
        let (base_name, dc_name) = match resource_name.split_once('/') {
            Some((r, d)) => (r, Some(d)),
            None => (resource_name, None),
        };

        let idx = self
            .resources
            .iter()
            .position(|r| r.name == base_name)
            .ok_or_else(|| PluginError::MapRes(format!("meta: invalid resource name '{base_name}'")))?;

        let fixed_dc_idx: u8 = match dc_name {
            Some(dcn) => {
                let map = &self.maps[self.resources[idx].map_number];
                map.dc_index(dcn).ok_or_else(|| {
                    PluginError::MapRes(format!(
                        "meta: synthetic resource '{base_name}/{dcn}': datacenter '{dcn}' does not exist for this resource"
                    ))
                })?
            }
            None => 0,
        };

        let (min_dc, max_dc) = if fixed_dc_idx != 0 {
            (fixed_dc_idx, fixed_dc_idx)
        } else {
            (1u8, self.resources[idx].num_dcs() as u8)
        };

        for j in min_dc..=max_dc {
            let dc = self.resources[idx]
                .dc(j)
                .unwrap_or_else(|| panic!("resource '{base_name}' datacenter index {j} missing"));
            self.bind_datacenter(dc, origin)?;
        }

        let mut encoded = idx as u32;
        if fixed_dc_idx != 0 {
            encoded |= (fixed_dc_idx as u32) << DC_SHIFT;
        }
        Ok(encoded)
    }

    fn resolve(
        &self,
        thread_num: usize,
        res_num: u32,
        origin: Option<&Dname>,
        client: &ClientInfo,
        result: &mut DynResult,
    ) -> Sttl {
        let synth_dc = ((res_num & DC_MASK) >> DC_SHIFT) as u8;
        let resnum = res_num & RES_MASK;
        let res = &self.resources[resnum as usize];

        let monitors = self.monitors.as_ref().expect("configure() runs before any query");
        let snapshot = monitors.snapshot();

        let (dclist, scope_hint): (Vec<u8>, u8) = if synth_dc != 0 {
            (vec![synth_dc], 0)
        } else {
            self.maps[res.map_number].dclist(client)
        };

        result.reset();
        let mut rv = Sttl::up(MAX_TTL);

        if let Some(&first_dc) = dclist.first() {
            for &dc_idx in &dclist {
                result.reset();
                let dc = res.dc(dc_idx).expect("map produced a dc index out of range");
                let this_rv = self.resolve_dc(&snapshot, dc, thread_num, origin, client, result);
                rv = Sttl::min2(rv, this_rv);
                if !this_rv.is_down() {
                    rv = rv.with_down(false);
                    break;
                }
            }

            if rv.is_down() {
                result.reset();
                let dc0 = res.dc(first_dc).expect("map produced a dc index out of range");
                self.resolve_dc(&snapshot, dc0, thread_num, origin, client, result);
            }
        }

        if scope_hint > result.edns_scope_mask {
            result.edns_scope_mask = scope_hint;
        }

        rv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gdnsd_plugin_multifo::MultifoPlugin;
    use std::net::IpAddr;

    fn client() -> ClientInfo {
        ClientInfo {
            client_addr: "203.0.113.1".parse::<IpAddr>().unwrap(),
            edns_subnet: None,
            thread_num: 0,
        }
    }

    fn build_config(dcmap_entries: Vec<(&str, ConfigValue)>) -> ConfigValue {
        let mut dcmap = ConfigValue::hash();
        for (k, v) in dcmap_entries {
            dcmap.hash_insert(k, v);
        }
        let mut web = ConfigValue::hash();
        web.hash_insert("dcmap", dcmap);

        let mut resources = ConfigValue::hash();
        resources.hash_insert("web", web);

        let mut top = ConfigValue::hash();
        top.hash_insert("resources", resources);
        top
    }

    fn setup(
        dcmap_entries: Vec<(&str, ConfigValue)>,
    ) -> (MetaPlugin, Arc<MonitorTable>, Arc<Mutex<PluginRegistry>>, ConfigValue) {
        let monitors = Arc::new(MonitorTable::new());
        let registry = Arc::new(Mutex::new(PluginRegistry::new()));
        registry.lock().unwrap().register(Box::new(MultifoPlugin::new()));

        let own_config = build_config(dcmap_entries);
        let mut top_plugins = ConfigValue::hash();
        top_plugins.hash_insert("multifo", ConfigValue::hash());

        let mut meta = MetaPlugin::new();
        meta.configure(&own_config, &mut top_plugins, &monitors, registry.clone())
            .unwrap();

        // now load multifo with whatever meta synthesized into it
        let multifo_cfg = top_plugins.hash_get("multifo").unwrap().clone();
        let handle = registry.lock().unwrap().find("multifo").unwrap();
        handle.lock().unwrap().load_config(Some(&multifo_cfg), &monitors).unwrap();

        (meta, monitors, registry, top_plugins)
    }

    #[test]
    fn synthesizes_multifo_for_plain_address() {
        let (mut meta, _monitors, _registry, _top) =
            setup(vec![("us", ConfigValue::scalar("192.0.2.1")), ("eu", ConfigValue::scalar("192.0.2.2"))]);

        let res_num = meta.map_res(Some("web"), None).unwrap();
        let mut result = DynResult::default();
        let sttl = meta.resolve(0, res_num, None, &client(), &mut result);
        assert!(!sttl.is_down());
        assert!(result.addrs.contains(&"192.0.2.1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn datacenter_iteration_picks_first_up() {
        let (mut meta, monitors, _registry, _top) = setup(vec![
            ("a", ConfigValue::scalar("192.0.2.1")),
            ("b", ConfigValue::scalar("192.0.2.2")),
            ("c", ConfigValue::scalar("192.0.2.3")),
        ]);
        let res_num = meta.map_res(Some("web"), None).unwrap();

        // force 'a' and 'c' down via their per-dc admin monitor
        let dc_a_idx = meta.resources[0].dc(1).unwrap().dc_mon_idx;
        let dc_c_idx = meta.resources[0].dc(3).unwrap().dc_mon_idx;
        monitors.update(dc_a_idx, false);
        monitors.update(dc_c_idx, false);

        let mut result = DynResult::default();
        let sttl = meta.resolve(0, res_num, None, &client(), &mut result);
        assert!(!sttl.is_down());
        assert!(result.addrs.contains(&"192.0.2.2".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn all_down_returns_first_dc_with_down_flag() {
        let (mut meta, monitors, _registry, _top) = setup(vec![
            ("a", ConfigValue::scalar("192.0.2.1")),
            ("b", ConfigValue::scalar("192.0.2.2")),
        ]);
        let res_num = meta.map_res(Some("web"), None).unwrap();

        let dc_a_idx = meta.resources[0].dc(1).unwrap().dc_mon_idx;
        let dc_b_idx = meta.resources[0].dc(2).unwrap().dc_mon_idx;
        monitors.update(dc_a_idx, false);
        monitors.update(dc_b_idx, false);

        let mut result = DynResult::default();
        let sttl = meta.resolve(0, res_num, None, &client(), &mut result);
        assert!(sttl.is_down());
        assert!(result.addrs.contains(&"192.0.2.1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn synthetic_sub_resource_always_picks_named_dc() {
        let (mut meta, _monitors, _registry, _top) = setup(vec![
            ("a", ConfigValue::scalar("192.0.2.1")),
            ("b", ConfigValue::scalar("192.0.2.2")),
            ("c", ConfigValue::scalar("192.0.2.3")),
        ]);
        let res_num = meta.map_res(Some("web/b"), None).unwrap();
        assert_ne!(res_num & DC_MASK, 0);

        let mut result = DynResult::default();
        meta.resolve(0, res_num, None, &client(), &mut result);
        assert_eq!(result.addrs, vec!["192.0.2.2".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn admin_floor_forces_down_even_if_child_up() {
        let (mut meta, monitors, _registry, _top) = setup(vec![("us", ConfigValue::scalar("192.0.2.1"))]);
        let res_num = meta.map_res(Some("web"), None).unwrap();

        let dc_idx = meta.resources[0].dc(1).unwrap().dc_mon_idx;
        monitors.update(dc_idx, false);

        let mut result = DynResult::default();
        let sttl = meta.resolve(0, res_num, None, &client(), &mut result);
        assert!(sttl.is_down());
    }

    #[test]
    fn partial_cname_completes_with_origin() {
        let (mut meta, _monitors, _registry, _top) = setup(vec![("us", ConfigValue::scalar("foo"))]);
        let origin = Dname::parse("example.com.").unwrap();
        let res_num = meta.map_res(Some("web"), Some(&origin)).unwrap();

        let mut result = DynResult::default();
        let sttl = meta.resolve(0, res_num, Some(&origin), &client(), &mut result);
        assert!(!sttl.is_down());
        assert!(result.is_cname);
        assert_eq!(result.cname.unwrap().as_str(), "foo.example.com.");
    }

    #[test]
    fn partial_cname_without_origin_rejected_at_map_res() {
        let (mut meta, _monitors, _registry, _top) = setup(vec![("us", ConfigValue::scalar("foo"))]);
        assert!(meta.map_res(Some("web"), None).is_err());
    }

    #[test]
    fn self_reference_rejected() {
        let monitors = Arc::new(MonitorTable::new());
        let registry = Arc::new(Mutex::new(PluginRegistry::new()));

        let mut dcmap = ConfigValue::hash();
        dcmap.hash_insert("us", ConfigValue::scalar("%meta!web"));
        let mut web = ConfigValue::hash();
        web.hash_insert("dcmap", dcmap);
        let mut resources = ConfigValue::hash();
        resources.hash_insert("web", web);
        let mut top = ConfigValue::hash();
        top.hash_insert("resources", resources);

        let mut top_plugins = ConfigValue::hash();
        let mut meta = MetaPlugin::new();
        let err = meta.configure(&top, &mut top_plugins, &monitors, registry);
        assert!(err.is_err());
    }

    #[test]
    fn resource_name_with_slash_rejected() {
        let monitors = Arc::new(MonitorTable::new());
        let registry = Arc::new(Mutex::new(PluginRegistry::new()));

        let mut dcmap = ConfigValue::hash();
        dcmap.hash_insert("us", ConfigValue::scalar("192.0.2.1"));
        let mut web = ConfigValue::hash();
        web.hash_insert("dcmap", dcmap);
        let mut resources = ConfigValue::hash();
        resources.hash_insert("we/b", web);
        let mut top = ConfigValue::hash();
        top.hash_insert("resources", resources);

        let mut top_plugins = ConfigValue::hash();
        let mut meta = MetaPlugin::new();
        assert!(meta.configure(&top, &mut top_plugins, &monitors, registry).is_err());
    }
}
