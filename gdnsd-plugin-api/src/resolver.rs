// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! The child-plugin capability record: a trait object storing the two
//! operations (`map_res`, `resolve`) a resolver plugin exposes, cached at
//! each call site after load so the hot path never does a runtime name
//! lookup.

use std::net::IpAddr;
use std::sync::Arc;

use gdnsd_sttl::{MonitorTable, Sttl};
use thiserror::Error;

use crate::config_value::ConfigValue;
use crate::dname::Dname;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    MapRes(String),
}

/// Everything a resolver plugin's `resolve` call needs to know about the
/// querier. The full EDNS client-subnet/real-IP machinery lives in the
/// (excluded) DNS wire codec; this carries just the fields the meta/geo
/// engine and its children need.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_addr: IpAddr,
    /// EDNS client subnet, if the query carried one: (subnet address,
    /// prefix length as sent by the resolver).
    pub edns_subnet: Option<(IpAddr, u8)>,
    pub thread_num: usize,
}

/// The result of resolving one datacenter: either a CNAME or an address
/// set, plus the EDNS client-subnet scope mask the resolving plugin wants
/// to assert.
#[derive(Debug, Clone, Default)]
pub struct DynResult {
    pub is_cname: bool,
    pub cname: Option<Dname>,
    pub addrs: Vec<IpAddr>,
    pub edns_scope_mask: u8,
}

impl DynResult {
    pub fn reset(&mut self) {
        *self = DynResult::default();
    }
}

/// The capability record every resolver plugin implements; gdnsd's
/// original dispatches these by name through a dlopen'd symbol table
/// (`gdnsd_plugin_find`), cached once per datacenter after the name lookup
/// at `CB_MAP`/load time. Here that becomes an ordinary trait object.
pub trait ResolverPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Loads this plugin's own top-level `plugins => { <name> => {...} }`
    /// stanza. `config` is `None` when the plugin has no stanza at all,
    /// which is permitted for monitoring-only plugins. `monitors` is
    /// handed over as an `Arc` rather than a borrow so that a plugin that
    /// needs to read monitor state from its `resolve` (not just register
    /// new monitors here) can retain its own clone of the handle.
    fn load_config(
        &mut self,
        config: Option<&ConfigValue>,
        monitors: &Arc<MonitorTable>,
    ) -> Result<(), PluginError>;

    /// Resolves `resource_name` (and, for `DYNC`-style uses, `origin`) to a
    /// plugin-private resource number. `origin` is `None` for address-only
    /// (`DYNA`) usages; a plugin that can only produce a CNAME should
    /// reject those calls.
    fn map_res(
        &mut self,
        resource_name: Option<&str>,
        origin: Option<&Dname>,
    ) -> Result<u32, PluginError>;

    /// Resolves one query against a previously-mapped resource number.
    fn resolve(
        &self,
        thread_num: usize,
        res_num: u32,
        origin: Option<&Dname>,
        client: &ClientInfo,
        result: &mut DynResult,
    ) -> Sttl;
}

/// A name-indexed table of loaded child plugins, used by the meta/geo
/// engine (and the daemon at large) to look a plugin up once at load time
/// and cache the resulting handle thereafter, avoiding a name lookup on
/// the hot path.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<(String, std::sync::Arc<std::sync::Mutex<Box<dyn ResolverPlugin>>>)>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Box<dyn ResolverPlugin>) {
        let name = plugin.name().to_string();
        self.plugins
            .push((name, std::sync::Arc::new(std::sync::Mutex::new(plugin))));
    }

    pub fn find(&self, name: &str) -> Option<std::sync::Arc<std::sync::Mutex<Box<dyn ResolverPlugin>>>> {
        self.plugins
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.clone())
    }
}
