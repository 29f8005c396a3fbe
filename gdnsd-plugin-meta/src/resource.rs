// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! The data model of C3: a [`Resource`] is a dense array of [`Datacenter`]s
//! addressed by a 1-based index (index 0 is reserved, mirroring
//! `meta_core.c`'s `dc_t* store = calloc(num_dcs + 1, ...)`); each
//! datacenter is either a fixed CNAME or a delegation to a loaded child
//! plugin, resolved late the first time [`super::plugin::MetaPlugin::map_res`]
//! touches it.

use std::sync::Arc;
use std::sync::Mutex;

use gdnsd_plugin_api::{Dname, MonitorIndex, ResolverPlugin};

/// What a datacenter resolves to, per spec §3's "exactly one of {fixed
/// CNAME, child plugin delegation}" invariant.
pub enum DcTarget {
    /// A direct CNAME; `dname` may still be partial until used at a
    /// resolution site with an origin.
    Cname {
        dname: Dname,
        /// Admin-state index for this (resource, dc, target) triple.
        dname_idx: MonitorIndex,
    },
    /// A delegation to a named child plugin's named resource, bound once at
    /// `CB_MAP` time into a live handle + resource number.
    Plugin {
        plugin_name: String,
        resource_name: Option<String>,
        /// Populated on first use; `None` before late binding runs.
        bound: Mutex<Option<BoundChild>>,
    },
}

/// The result of resolving a plugin delegation's name to a live handle,
/// cached so the hot resolve path never repeats a name lookup (spec §9
/// "Plugin dispatch").
pub struct BoundChild {
    pub plugin: Arc<Mutex<Box<dyn ResolverPlugin>>>,
    pub res_num: u32,
}

pub struct Datacenter {
    pub name: String,
    pub target: DcTarget,
    /// Per-datacenter admin-forced state, independent of `Cname::dname_idx`.
    pub dc_mon_idx: MonitorIndex,
}

impl Datacenter {
    pub fn is_cname(&self) -> bool {
        matches!(self.target, DcTarget::Cname { .. })
    }
}

/// A named resolution policy: a map number (opaque to this crate; see
/// [`crate::dcmap::DcMap`]) plus a dense, 1-indexed datacenter array.
pub struct Resource {
    pub name: String,
    pub map_number: usize,
    /// Index 0 is an unused placeholder; real datacenters occupy 1..=len.
    pub datacenters: Vec<Option<Datacenter>>,
}

impl Resource {
    pub fn num_dcs(&self) -> usize {
        self.datacenters.len() - 1
    }

    pub fn dc(&self, idx: u8) -> Option<&Datacenter> {
        self.datacenters.get(idx as usize)?.as_ref()
    }
}
