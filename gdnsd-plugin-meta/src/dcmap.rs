// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Datacenter ordering: given a querier, produce the priority order in
//! which its datacenters should be tried. gdnsd's `geoip` plugin answers
//! this from a geo database; this crate ships only the
//! datacenter-agnostic ordering every `metafo`-style config also
//! supports, since reproducing a geo database lookup is out of scope
//! here.

use gdnsd_plugin_api::ClientInfo;

/// 1-based datacenter index, matching the wire encoding's "upper 8 bits
/// of a synthetic resource number" convention: 0 means "no such
/// datacenter".
pub type DcIndex = u8;

pub trait DcMap: Send + Sync {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn dc_index(&self, name: &str) -> Option<DcIndex>;
    fn dc_name(&self, idx: DcIndex) -> Option<&str>;
    /// Priority order of datacenters to try for this client, plus the
    /// EDNS client-subnet scope mask this decision is valid for (0 if the
    /// map doesn't key on subnet at all).
    fn dclist(&self, client: &ClientInfo) -> (Vec<DcIndex>, u8);
}

/// A `DcMap` with a single fixed priority order, identical for every
/// client. Matches `metafo`'s plain (non-geo) datacenter list semantics.
pub struct FixedOrderMap {
    names: Vec<String>,
}

impl FixedOrderMap {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }
}

impl DcMap for FixedOrderMap {
    fn len(&self) -> usize {
        self.names.len()
    }

    fn dc_index(&self, name: &str) -> Option<DcIndex> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| (i + 1) as DcIndex)
    }

    fn dc_name(&self, idx: DcIndex) -> Option<&str> {
        if idx == 0 {
            return None;
        }
        self.names.get(idx as usize - 1).map(|s| s.as_str())
    }

    fn dclist(&self, _client: &ClientInfo) -> (Vec<DcIndex>, u8) {
        ((1..=self.names.len() as DcIndex).collect(), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn client() -> ClientInfo {
        ClientInfo {
            client_addr: "203.0.113.1".parse::<IpAddr>().unwrap(),
            edns_subnet: None,
            thread_num: 0,
        }
    }

    #[test]
    fn fixed_order_round_trips_names() {
        let m = FixedOrderMap::new(vec!["us".into(), "eu".into()]);
        assert_eq!(m.dc_index("us"), Some(1));
        assert_eq!(m.dc_index("eu"), Some(2));
        assert_eq!(m.dc_index("ap"), None);
        assert_eq!(m.dc_name(1), Some("us"));
        let (list, mask) = m.dclist(&client());
        assert_eq!(list, vec![1, 2]);
        assert_eq!(mask, 0);
    }
}
