// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! The meta/geo resolution engine (C3): resources made of named
//! datacenters, each either a fixed CNAME or a delegation to another
//! loaded plugin's resource, with config-load-time rewriting that
//! synthesizes those child stanzas on the fly from inline addresses.

mod dcmap;
mod plugin;
mod resource;
mod rewrite;

pub use dcmap::{DcIndex, DcMap, FixedOrderMap};
pub use plugin::MetaPlugin;
pub use resource::{BoundChild, DcTarget, Datacenter, Resource};
