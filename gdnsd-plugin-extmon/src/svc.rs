// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

use gdnsd_plugin_api::{ConfigValue, PluginError};

/// A named probe command template: `%%ITEM%%` in any arg is replaced with
/// the monitored thing (an address or a CNAME target) at bind time.
#[derive(Debug, Clone)]
pub struct ServiceType {
    pub name: String,
    pub args: Vec<String>,
    pub interval: u32,
    pub timeout: u32,
}

const ITEM_PLACEHOLDER: &str = "%%ITEM%%";

impl ServiceType {
    pub fn from_config(
        name: &str,
        cfg: &ConfigValue,
        interval: u32,
        timeout: u32,
    ) -> Result<Self, PluginError> {
        let cmd_cfg = cfg.hash_get("cmd").ok_or_else(|| {
            PluginError::Config(format!("extmon: service_type '{name}': 'cmd' must be defined"))
        })?;
        let items = cmd_cfg.as_array().ok_or_else(|| {
            PluginError::Config(format!("extmon: service_type '{name}': 'cmd' must be an array"))
        })?;
        if items.is_empty() {
            return Err(PluginError::Config(format!(
                "extmon: service_type '{name}': 'cmd' cannot be an empty array"
            )));
        }
        let mut args = Vec::with_capacity(items.len());
        for item in items {
            let s = item.as_str().ok_or_else(|| {
                PluginError::Config(format!(
                    "extmon: service_type '{name}': all 'cmd' elements must be simple strings"
                ))
            })?;
            args.push(s.to_string());
        }

        Ok(ServiceType {
            name: name.to_string(),
            args,
            interval,
            timeout,
        })
    }

    /// Substitutes the monitored thing into every arg that mentions
    /// `%%ITEM%%`, producing the argv handed to the helper for one probe.
    pub fn bind_args(&self, thing: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace(ITEM_PLACEHOLDER, thing))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ConfigValue {
        let mut c = ConfigValue::hash();
        c.hash_insert(
            "cmd",
            ConfigValue::array(vec![
                ConfigValue::scalar("/usr/lib/gdnsd/probes/tcp"),
                ConfigValue::scalar("%%ITEM%%"),
                ConfigValue::scalar("80"),
            ]),
        );
        c
    }

    #[test]
    fn parses_and_binds() {
        let svc = ServiceType::from_config("tcp80", &cfg(), 5, 3).unwrap();
        let bound = svc.bind_args("192.0.2.1");
        assert_eq!(bound, vec!["/usr/lib/gdnsd/probes/tcp", "192.0.2.1", "80"]);
    }

    #[test]
    fn empty_cmd_rejected() {
        let mut c = ConfigValue::hash();
        c.hash_insert("cmd", ConfigValue::array(vec![]));
        assert!(ServiceType::from_config("x", &c, 5, 3).is_err());
    }
}
