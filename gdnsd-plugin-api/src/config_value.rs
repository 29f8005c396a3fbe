// Copyright © 2024 The gdnsd-core Contributors
//
// This file is part of gdnsd.
//
// gdnsd is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! A small configuration-value tree, standing in for gdnsd's `vscf`, which
//! every plugin's config stanza and the meta/geo engine's config-rewriting
//! pass operate on. Modeled as a plain owned tree with no back-pointers;
//! callers needing parent context thread it explicitly through their own
//! walker rather than calling a `vscf_get_parent`-style accessor.

use std::fmt;

/// An ordered hash (insertion order is preserved and iterable), an array, or
/// a scalar string — the three shapes gdnsd's `vscf` distinguishes.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Hash(Vec<(String, ConfigValue)>),
    Array(Vec<ConfigValue>),
    Scalar(String),
}

impl ConfigValue {
    pub fn hash() -> Self {
        ConfigValue::Hash(Vec::new())
    }

    pub fn scalar(s: impl Into<String>) -> Self {
        ConfigValue::Scalar(s.into())
    }

    pub fn array(items: Vec<ConfigValue>) -> Self {
        ConfigValue::Array(items)
    }

    pub fn is_hash(&self) -> bool {
        matches!(self, ConfigValue::Hash(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, ConfigValue::Array(_))
    }

    pub fn is_simple(&self) -> bool {
        matches!(self, ConfigValue::Scalar(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[ConfigValue]> {
        match self {
            ConfigValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_hash(&self) -> Option<&[(String, ConfigValue)]> {
        match self {
            ConfigValue::Hash(entries) => Some(entries),
            _ => None,
        }
    }

    pub fn hash_get(&self, key: &str) -> Option<&ConfigValue> {
        match self {
            ConfigValue::Hash(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn hash_get_mut(&mut self, key: &str) -> Option<&mut ConfigValue> {
        match self {
            ConfigValue::Hash(entries) => entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Inserts or replaces `key` in a hash. Panics if `self` is not a hash;
    /// callers are expected to have checked `is_hash()` first, mirroring
    /// vscf's hash-only mutators.
    pub fn hash_insert(&mut self, key: impl Into<String>, value: ConfigValue) {
        let ConfigValue::Hash(entries) = self else {
            panic!("hash_insert called on a non-hash ConfigValue");
        };
        let key = key.into();
        if let Some(existing) = entries.iter_mut().find(|(k, _)| *k == key) {
            existing.1 = value;
        } else {
            entries.push((key, value));
        }
    }

    pub fn hash_contains_key(&self, key: &str) -> bool {
        self.hash_get(key).is_some()
    }

    pub fn hash_keys(&self) -> impl Iterator<Item = &str> {
        match self {
            ConfigValue::Hash(entries) => entries.iter().map(|(k, _)| k.as_str()),
            _ => [].iter().map(|_: &(String, ConfigValue)| unreachable!()),
        }
    }

    pub fn hash_len(&self) -> usize {
        match self {
            ConfigValue::Hash(entries) => entries.len(),
            _ => 0,
        }
    }

    /// Copies every key from `other` into `self` that `self` doesn't
    /// already define, mirroring vscf's `vscf_hash_inherit_all` used both to
    /// cascade the top-level config down into each resource, and each
    /// resource down into its synthesized child-plugin stanzas.
    pub fn hash_inherit_all(&mut self, other: &ConfigValue) {
        let Some(other_entries) = other.as_hash() else {
            return;
        };
        for (k, v) in other_entries {
            if !self.hash_contains_key(k) {
                self.hash_insert(k.clone(), v.clone());
            }
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Hash(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            ConfigValue::Array(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            ConfigValue::Scalar(s) => write!(f, "{s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_insert_and_get() {
        let mut h = ConfigValue::hash();
        h.hash_insert("a", ConfigValue::scalar("1"));
        assert_eq!(h.hash_get("a").unwrap().as_str(), Some("1"));
        assert!(h.hash_get("b").is_none());
    }

    #[test]
    fn inherit_all_does_not_override_existing_keys() {
        let mut child = ConfigValue::hash();
        child.hash_insert("plugin", ConfigValue::scalar("multifo"));
        let mut parent = ConfigValue::hash();
        parent.hash_insert("plugin", ConfigValue::scalar("weighted"));
        parent.hash_insert("ttl", ConfigValue::scalar("300"));

        child.hash_inherit_all(&parent);
        assert_eq!(child.hash_get("plugin").unwrap().as_str(), Some("multifo"));
        assert_eq!(child.hash_get("ttl").unwrap().as_str(), Some("300"));
    }
}
