// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The namespaced key/value store backing answer caches, hint caches and
//! dynamic peer registrations. Values are opaque strings; every row's
//! expiry is encoded inside the value by the caller.

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use dashmap::DashMap;
use enum_dispatch::enum_dispatch;
use serde_json::{Map, Value};
use tracing::warn;

/// Namespace for cached answers and hints.
pub const FAMILY_CACHE: &str = "dundi/cache";
/// Namespace for dynamic peer registrations.
pub const FAMILY_DPEERS: &str = "dundi/dpeers";

/// Operations the engine needs from its persistence layer.
#[enum_dispatch]
pub trait KvStore {
    fn get(&self, family: &str, key: &str) -> Option<String>;
    fn put(&self, family: &str, key: &str, value: &str);
    fn del(&self, family: &str, key: &str);
    /// Removes every key beneath `subtree` (or the whole family).
    fn deltree(&self, family: &str, subtree: Option<&str>);
}

/// The configured store backend.
#[enum_dispatch(KvStore)]
#[derive(Debug, Clone)]
pub enum Store {
    Memory(MemStore),
    JsonFile(JsonFileStore),
}

impl Store {
    pub fn memory() -> Self {
        Store::Memory(MemStore::default())
    }

    pub fn json_file(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Store::JsonFile(JsonFileStore::open(path.into())?))
    }
}

/// Volatile in-memory backend.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    map: Arc<DashMap<(String, String), String>>,
}

impl KvStore for MemStore {
    fn get(&self, family: &str, key: &str) -> Option<String> {
        self.map
            .get(&(family.to_string(), key.to_string()))
            .map(|v| v.clone())
    }

    fn put(&self, family: &str, key: &str, value: &str) {
        self.map
            .insert((family.to_string(), key.to_string()), value.to_string());
    }

    fn del(&self, family: &str, key: &str) {
        self.map.remove(&(family.to_string(), key.to_string()));
    }

    fn deltree(&self, family: &str, subtree: Option<&str>) {
        self.map.retain(|(fam, key), _| {
            fam != family || subtree.is_some_and(|prefix| !key.starts_with(prefix))
        });
    }
}

/// A backend persisting the whole map to one JSON file. Every mutation
/// rewrites the snapshot through a temp file; the data set (cache rows +
/// registrations) stays small enough for that to be the simple, durable
/// choice.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: Arc<PathBuf>,
    map: Arc<DashMap<(String, String), String>>,
}

impl JsonFileStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let map = DashMap::new();
        if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read store {path:?}"))?;
            let parsed: Map<String, Value> =
                serde_json::from_str(&raw).context("failed to parse store snapshot")?;
            for (family, keys) in parsed {
                let Value::Object(keys) = keys else {
                    warn!(%family, "ignoring malformed store family");
                    continue;
                };
                for (key, value) in keys {
                    if let Value::String(value) = value {
                        map.insert((family.clone(), key), value);
                    }
                }
            }
        }
        Ok(JsonFileStore {
            path: Arc::new(path),
            map: Arc::new(map),
        })
    }

    fn flush(&self) {
        let mut families: Map<String, Value> = Map::new();
        for entry in self.map.iter() {
            let (family, key) = entry.key();
            let slot = families
                .entry(family.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(keys) = slot {
                keys.insert(key.clone(), Value::String(entry.value().clone()));
            }
        }
        let tmp = self.path.with_extension("tmp");
        let body = match serde_json::to_string_pretty(&families) {
            Ok(body) => body,
            Err(e) => {
                warn!("failed to serialize store snapshot: {e}");
                return;
            },
        };
        if let Err(e) = fs::write(&tmp, body).and_then(|()| fs::rename(&tmp, &*self.path))
        {
            warn!(path = ?self.path, "failed to flush store snapshot: {e}");
        }
    }
}

impl KvStore for JsonFileStore {
    fn get(&self, family: &str, key: &str) -> Option<String> {
        self.map
            .get(&(family.to_string(), key.to_string()))
            .map(|v| v.clone())
    }

    fn put(&self, family: &str, key: &str, value: &str) {
        self.map
            .insert((family.to_string(), key.to_string()), value.to_string());
        self.flush();
    }

    fn del(&self, family: &str, key: &str) {
        self.map.remove(&(family.to_string(), key.to_string()));
        self.flush();
    }

    fn deltree(&self, family: &str, subtree: Option<&str>) {
        self.map.retain(|(fam, key), _| {
            fam != family || subtree.is_some_and(|prefix| !key.starts_with(prefix))
        });
        self.flush();
    }
}
