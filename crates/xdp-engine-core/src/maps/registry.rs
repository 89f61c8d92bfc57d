// SPDX-License-Identifier: GPL-2.0

//! Control-plane map registry

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Map, MapSchema};
use crate::core::error::MapError;

/// The set of maps available to programs, keyed by name
#[derive(Debug)]
pub struct MapSet {
    workers: usize,
    maps: RwLock<BTreeMap<String, Arc<Map>>>,
}

impl Default for MapSet {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MapSet {
    /// Registry whose per-worker maps have `workers` copies
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            maps: RwLock::new(BTreeMap::new()),
        }
    }

    /// Worker count per-worker maps are sized for
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Create a map
    pub fn create(&self, name: &str, schema: MapSchema) -> Result<Arc<Map>, MapError> {
        let mut maps = self.maps.write();
        if maps.contains_key(name) {
            return Err(MapError::Duplicate(name.to_string()));
        }
        let map = Arc::new(Map::new(name, schema, self.workers)?);
        maps.insert(name.to_string(), map.clone());
        tracing::info!(
            map = name,
            kind = %schema.kind,
            key_size = schema.key_size,
            value_size = schema.value_size,
            max_entries = schema.max_entries,
            "map created"
        );
        Ok(map)
    }

    /// Remove a map from the registry. Programs verified against it keep
    /// their reference until they are dropped.
    pub fn destroy(&self, name: &str) -> Result<Arc<Map>, MapError> {
        let map = self
            .maps
            .write()
            .remove(name)
            .ok_or_else(|| MapError::NotFound(name.to_string()))?;
        tracing::info!(map = name, "map destroyed");
        Ok(map)
    }

    /// Look up a map by name
    pub fn get(&self, name: &str) -> Option<Arc<Map>> {
        self.maps.read().get(name).cloned()
    }

    /// Names of all maps, sorted
    pub fn names(&self) -> Vec<String> {
        self.maps.read().keys().cloned().collect()
    }

    /// Snapshot of all maps
    pub fn iter(&self) -> impl Iterator<Item = Arc<Map>> {
        self.maps.read().values().cloned().collect::<Vec<_>>().into_iter()
    }

    /// Number of maps
    pub fn len(&self) -> usize {
        self.maps.read().len()
    }

    /// Whether no maps exist
    pub fn is_empty(&self) -> bool {
        self.maps.read().is_empty()
    }
}
