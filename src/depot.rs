//! Seams towards the downstream consumers the broker talks to: the material
//! manager and geometry list ("do I already have resource X"), the scene that
//! receives activated placements, and the spatial index consumer.
//!
//! The in-memory implementations are what the tests (and simple embedders)
//! use; a real renderer backend brings its own.

use std::sync::Arc;
use std::sync::Mutex;

use dashmap::DashMap;

use crate::model::{IndexNode, ResourceKey, ScenePlacement};

/// A downstream cache that can answer whether a shared resource is already
/// materialized. The broker treats a hit as "resolved", even if a request for
/// the same key is technically in flight elsewhere, to avoid duplicate
/// materialization.
pub trait ResourceDepot: Send + Sync {
    fn contains(&self, key: ResourceKey) -> bool;
    fn store(&self, key: ResourceKey, bytes: Arc<Vec<u8>>);
}

/// Receives the renderable proxies built on fragment activation.
pub trait SceneSink: Send + Sync {
    fn add_placement(&self, placement: ScenePlacement);
}

/// Accepts the finished flat node array of the spatial index build.
pub trait SpatialIndexConsumer: Send + Sync {
    fn accept(&self, nodes: Vec<IndexNode>);
}

#[derive(Default)]
pub struct MemoryDepot {
    entries: DashMap<ResourceKey, Arc<Vec<u8>>>,
}

impl MemoryDepot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: ResourceKey) -> Option<Arc<Vec<u8>>> {
        self.entries.get(&key).map(|e| e.value().clone())
    }
}

impl ResourceDepot for MemoryDepot {
    fn contains(&self, key: ResourceKey) -> bool {
        self.entries.contains_key(&key)
    }

    fn store(&self, key: ResourceKey, bytes: Arc<Vec<u8>>) {
        self.entries.insert(key, bytes);
    }
}

#[derive(Default)]
pub struct CollectingSceneSink {
    placements: Mutex<Vec<ScenePlacement>>,
}

impl CollectingSceneSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.placements.lock().expect("scene sink lock").len()
    }

    pub fn take(&self) -> Vec<ScenePlacement> {
        std::mem::take(&mut *self.placements.lock().expect("scene sink lock"))
    }
}

impl SceneSink for CollectingSceneSink {
    fn add_placement(&self, placement: ScenePlacement) {
        self.placements.lock().expect("scene sink lock").push(placement);
    }
}

#[derive(Default)]
pub struct CollectingIndexConsumer {
    nodes: Mutex<Vec<IndexNode>>,
}

impl CollectingIndexConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<IndexNode> {
        std::mem::take(&mut *self.nodes.lock().expect("index consumer lock"))
    }
}

impl SpatialIndexConsumer for CollectingIndexConsumer {
    fn accept(&self, nodes: Vec<IndexNode>) {
        *self.nodes.lock().expect("index consumer lock") = nodes;
    }
}
