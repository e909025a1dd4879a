//! Per-worker LRU caches over graph queries.
//!
//! Each mapping worker owns one [`WorkerCaches`]; nothing here is shared or
//! locked. The caches memoize the graph oracle queries that dominate subgraph
//! extraction: node sequences, node layout starts, path projections, and
//! edge fans.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::hash::Hash;

use crate::graph::{Edge, GraphIndex, GraphPos};

/// Default capacity for every worker cache.
pub const DEFAULT_CACHE_SIZE: usize = 128;

/// A minimal LRU cache keyed by hashable ids.
///
/// Entries carry a logical clock; eviction removes the stalest entry when
/// the cache is full. Capacities are small enough that the linear eviction
/// scan never shows up in profiles.
#[derive(Debug)]
pub struct LruCache<K: Eq + Hash + Clone, V: Clone> {
    capacity: usize,
    clock: u64,
    entries: HashMap<K, (u64, V)>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        LruCache {
            capacity: capacity.max(1),
            clock: 0,
            entries: HashMap::with_capacity(capacity),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        self.clock += 1;
        let clock = self.clock;
        self.entries.get_mut(key).map(|slot| {
            slot.0 = clock;
            slot.1.clone()
        })
    }

    pub fn put(&mut self, key: K, value: V) {
        self.clock += 1;
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            if let Some(stalest) = self
                .entries
                .iter()
                .min_by_key(|(_, (tick, _))| *tick)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&stalest);
            }
        }
        self.entries.insert(key, (self.clock, value));
    }

    pub fn get_or_insert_with(&mut self, key: K, f: impl FnOnce() -> V) -> V {
        if let Some(v) = self.get(&key) {
            return v;
        }
        let v = f();
        self.put(key, v.clone());
        v
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The cache set owned by one mapping worker.
#[derive(Debug)]
pub struct WorkerCaches {
    pub node: LruCache<u64, Vec<u8>>,
    pub node_start: LruCache<u64, i64>,
    pub node_paths: LruCache<(u64, bool), BTreeMap<String, Vec<i64>>>,
    pub edges: LruCache<u64, Vec<Edge>>,
}

impl WorkerCaches {
    pub fn new(capacity: usize) -> Self {
        WorkerCaches {
            node: LruCache::new(capacity),
            node_start: LruCache::new(capacity),
            node_paths: LruCache::new(capacity),
            edges: LruCache::new(capacity),
        }
    }

    pub fn node_sequence(&mut self, graph: &dyn GraphIndex, id: u64) -> Vec<u8> {
        self.node.get_or_insert_with(id, || graph.node_sequence(id))
    }

    pub fn node_length(&mut self, graph: &dyn GraphIndex, id: u64) -> u32 {
        self.node_sequence(graph, id).len() as u32
    }

    pub fn edges_of(&mut self, graph: &dyn GraphIndex, id: u64) -> Vec<Edge> {
        self.edges.get_or_insert_with(id, || graph.edges_of(id))
    }

    pub fn node_start(&mut self, graph: &dyn GraphIndex, id: u64) -> i64 {
        self.node_start
            .get_or_insert_with(id, || graph.approx_position(GraphPos::new(id, false, 0)))
    }

    pub fn positions_in_paths(
        &mut self,
        graph: &dyn GraphIndex,
        node: u64,
        is_reverse: bool,
    ) -> BTreeMap<String, Vec<i64>> {
        self.node_paths
            .get_or_insert_with((node, is_reverse), || {
                graph.position_in_paths(node, is_reverse, 0)
            })
    }
}

impl Default for WorkerCaches {
    fn default() -> Self {
        WorkerCaches::new(DEFAULT_CACHE_SIZE)
    }
}
