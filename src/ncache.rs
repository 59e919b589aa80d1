//! The cache of heavy nodes.
//!
//! An MRU-ordered chain of nodes, each resident entry pinning one
//! extra reference. The chain lives in a slab; a node records its
//! slot so that membership is checkable and removal is O(1) given
//! only the node.


use std::sync::Arc;
use std::sync::Mutex;

use crate::lnode::{LnodeId, Tree};
use crate::node::Node;

#[derive(Debug)]
struct Entry {
    node: Arc<Node>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: Vec<Option<Entry>>,
    free: Vec<usize>,
    mru: Option<usize>,
    lru: Option<usize>,
    size_current: usize,
    size_max: usize,
}

impl CacheState {
    /// Splices the entry at `slot` out of the chain and returns its
    /// pinned node.
    fn remove(&mut self, slot: usize) -> Arc<Node> {
        let entry = self.entries[slot].take().expect("live cache entry");
        if let Some(next) = entry.next {
            if let Some(e) = self.entries[next].as_mut() {
                e.prev = entry.prev;
            }
        }
        if let Some(prev) = entry.prev {
            if let Some(e) = self.entries[prev].as_mut() {
                e.next = entry.next;
            }
        }
        if self.mru == Some(slot) {
            self.mru = entry.next;
        }
        if self.lru == Some(slot) {
            self.lru = entry.prev;
        }
        self.free.push(slot);
        self.size_current -= 1;
        *entry.node.cache_link().lock().expect("cache link lock") = None;
        entry.node
    }

    /// Threads `node` at the MRU end.
    fn push_mru(&mut self, node: Arc<Node>) {
        let entry = Entry { node, prev: None, next: self.mru };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.entries[slot] = Some(entry);
                slot
            }
            None => {
                self.entries.push(Some(entry));
                self.entries.len() - 1
            }
        };
        if let Some(old) = self.mru {
            if let Some(e) = self.entries[old].as_mut() {
                e.prev = Some(slot);
            }
        }
        if self.lru.is_none() {
            self.lru = Some(slot);
        }
        self.mru = Some(slot);
        self.size_current += 1;
        let entry = self.entries[slot].as_ref().expect("fresh cache entry");
        *entry.node.cache_link().lock().expect("cache link lock") = Some(slot);
    }
}

/// The node cache.
#[derive(Debug)]
pub struct Ncache {
    state: Mutex<CacheState>,
}

impl Drop for Ncache {
    fn drop(&mut self) {
        // unthread every pinned node before the pins go away
        self.reset();
    }
}

impl Ncache {
    pub fn new(size_max: usize) -> Self {
        Self { state: Mutex::new(CacheState { size_max, ..CacheState::default() }) }
    }

    /// Resolves the heavy node for `lnode`: the existing primary when
    /// one is alive, a freshly created node otherwise. The returned
    /// clone is the caller's reference.
    pub fn lookup(&self, tree: &Arc<Tree>, lnode: LnodeId) -> Arc<Node> {
        match tree.primary(lnode) {
            Some(node) => node,
            None => Node::create(tree, lnode),
        }
    }

    /// Makes `node` the most recently used entry, pinning it with one
    /// extra reference if it was not already resident, then evicts
    /// from the LRU end while the bound is exceeded.
    pub fn add(&self, node: &Arc<Node>) {
        let mut evicted = Vec::new();
        {
            let mut st = self.state.lock().expect("ncache lock");
            let enabled = st.size_max > 0 || st.size_current > 0;
            if enabled {
                let slot = *node.cache_link().lock().expect("cache link lock");
                let at_mru = slot.is_some() && st.mru == slot;
                if !at_mru {
                    let pinned = match slot {
                        // already threaded: keep the existing pin
                        Some(slot) => st.remove(slot),
                        None => Arc::clone(node),
                    };
                    st.push_mru(pinned);
                }
            }
            while st.size_current > st.size_max {
                let lru = st.lru.expect("non-empty cache has an LRU end");
                evicted.push(st.remove(lru));
            }
        }
        // pins drop outside the cache lock; destruction may reach the
        // light-node tree
        drop(evicted);
    }

    /// Unthreads every resident node, releasing the cache pins.
    pub fn reset(&self) {
        let mut evicted = Vec::new();
        {
            let mut st = self.state.lock().expect("ncache lock");
            while let Some(mru) = st.mru {
                evicted.push(st.remove(mru));
            }
        }
        drop(evicted);
    }

    pub fn size_current(&self) -> usize {
        self.state.lock().expect("ncache lock").size_current
    }

    pub fn size_max(&self) -> usize {
        self.state.lock().expect("ncache lock").size_max
    }

    /// Rebounds the cache; the next `add` enforces the new limit.
    pub fn set_size_max(&self, size_max: usize) {
        self.state.lock().expect("ncache lock").size_max = size_max;
    }

    /// Chain audit: the slab, the chain links and `size_current` must
    /// agree, and every resident node must know its slot.
    pub fn audit(&self) -> Result<(), String> {
        let st = self.state.lock().expect("ncache lock");
        let mut seen = 0;
        let mut cursor = st.mru;
        let mut prev = None;
        while let Some(slot) = cursor {
            let entry = st
                .entries
                .get(slot)
                .and_then(Option::as_ref)
                .ok_or_else(|| format!("chain points at dead slot {}", slot))?;
            if entry.prev != prev {
                return Err(format!("entry {} has a wrong prev link", slot));
            }
            let link = *entry.node.cache_link().lock().expect("cache link lock");
            if link != Some(slot) {
                return Err(format!("node in slot {} does not know its slot", slot));
            }
            seen += 1;
            prev = Some(slot);
            cursor = entry.next;
        }
        if seen != st.size_current {
            return Err(format!("chain has {} entries, size_current is {}", seen, st.size_current));
        }
        if st.lru != prev {
            return Err("lru does not match the chain tail".into());
        }
        Ok(())
    }
}
