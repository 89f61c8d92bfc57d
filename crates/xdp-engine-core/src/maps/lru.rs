// SPDX-License-Identifier: GPL-2.0

//! LRU hash map store
//!
//! A hash index into a slab of nodes threaded on a doubly-linked recency
//! list, all behind a single mutex. Lookups and updates move the entry to
//! the head; inserting a new key into a full map evicts the tail.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::cell::ValueCell;
use super::UpdateMode;
use crate::core::error::MapError;

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node {
    key: Box<[u8]>,
    cell: Arc<ValueCell>,
    prev: usize,
    next: usize,
}

#[derive(Debug)]
struct LruInner {
    index: HashMap<Box<[u8]>, usize>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl LruInner {
    fn node(&self, idx: usize) -> Option<&Node> {
        self.nodes.get(idx).and_then(|n| n.as_ref())
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node> {
        self.nodes.get_mut(idx).and_then(|n| n.as_mut())
    }

    fn unlink(&mut self, idx: usize) {
        let Some((prev, next)) = self.node(idx).map(|n| (n.prev, n.next)) else {
            return;
        };
        match self.node_mut(prev) {
            Some(p) => p.next = next,
            None => self.head = next,
        }
        match self.node_mut(next) {
            Some(n) => n.prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let head = self.head;
        if let Some(n) = self.node_mut(idx) {
            n.prev = NIL;
            n.next = head;
        }
        match self.node_mut(head) {
            Some(h) => h.prev = idx,
            None => self.tail = idx,
        }
        self.head = idx;
    }

    fn promote(&mut self, idx: usize) {
        if self.head != idx {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn remove(&mut self, idx: usize) -> Option<Node> {
        self.unlink(idx);
        let node = self.nodes.get_mut(idx)?.take()?;
        self.index.remove(&node.key);
        self.free.push(idx);
        Some(node)
    }

    fn alloc(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }
}

/// Hash table that evicts the least recently used entry at capacity
#[derive(Debug)]
pub struct LruStore {
    inner: Mutex<LruInner>,
    max_entries: usize,
    value_size: usize,
}

impl LruStore {
    /// Create an empty store
    pub fn new(value_size: usize, max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                index: HashMap::with_capacity(max_entries.min(1 << 16)),
                nodes: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
            }),
            max_entries,
            value_size,
        }
    }

    /// Shared cell for `key`; marks the entry most recently used
    pub fn lookup(&self, key: &[u8]) -> Option<Arc<ValueCell>> {
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(key)?;
        inner.promote(idx);
        inner.node(idx).map(|n| n.cell.clone())
    }

    /// Insert or replace according to `mode`, evicting when full
    pub fn update(&self, key: &[u8], value: &[u8], mode: UpdateMode) -> Result<(), MapError> {
        debug_assert_eq!(value.len(), self.value_size);
        let mut inner = self.inner.lock();
        let cell = Arc::new(ValueCell::from_bytes(value));
        if let Some(&idx) = inner.index.get(key) {
            if mode == UpdateMode::CreateOnly {
                return Err(MapError::Exists);
            }
            if let Some(n) = inner.node_mut(idx) {
                n.cell = cell;
            }
            inner.promote(idx);
            return Ok(());
        }
        if mode == UpdateMode::UpdateOnly {
            return Err(MapError::Missing);
        }
        if inner.index.len() >= self.max_entries {
            let tail = inner.tail;
            if let Some(evicted) = inner.remove(tail) {
                tracing::trace!(key = ?evicted.key, "lru eviction");
            }
        }
        let idx = inner.alloc(Node {
            key: key.into(),
            cell,
            prev: NIL,
            next: NIL,
        });
        inner.index.insert(key.into(), idx);
        inner.push_front(idx);
        Ok(())
    }

    /// Remove `key`
    pub fn delete(&self, key: &[u8]) -> Result<(), MapError> {
        self.take(key).map(|_| ()).ok_or(MapError::Missing)
    }

    /// Remove `key`, returning its cell
    pub fn take(&self, key: &[u8]) -> Option<Arc<ValueCell>> {
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(key)?;
        inner.remove(idx).map(|n| n.cell)
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.index.len());
        let mut cur = inner.head;
        while let Some(n) = inner.node(cur) {
            out.push(n.key.to_vec());
            cur = n.next;
        }
        out
    }

    /// Current entry count
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
