//! Ordered Map Module
//!
//! Hash map preserving insertion order through a doubly-linked list,
//! used as the recency structure for eviction: the head of the list is
//! the least recently used entry, the tail the most recently used.
//!
//! Nodes live in a pool allocated up front and are recycled through a
//! free list, so steady-state operation performs no per-entry
//! allocation. All operations are O(1).

use std::collections::HashMap;
use std::hash::Hash;

use thiserror::Error;

/// Index of the sentinel node anchoring both ends of the list.
const SENTINEL: usize = 0;

/// Null link marker.
const NIL: usize = usize::MAX;

/// Signal that the node pool has no free slot for a new entry.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("ordered map node pool exhausted")]
pub struct PoolExhausted;

/// A pooled node on the recency list.
///
/// Vacant nodes have no entry and thread their `next` link through the
/// free list.
#[derive(Debug)]
struct Node<K, V> {
    entry: Option<(K, V)>,
    prev: usize,
    next: usize,
}

// == Ordered Map ==
/// Hash index plus pooled doubly-linked list.
///
/// Keys are unique; insertion order is preserved and can be mutated
/// with [`move_to_tail`](OrderedMap::move_to_tail).
#[derive(Debug)]
pub struct OrderedMap<K, V> {
    /// Key to node-index mapping
    table: HashMap<K, usize>,
    /// Node pool; index 0 is the sentinel
    nodes: Vec<Node<K, V>>,
    /// Head of the free list, threaded through vacant `next` links
    free: usize,
}

impl<K, V> OrderedMap<K, V>
where
    K: Eq + Hash + Clone,
{
    // == Constructor ==
    /// Creates an empty map with a pool of `capacity` nodes.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity + 1);
        nodes.push(Node {
            entry: None,
            prev: SENTINEL,
            next: SENTINEL,
        });

        let mut free = NIL;
        for index in 1..=capacity {
            nodes.push(Node {
                entry: None,
                prev: NIL,
                next: free,
            });
            free = index;
        }

        Self {
            table: HashMap::with_capacity(capacity),
            nodes,
            free,
        }
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns true if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Returns the size of the node pool.
    pub fn capacity(&self) -> usize {
        self.nodes.len() - 1
    }

    // == Get ==
    /// Looks up a value without touching the order.
    pub fn get(&self, key: &K) -> Option<&V> {
        let index = *self.table.get(key)?;
        self.nodes[index].entry.as_ref().map(|(_, value)| value)
    }

    // == Set ==
    /// Inserts a new entry at the tail, or updates an existing entry in
    /// place without changing its position.
    ///
    /// Fails with [`PoolExhausted`] if the key is new and the pool has
    /// no vacant node.
    pub fn set(&mut self, key: K, value: V) -> Result<(), PoolExhausted> {
        if let Some(&index) = self.table.get(&key) {
            if let Some(entry) = self.nodes[index].entry.as_mut() {
                entry.1 = value;
            }
            return Ok(());
        }

        let index = self.acquire(key.clone(), value)?;
        self.link_tail(index);
        self.table.insert(key, index);
        Ok(())
    }

    // == Move To Tail ==
    /// Marks a key most-recently-used. Returns false for unknown keys.
    pub fn move_to_tail(&mut self, key: &K) -> bool {
        match self.table.get(key) {
            Some(&index) => {
                self.unlink(index);
                self.link_tail(index);
                true
            }
            None => false,
        }
    }

    // == Pop Head ==
    /// Removes and returns the least recently used entry.
    pub fn pop_head(&mut self) -> Option<(K, V)> {
        let head = self.nodes[SENTINEL].next;
        if head == SENTINEL {
            return None;
        }
        self.take(head)
    }

    // == Pop Tail ==
    /// Removes and returns the most recently used entry.
    pub fn pop_tail(&mut self) -> Option<(K, V)> {
        let tail = self.nodes[SENTINEL].prev;
        if tail == SENTINEL {
            return None;
        }
        self.take(tail)
    }

    // == Remove ==
    /// Removes an entry by key. Returns false for unknown keys.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.table.remove(key) {
            Some(index) => {
                self.unlink(index);
                self.nodes[index].entry = None;
                self.release(index);
                true
            }
            None => false,
        }
    }

    // == Clear ==
    /// Drops every entry and returns all nodes to the free list.
    pub fn clear(&mut self) {
        self.table.clear();
        self.nodes[SENTINEL].prev = SENTINEL;
        self.nodes[SENTINEL].next = SENTINEL;

        self.free = NIL;
        for index in 1..self.nodes.len() {
            self.nodes[index].entry = None;
            self.nodes[index].prev = NIL;
            self.nodes[index].next = self.free;
            self.free = index;
        }
    }

    // == Node Pool ==

    fn acquire(&mut self, key: K, value: V) -> Result<usize, PoolExhausted> {
        if self.free == NIL {
            return Err(PoolExhausted);
        }
        let index = self.free;
        self.free = self.nodes[index].next;
        self.nodes[index].entry = Some((key, value));
        Ok(index)
    }

    fn release(&mut self, index: usize) {
        self.nodes[index].prev = NIL;
        self.nodes[index].next = self.free;
        self.free = index;
    }

    // == List Links ==

    fn link_tail(&mut self, index: usize) {
        let tail = self.nodes[SENTINEL].prev;
        self.nodes[index].prev = tail;
        self.nodes[index].next = SENTINEL;
        self.nodes[tail].next = index;
        self.nodes[SENTINEL].prev = index;
    }

    fn unlink(&mut self, index: usize) {
        let prev = self.nodes[index].prev;
        let next = self.nodes[index].next;
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
    }

    /// Unlinks an occupied node, detaches it from the index, and frees it.
    fn take(&mut self, index: usize) -> Option<(K, V)> {
        self.unlink(index);
        let entry = self.nodes[index].entry.take();
        if let Some((key, _)) = entry.as_ref() {
            self.table.remove(key);
        }
        self.release(index);
        entry
    }
}
