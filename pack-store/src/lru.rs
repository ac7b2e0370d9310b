//! Weighted LRU cache for pack entries.
//!
//! Adapted from a count-based LRU into a weight-based one: each entry has a
//! byte weight, and the cache evicts tail entries until the total weight is
//! back under capacity. An entry whose own weight exceeds 10% of capacity is
//! never cached at all — such an entry would evict most of the cache just to
//! hold itself, which defeats the point of caching (spec §4.9 "Cache").

use std::collections::{hash_map::Entry, HashMap};
use std::marker::PhantomData;

/// Anything storable in the cache must be able to report its own weight.
pub trait Weighted {
    fn weight(&self) -> usize;
}

struct CacheNode<K, V> {
    key: K,
    value: V,
    weight: usize,
    prev: *mut CacheNode<K, V>,
    next: *mut CacheNode<K, V>,
    _marker: PhantomData<Box<CacheNode<K, V>>>,
}

impl<K, V> CacheNode<K, V> {
    fn new(key: K, value: V, weight: usize) -> Self {
        Self {
            key,
            value,
            weight,
            prev: std::ptr::null_mut(),
            next: std::ptr::null_mut(),
            _marker: PhantomData,
        }
    }
}

/// Weighted LRU cache. Entries whose weight exceeds 10% of `capacity_bytes`
/// are treated as having infinite weight: `insert` silently skips them
/// rather than admitting an entry that would immediately evict most of the
/// rest of the cache.
pub struct WeightedLruCache<K, V> {
    map: HashMap<K, *mut CacheNode<K, V>>,
    list: LinkedList<K, V>,
    capacity_bytes: usize,
    total_weight: usize,
    _marker: PhantomData<Box<CacheNode<K, V>>>,
}

impl<K, V> Drop for WeightedLruCache<K, V> {
    fn drop(&mut self) {
        self.clear();
    }
}

unsafe impl<K: Send, V: Send> Send for WeightedLruCache<K, V> {}

impl<K, V> WeightedLruCache<K, V> {
    pub fn clear(&mut self) {
        self.map.clear();
        self.list.clear();
        self.total_weight = 0;
    }
}

impl<K: std::cmp::Eq + std::hash::Hash + Copy, V: Weighted> WeightedLruCache<K, V> {
    pub fn new(capacity_bytes: usize) -> Self {
        let capacity_bytes = capacity_bytes.max(1);
        Self {
            map: HashMap::new(),
            list: LinkedList::new(),
            capacity_bytes,
            total_weight: 0,
            _marker: PhantomData,
        }
    }

    /// An entry this heavy would never be worth retaining: the spec's
    /// 10%-of-capacity rule.
    fn is_never_retained(&self, weight: usize) -> bool {
        weight * 10 > self.capacity_bytes
    }

    pub fn insert(&mut self, key: K, value: V) {
        let weight = value.weight();
        if self.is_never_retained(weight) {
            self.remove(key);
            return;
        }
        match self.map.entry(key) {
            Entry::Occupied(mut o) => {
                let node_ptr = *o.get_mut();
                self.list.bring_to_front(node_ptr);
                let mut node = unsafe { Box::from_raw(node_ptr) };
                self.total_weight = self.total_weight - node.weight + weight;
                node.value = value;
                node.weight = weight;
                let _node_ptr = Box::into_raw(node);
            }
            Entry::Vacant(v) => {
                let node = Box::new(CacheNode::new(key, value, weight));
                let node_ptr = Box::into_raw(node);
                self.list.push_front(node_ptr);
                v.insert(node_ptr);
                self.total_weight += weight;
            }
        }
        while self.total_weight > self.capacity_bytes && self.map.len() > 1 {
            self.pop_tail();
        }
    }

    pub fn remove(&mut self, key: K) -> Option<V> {
        let node_ptr = self.map.remove(&key)?;
        let node = self.list.remove(node_ptr);
        self.total_weight -= node.weight;
        Some(node.value)
    }

    fn pop_tail(&mut self) {
        if let Some(old_tail) = self.list.pop_tail() {
            self.map.remove(&old_tail.key);
            self.total_weight -= old_tail.weight;
        }
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        let node_ptr = self.map.get(&key)?;
        self.list.bring_to_front(*node_ptr);
        Some(unsafe { &mut (*self.list.head).value })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn total_weight(&self) -> usize {
        self.total_weight
    }
}

struct LinkedList<K, V> {
    head: *mut CacheNode<K, V>,
    tail: *mut CacheNode<K, V>,
}

impl<K, V> LinkedList<K, V> {
    fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
            tail: std::ptr::null_mut(),
        }
    }

    fn bring_to_front(&mut self, node_ptr: *mut CacheNode<K, V>) {
        if node_ptr == self.head {
            return;
        }

        let mut node = unsafe { Box::from_raw(node_ptr) };
        unsafe { (*node.prev).next = node.next };

        if !node.next.is_null() {
            unsafe { (*node.next).prev = node.prev };
        } else {
            self.tail = node.prev;
        }

        node.prev = std::ptr::null_mut();
        node.next = self.head;
        let node_ptr = Box::into_raw(node);
        unsafe { (*self.head).prev = node_ptr };
        self.head = node_ptr;
    }

    fn push_front(&mut self, node_ptr: *mut CacheNode<K, V>) {
        let mut node = unsafe { Box::from_raw(node_ptr) };

        node.next = self.head;
        let node_ptr = Box::into_raw(node);

        if !self.head.is_null() {
            unsafe { (*self.head).prev = node_ptr };
        }

        self.head = node_ptr;

        if self.tail.is_null() {
            self.tail = node_ptr;
        }
    }

    fn remove(&mut self, node_ptr: *mut CacheNode<K, V>) -> Box<CacheNode<K, V>> {
        let node = unsafe { Box::from_raw(node_ptr) };

        if !node.prev.is_null() {
            unsafe { (*node.prev).next = node.next };
        } else {
            self.head = node.next;
        }

        if !node.next.is_null() {
            unsafe { (*node.next).prev = node.prev };
        } else {
            self.tail = node.prev;
        }
        node
    }

    fn pop_tail(&mut self) -> Option<Box<CacheNode<K, V>>> {
        if self.tail.is_null() {
            return None;
        }

        let old_tail = unsafe { Box::from_raw(self.tail) };
        self.tail = old_tail.prev;
        if !self.tail.is_null() {
            unsafe { (*self.tail).next = std::ptr::null_mut() };
        }
        Some(old_tail)
    }

    fn clear(&mut self) {
        let mut next = self.head;
        while !next.is_null() {
            let current = unsafe { Box::from_raw(next) };
            next = current.next;
        }
        self.head = std::ptr::null_mut();
        self.tail = std::ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy)]
    struct Blob(usize);
    impl Weighted for Blob {
        fn weight(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn evicts_lru_when_over_capacity() {
        let mut cache: WeightedLruCache<u64, Blob> = WeightedLruCache::new(100);
        cache.insert(1, Blob(40));
        cache.insert(2, Blob(40));
        cache.insert(3, Blob(40));
        assert!(cache.get_mut(1).is_none());
        assert!(cache.get_mut(2).is_some());
        assert!(cache.get_mut(3).is_some());
    }

    #[test]
    fn oversized_entry_is_never_retained() {
        let mut cache: WeightedLruCache<u64, Blob> = WeightedLruCache::new(100);
        cache.insert(1, Blob(20));
        cache.insert(2, Blob(50)); // > 10% of capacity
        assert!(cache.get_mut(1).is_some());
        assert!(cache.get_mut(2).is_none());
    }

    #[test]
    fn recently_used_survives_eviction() {
        let mut cache: WeightedLruCache<u64, Blob> = WeightedLruCache::new(100);
        cache.insert(1, Blob(40));
        cache.insert(2, Blob(40));
        cache.get_mut(1); // touch 1, making 2 the LRU
        cache.insert(3, Blob(40));
        assert!(cache.get_mut(1).is_some());
        assert!(cache.get_mut(2).is_none());
        assert!(cache.get_mut(3).is_some());
    }
}
