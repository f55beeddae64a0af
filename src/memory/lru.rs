//! 严格 LRU 缓存
//!
//! HashMap 存值与最近访问序号，BTreeMap 按序号排列键；序号单调递增，
//! 因此同时满足「最近最少使用先淘汰」与「同序时按插入顺序」。

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

#[derive(Debug)]
pub struct LruCache<K, V> {
    capacity: usize,
    tick: u64,
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
}

impl<K: Clone + Eq + Hash, V> LruCache<K, V> {
    /// 容量至少为 1
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// 读取并标记为最近使用
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.next_tick();
        let (_, stamp) = self.entries.get_mut(key)?;
        let old = std::mem::replace(stamp, tick);
        self.order.remove(&old);
        self.order.insert(tick, key.clone());
        self.entries.get(key).map(|(v, _)| v)
    }

    /// 就地修改已驻留的值，不改变其 LRU 位置；未驻留时返回 false
    pub fn update_resident(&mut self, key: &K, value: V) -> bool {
        match self.entries.get_mut(key) {
            Some((v, _)) => {
                *v = value;
                true
            }
            None => false,
        }
    }

    /// 插入或覆盖（标记为最近使用）；超出容量时淘汰最久未用的条目并返回其键
    pub fn insert(&mut self, key: K, value: V) -> Option<K> {
        let tick = self.next_tick();
        if let Some((_, old)) = self.entries.insert(key.clone(), (value, tick)) {
            self.order.remove(&old);
        }
        self.order.insert(tick, key);

        if self.entries.len() > self.capacity {
            let (_, evicted) = self.order.pop_first()?;
            self.entries.remove(&evicted);
            return Some(evicted);
        }
        None
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 从最久未用到最近使用的键序列
    pub fn keys_lru_order(&self) -> Vec<K> {
        self.order.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_plus_k_evicts_k_oldest() {
        let c = 4;
        let k = 3;
        let mut cache = LruCache::new(c);
        let mut evicted = Vec::new();
        for i in 0..(c + k) {
            if let Some(e) = cache.insert(i, i * 10) {
                evicted.push(e);
            }
        }
        assert_eq!(cache.len(), c);
        assert_eq!(evicted, vec![0, 1, 2]);
        assert_eq!(cache.keys_lru_order(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let mut cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(&1));
        assert_eq!(cache.insert("c", 3), Some("b"));
        assert!(cache.contains(&"a"));
        assert!(!cache.contains(&"b"));
    }

    #[test]
    fn test_update_resident_keeps_position() {
        let mut cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert!(cache.update_resident(&"a", 10));
        assert!(!cache.update_resident(&"z", 0));
        // a 仍是最久未用
        assert_eq!(cache.insert("c", 3), Some("a"));
    }

    #[test]
    fn test_zero_capacity_is_one() {
        let mut cache: LruCache<u8, u8> = LruCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert(1, 1);
        assert_eq!(cache.insert(2, 2), Some(1));
    }
}
