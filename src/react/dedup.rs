//! 响应去重：短期签名缓存
//!
//! 签名取 chat 文本与各动作标识的 sha256 前 12 个十六进制字符。命中只产生一条内部警告观察，
//! 是否终止仍只由停滞检测决定。

use std::collections::VecDeque;

use sha2::{Digest, Sha256};

/// 签名哈希长度（十六进制字符）
const HASH_LEN: usize = 12;

pub fn signature_hash(signature: &str) -> String {
    let digest = hex::encode(Sha256::digest(signature.as_bytes()));
    digest[..HASH_LEN].to_string()
}

/// 固定容量的签名缓存，满时淘汰最早插入的签名
#[derive(Debug)]
pub struct ResponseCache {
    entries: VecDeque<String>,
    capacity: usize,
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// 已见过返回 true；否则记录该签名并返回 false
    pub fn check(&mut self, signature: &str) -> bool {
        let key = signature_hash(signature);
        if self.entries.contains(&key) {
            tracing::warn!(hash = %key, "duplicate response detected");
            return true;
        }
        self.entries.push_back(key);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
        false
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_twelve_hex_chars() {
        let h = signature_hash("chat:hello");
        assert_eq!(h.len(), 12);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_second_occurrence_is_duplicate() {
        let mut cache = ResponseCache::new(10);
        assert!(!cache.check("run:ls"));
        assert!(cache.check("run:ls"));
        assert!(!cache.check("run:pwd"));
    }

    #[test]
    fn test_oldest_evicted_first() {
        let mut cache = ResponseCache::new(2);
        cache.check("a");
        cache.check("b");
        cache.check("c");
        assert_eq!(cache.len(), 2);
        assert!(!cache.check("a"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
