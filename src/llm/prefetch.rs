//! 推测性预取
//!
//! 一个长期运行的 tokio 任务从有界 mpsc 队列接收 token 序列，在阻塞线程池里查记忆库，
//! 结果放进 PrefetchCache（键为末尾 ≤3 个 token 的签名）。下一次真实查询用 `take` 取走，只消费一次；
//! 缓存有上限，最早插入的结果先被淘汰，未消费的旧结果不会无限堆积。
//! 记忆库写入后缓存按代失效：查询开始前读取代号，写回时代号已变则丢弃结果。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::memory::{MemoryEntry, MemoryStore};

pub type LookupResult = BTreeMap<usize, Vec<MemoryEntry>>;

/// 预取签名：末尾至多 3 个 token 以 `|` 连接
pub fn signature(tokens: &[String]) -> String {
    let start = tokens.len().saturating_sub(3);
    tokens[start..].join("|")
}

struct CacheInner {
    map: HashMap<String, LookupResult>,
    order: VecDeque<String>,
    generation: u64,
}

/// 有界的一次性结果缓存
pub struct PrefetchCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl PrefetchCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                generation: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().map(|i| i.generation).unwrap_or(0)
    }

    /// 记忆库已变化：清空并推进代号
    pub fn invalidate(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.generation += 1;
            inner.map.clear();
            inner.order.clear();
        }
    }

    /// 写入在 `generation` 代查得的结果；代号过期时丢弃并返回 false
    pub fn insert(&self, generation: u64, key: String, result: LookupResult) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.generation != generation {
            return false;
        }
        if inner.map.insert(key.clone(), result).is_none() {
            inner.order.push_back(key);
        }
        while inner.map.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.map.remove(&oldest);
        }
        true
    }

    /// 取走并移除
    pub fn take(&self, key: &str) -> Option<LookupResult> {
        let mut inner = self.inner.lock().ok()?;
        let result = inner.map.remove(key)?;
        inner.order.retain(|k| k != key);
        Some(result)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 预取 worker 句柄
pub struct PrefetchWorker {
    sender: Option<mpsc::Sender<Vec<String>>>,
    handle: Option<JoinHandle<()>>,
    capacity: usize,
}

impl PrefetchWorker {
    /// 启动 worker（需在 tokio 运行时内调用）
    pub fn spawn(store: Arc<MemoryStore>, cache: Arc<PrefetchCache>, queue_capacity: usize) -> Self {
        let capacity = queue_capacity.max(1);
        let (tx, mut rx) = mpsc::channel::<Vec<String>>(capacity);
        let handle = tokio::spawn(async move {
            // 发送端关闭后 recv 仍会返回队列中剩余的请求
            while let Some(tokens) = rx.recv().await {
                let store = store.clone();
                let key = signature(&tokens);
                let generation = cache.generation();
                let looked_up = tokio::task::spawn_blocking(move || store.lookup(&tokens)).await;
                match looked_up {
                    Ok(Ok(result)) => {
                        if !cache.insert(generation, key, result) {
                            tracing::debug!("stale prefetch result dropped");
                        }
                    }
                    Ok(Err(e)) => tracing::warn!(error = %e, "prefetch lookup failed"),
                    Err(e) => tracing::warn!(error = %e, "prefetch task panicked"),
                }
            }
            tracing::debug!("prefetch worker drained");
        });
        Self {
            sender: Some(tx),
            handle: Some(handle),
            capacity,
        }
    }

    /// 非阻塞入队；队列满或已关闭时丢弃并返回 false
    pub fn enqueue(&self, tokens: Vec<String>) -> bool {
        let Some(tx) = &self.sender else {
            return false;
        };
        match tx.try_send(tokens) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "prefetch request dropped");
                false
            }
        }
    }

    /// 当前排队的请求数
    pub fn queue_depth(&self) -> usize {
        self.sender
            .as_ref()
            .map(|tx| self.capacity.saturating_sub(tx.capacity()))
            .unwrap_or(0)
    }

    /// 关闭队列，等待剩余请求处理完毕
    pub async fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "prefetch worker join failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tokenize;
    use tempfile::TempDir;

    #[test]
    fn test_signature_uses_last_three_tokens() {
        let t = tokenize("please run the unit tests");
        assert_eq!(signature(&t), "the|unit|tests");
        assert_eq!(signature(&tokenize("hi there")), "hi|there");
    }

    #[test]
    fn test_cache_is_bounded_and_consumed_once() {
        let cache = PrefetchCache::new(2);
        for key in ["a", "b", "c"] {
            assert!(cache.insert(0, key.into(), LookupResult::new()));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.take("a").is_none());
        assert!(cache.take("b").is_some());
        assert!(cache.take("b").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_drops_results_from_older_generation() {
        let cache = PrefetchCache::new(4);
        let before = cache.generation();
        assert!(cache.insert(before, "a".into(), LookupResult::new()));
        cache.invalidate();
        assert!(cache.is_empty());
        assert!(!cache.insert(before, "b".into(), LookupResult::new()));
        assert!(cache.insert(cache.generation(), "c".into(), LookupResult::new()));
        assert!(cache.take("c").is_some());
    }

    #[tokio::test]
    async fn test_worker_drains_queue_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::open(dir.path(), vec![2, 3], 16).unwrap());
        let tokens = tokenize("how do I run tests");
        store.store(&tokens, "use cargo test", Default::default()).unwrap();

        let cache = Arc::new(PrefetchCache::new(8));
        let mut worker = PrefetchWorker::spawn(store.clone(), cache.clone(), 4);
        assert!(worker.enqueue(tokens.clone()));
        worker.shutdown().await;

        let result = cache.take(&signature(&tokens)).unwrap();
        assert_eq!(result[&2][0].info, "use cargo test");
        assert!(!worker.enqueue(tokens));
    }
}
