//! Engram 记忆库：n-gram 后缀键 -> 记忆条目列表
//!
//! 持久层为 SQLite（engram_memory.db，表 ngrams），每次 store / lookup 独立打开连接并使用一个事务，
//! 不持有长期锁，主循环与预取 worker 可以交错访问。
//! 内存层为严格 LRU（键 `"{n}:{key}"`），与统计计数一起放在同一把 Mutex 之后。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::memory::lru::LruCache;

const DB_FILE: &str = "engram_memory.db";

/// 单条记忆：只追加，不覆盖
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub info: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Unix 秒（含小数）
    pub timestamp: f64,
    #[serde(default = "default_hit_count", alias = "count")]
    pub hit_count: u64,
}

fn default_hit_count() -> u64 {
    1
}

/// n-gram 键：阶数 + 最后 n 个 token 以 `|` 连接
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NgramKey {
    pub order: usize,
    pub key: String,
}

impl NgramKey {
    /// token 数不足 n 时返回 None
    pub fn from_tokens(tokens: &[String], order: usize) -> Option<Self> {
        if order == 0 || tokens.len() < order {
            return None;
        }
        Some(Self {
            order,
            key: tokens[tokens.len() - order..].join("|"),
        })
    }

    /// LRU 缓存键
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.order, self.key)
    }
}

/// 累计统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub cache_hits: u64,
    pub store_reads: u64,
    pub stores: u64,
}

/// 统计快照（命中率 + 驻留情况 + 数据库大小）
#[derive(Debug, Clone, Serialize)]
pub struct MemoryReport {
    pub stats: MemoryStats,
    pub hit_rate: f64,
    pub cache_hit_rate: f64,
    pub resident_entries: usize,
    pub capacity: usize,
    pub db_size_bytes: u64,
    pub db_path: PathBuf,
}

struct CacheState {
    cache: LruCache<String, Vec<MemoryEntry>>,
    stats: MemoryStats,
}

/// 由内存预算推导 LRU 条目上限（至少 1）
pub fn capacity_from_budget(max_memory_mb: usize, avg_entry_bytes: usize) -> usize {
    let bytes = max_memory_mb.saturating_mul(1024 * 1024);
    (bytes / avg_entry_bytes.max(1)).max(1)
}

/// 按时间戳取最新的 k 条；时间戳相同时后写入者优先
pub fn top_recent(entries: &[MemoryEntry], k: usize) -> Vec<&MemoryEntry> {
    let mut indexed: Vec<(usize, &MemoryEntry)> = entries.iter().enumerate().collect();
    indexed.sort_by(|(ia, a), (ib, b)| {
        b.timestamp
            .partial_cmp(&a.timestamp)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(ib.cmp(ia))
    });
    indexed.into_iter().take(k).map(|(_, e)| e).collect()
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// n-gram 记忆库（可通过 Arc 在主循环与预取 worker 间共享）
pub struct MemoryStore {
    db_path: PathBuf,
    orders: Vec<usize>,
    state: Mutex<CacheState>,
}

impl MemoryStore {
    /// 打开（或创建）storage_dir 下的数据库并建表
    pub fn open(
        storage_dir: impl AsRef<Path>,
        orders: Vec<usize>,
        capacity: usize,
    ) -> Result<Self, AgentError> {
        let dir = storage_dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| AgentError::Memory(format!("create {}: {}", dir.display(), e)))?;
        let db_path = dir.join(DB_FILE);

        let conn = Connection::open(&db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS ngrams (
                n INTEGER,
                ngram_key TEXT,
                value_json TEXT,
                hit_count INTEGER DEFAULT 1,
                last_accessed REAL,
                PRIMARY KEY (n, ngram_key)
            );
            CREATE INDEX IF NOT EXISTS idx_ngrams_key ON ngrams(ngram_key);",
        )?;

        let mut orders = orders;
        orders.retain(|n| *n > 0);
        orders.sort_unstable();
        orders.dedup();

        tracing::info!(
            db = %db_path.display(),
            orders = ?orders,
            capacity,
            "engram memory store opened"
        );

        Ok(Self {
            db_path,
            orders,
            state: Mutex::new(CacheState {
                cache: LruCache::new(capacity),
                stats: MemoryStats::default(),
            }),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, AgentError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CacheState>, AgentError> {
        self.state
            .lock()
            .map_err(|_| AgentError::Memory("cache lock poisoned".into()))
    }

    /// 为每个阶数的后缀键追加一条记忆；已驻留的缓存条目同步更新
    pub fn store(
        &self,
        tokens: &[String],
        info: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), AgentError> {
        let keys: Vec<NgramKey> = self
            .orders
            .iter()
            .filter_map(|n| NgramKey::from_tokens(tokens, *n))
            .collect();
        if keys.is_empty() {
            return Ok(());
        }

        let timestamp = now_secs();
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        let mut written = Vec::with_capacity(keys.len());
        for key in &keys {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT value_json FROM ngrams WHERE n = ?1 AND ngram_key = ?2",
                    params![key.order as i64, key.key],
                    |row| row.get(0),
                )
                .optional()?;
            let mut entries: Vec<MemoryEntry> = match existing {
                Some(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                    tracing::warn!(key = %key.cache_key(), error = %e, "corrupt ngram row, starting fresh");
                    Vec::new()
                }),
                None => Vec::new(),
            };
            entries.push(MemoryEntry {
                info: info.to_string(),
                metadata: metadata.clone(),
                timestamp,
                hit_count: 1,
            });
            let value_json = serde_json::to_string(&entries)
                .map_err(|e| AgentError::Memory(e.to_string()))?;
            tx.execute(
                "INSERT INTO ngrams (n, ngram_key, value_json, last_accessed)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(n, ngram_key) DO UPDATE SET
                    value_json = excluded.value_json,
                    hit_count = hit_count + 1,
                    last_accessed = excluded.last_accessed",
                params![key.order as i64, key.key, value_json, timestamp],
            )?;
            written.push((key.cache_key(), entries));
        }
        tx.commit()?;

        let mut state = self.lock()?;
        for (cache_key, entries) in written {
            state.cache.update_resident(&cache_key, entries);
        }
        state.stats.stores += 1;
        tracing::debug!(keys = keys.len(), "engram store");
        Ok(())
    }

    /// 按阶数查找：先查 LRU，未命中再读数据库并放入 LRU
    ///
    /// 返回 order -> 全部条目；token 不足 n 的阶数跳过且不计 miss。
    pub fn lookup(&self, tokens: &[String]) -> Result<BTreeMap<usize, Vec<MemoryEntry>>, AgentError> {
        let mut results = BTreeMap::new();
        let mut conn: Option<Connection> = None;

        self.lock()?.stats.lookups += 1;

        for n in &self.orders {
            let Some(key) = NgramKey::from_tokens(tokens, *n) else {
                continue;
            };
            let cache_key = key.cache_key();

            {
                let mut state = self.lock()?;
                let cached = state.cache.get(&cache_key).cloned();
                if let Some(entries) = cached {
                    state.stats.cache_hits += 1;
                    state.stats.hits += 1;
                    results.insert(*n, entries);
                    continue;
                }
            }

            if conn.is_none() {
                conn = Some(self.connect()?);
            }
            let row: Option<String> = match conn.as_ref() {
                Some(c) => c
                    .query_row(
                        "SELECT value_json FROM ngrams WHERE n = ?1 AND ngram_key = ?2",
                        params![key.order as i64, key.key],
                        |row| row.get(0),
                    )
                    .optional()?,
                None => None,
            };
            let entries: Vec<MemoryEntry> = row
                .and_then(|json| serde_json::from_str(&json).ok())
                .unwrap_or_default();

            let mut state = self.lock()?;
            state.stats.store_reads += 1;
            if entries.is_empty() {
                state.stats.misses += 1;
                continue;
            }
            state.stats.hits += 1;
            state.cache.insert(cache_key, entries.clone());
            results.insert(*n, entries);
        }

        Ok(results)
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().map(|s| s.stats.clone()).unwrap_or_default()
    }

    /// 缓存键是否驻留（测试与诊断用）
    pub fn is_resident(&self, key: &NgramKey) -> bool {
        self.lock()
            .map(|s| s.cache.contains(&key.cache_key()))
            .unwrap_or(false)
    }

    pub fn report(&self) -> MemoryReport {
        let (stats, resident_entries, capacity) = match self.lock() {
            Ok(s) => (s.stats.clone(), s.cache.len(), s.cache.capacity()),
            Err(_) => (MemoryStats::default(), 0, 0),
        };
        let queried = stats.hits + stats.misses;
        let pct = |num: u64| {
            if queried == 0 {
                0.0
            } else {
                (num as f64 / queried as f64 * 10000.0).round() / 100.0
            }
        };
        let db_size_bytes = std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0);
        MemoryReport {
            hit_rate: pct(stats.hits),
            cache_hit_rate: pct(stats.cache_hits),
            stats,
            resident_entries,
            capacity,
            db_size_bytes,
            db_path: self.db_path.clone(),
        }
    }
}
