//! 模型网关：记忆增强 + 推测预取 + 统一的错误形态结果
//!
//! 每次请求都在消息序列的私有副本上注入记忆上下文，调用方持久化的历史永远不会被污染。
//! 查询顺序：预取缓存（取走即失效）-> 阻塞线程池里同步查询记忆库。
//! 请求发出后把同一 token 序列送入预取队列：主循环每轮的用户提示末尾相同，下一轮查询可直接取走结果。
//! 每次写入记忆库都会让预取缓存失效，避免下一轮拿到写入前的旧结果。

use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::{InjectionMethod, MemorySection};
use crate::core::AgentError;
use crate::llm::prefetch::{signature, LookupResult, PrefetchCache, PrefetchWorker};
use crate::llm::traits::{ChatBackend, CompletionOptions};
use crate::memory::{tokenize, top_recent, Message, MemoryReport, MemoryStore, Role};
use crate::utils::truncate_chars;

const CONTEXT_HEADER: &str = "[Relevant Context from Engram Memory]:";

/// 一次完成调用的结果；失败以 Error 形态返回，从不 panic 或向上抛出
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Text(String),
    Error(String),
}

/// 网关统计快照
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatistics {
    pub memory: MemoryReport,
    pub prefetch_queue_depth: usize,
    pub prefetch_cache_size: usize,
}

pub struct Gateway {
    backend: Arc<dyn ChatBackend>,
    store: Arc<MemoryStore>,
    cfg: MemorySection,
    prefetch_cache: Arc<PrefetchCache>,
    prefetch: PrefetchWorker,
}

/// 把查询结果格式化为有字符上限的上下文块；阶数升序，每阶取最新 top_k 条
pub fn format_memory_context(results: &LookupResult, top_k: usize, max_chars: usize) -> String {
    if results.values().all(Vec::is_empty) {
        return String::new();
    }
    let mut parts = vec![CONTEXT_HEADER.to_string()];
    let mut total = CONTEXT_HEADER.chars().count();
    'orders: for entries in results.values() {
        for entry in top_recent(entries, top_k) {
            let line = format!("- {}", entry.info);
            let len = line.chars().count();
            if total + len + 1 > max_chars {
                parts.push("- [truncated...]".to_string());
                break 'orders;
            }
            total += len + 1;
            parts.push(line);
        }
    }
    parts.join("\n")
}

/// 按注入方式把上下文写入消息副本
pub fn inject_context(messages: &mut Vec<Message>, context: &str, method: InjectionMethod) {
    match method {
        InjectionMethod::System => {
            match messages.iter_mut().find(|m| m.role == Role::System) {
                Some(sys) => {
                    sys.content.push_str("\n\n");
                    sys.content.push_str(context);
                }
                None => messages.insert(0, Message::system(context)),
            }
        }
        InjectionMethod::Prefix => {
            if let Some(user) = messages.iter_mut().find(|m| m.role == Role::User) {
                user.content = format!("{}\n\n{}", context, user.content);
            }
        }
        InjectionMethod::None => {}
    }
}

impl Gateway {
    /// 创建网关并启动预取 worker（需在 tokio 运行时内调用）
    pub fn new(backend: Arc<dyn ChatBackend>, store: Arc<MemoryStore>, cfg: MemorySection) -> Self {
        let prefetch_cache = Arc::new(PrefetchCache::new(cfg.prefetch_results_capacity));
        let prefetch = PrefetchWorker::spawn(
            store.clone(),
            prefetch_cache.clone(),
            cfg.prefetch_queue_capacity,
        );
        Self {
            backend,
            store,
            cfg,
            prefetch_cache,
            prefetch,
        }
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// 非流式完成
    pub async fn chat_completion(&self, messages: &[Message], options: &CompletionOptions) -> Completion {
        let (local, tokens) = self.augment(messages).await;
        let result = self.backend.complete(&local, options).await;
        self.enqueue_prefetch(tokens);
        match result {
            Ok(text) => Completion::Text(text),
            Err(e) => {
                tracing::warn!(error = %e, "backend call failed");
                Completion::Error(e.to_string())
            }
        }
    }

    /// 流式完成：收集全部片段；中途出错返回 Error
    pub async fn chat_completion_streamed(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Completion {
        let (local, tokens) = self.augment(messages).await;
        let stream = self.backend.complete_stream(&local, options).await;
        self.enqueue_prefetch(tokens);
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "backend stream failed to start");
                return Completion::Error(e.to_string());
            }
        };
        let mut text = String::new();
        while let Some(piece) = stream.next().await {
            match piece {
                Ok(fragment) => text.push_str(&fragment),
                Err(e) => {
                    tracing::warn!(error = %e, received = text.len(), "backend stream interrupted");
                    return Completion::Error(e.to_string());
                }
            }
        }
        Completion::Text(text)
    }

    /// 在副本上注入记忆；返回副本与待预取的 token（未注入时为 None）
    async fn augment(&self, messages: &[Message]) -> (Vec<Message>, Option<Vec<String>>) {
        let mut local = messages.to_vec();
        if self.cfg.injection == InjectionMethod::None {
            return (local, None);
        }
        let Some(user) = local.iter().rev().find(|m| m.role == Role::User) else {
            return (local, None);
        };
        let tokens = tokenize(&user.content);

        let results = match self.prefetch_cache.take(&signature(&tokens)) {
            Some(r) => {
                tracing::debug!(key = %signature(&tokens), "prefetch cache hit");
                r
            }
            None => self.lookup(tokens.clone()).await,
        };
        let context = format_memory_context(&results, self.cfg.top_entries, self.cfg.max_inject_chars);
        if !context.is_empty() {
            tracing::debug!(chars = context.chars().count(), "memory context injected");
            inject_context(&mut local, &context, self.cfg.injection);
        }
        (local, Some(tokens))
    }

    async fn lookup(&self, tokens: Vec<String>) -> LookupResult {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.lookup(&tokens)).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "memory lookup failed");
                LookupResult::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "memory lookup task failed");
                LookupResult::new()
            }
        }
    }

    fn enqueue_prefetch(&self, tokens: Option<Vec<String>>) {
        if let Some(tokens) = tokens {
            self.prefetch.enqueue(tokens);
        }
    }

    async fn store(&self, key_text: &str, info: String, metadata: Map<String, Value>) -> Result<(), AgentError> {
        let tokens = tokenize(key_text);
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.store(&tokens, &info, metadata))
            .await
            .map_err(|e| AgentError::Memory(e.to_string()))??;
        self.prefetch_cache.invalidate();
        Ok(())
    }

    /// 以用户话语的 token 为键，保存截断后的助手回复
    pub async fn learn_from_conversation(
        &self,
        user: &str,
        assistant: &str,
        metadata: Map<String, Value>,
    ) -> Result<(), AgentError> {
        let info = truncate_chars(assistant, self.cfg.truncate_length).to_string();
        self.store(user, info, metadata).await
    }

    /// 模型主动要求记住的知识
    pub async fn store_knowledge(&self, pattern: &str, info: &str) -> Result<(), AgentError> {
        let info = truncate_chars(info, self.cfg.knowledge_truncate_length).to_string();
        let metadata = match json!({"source": "agent_store"}) {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        self.store(pattern, info, metadata).await
    }

    pub fn statistics(&self) -> GatewayStatistics {
        GatewayStatistics {
            memory: self.store.report(),
            prefetch_queue_depth: self.prefetch.queue_depth(),
            prefetch_cache_size: self.prefetch_cache.len(),
        }
    }

    /// 关闭预取队列并等待 worker 退出
    pub async fn shutdown(&mut self) {
        self.prefetch.shutdown().await;
        tracing::info!("gateway shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedBackend;
    use crate::llm::traits::LlmError;
    use crate::memory::MemoryEntry;
    use tempfile::TempDir;

    fn entry(info: &str, ts: f64) -> MemoryEntry {
        MemoryEntry {
            info: info.into(),
            metadata: Map::new(),
            timestamp: ts,
            hit_count: 1,
        }
    }

    fn gateway(dir: &TempDir, backend: Arc<ScriptedBackend>, injection: InjectionMethod) -> Gateway {
        let store = Arc::new(MemoryStore::open(dir.path(), vec![2, 3], 64).unwrap());
        let cfg = MemorySection {
            injection,
            ..Default::default()
        };
        Gateway::new(backend, store, cfg)
    }

    #[test]
    fn test_format_orders_ascending_newest_first() {
        let mut results = LookupResult::new();
        results.insert(3, vec![entry("three-old", 1.0), entry("three-new", 5.0)]);
        results.insert(2, vec![entry("two", 2.0)]);
        let ctx = format_memory_context(&results, 3, 500);
        assert_eq!(
            ctx,
            "[Relevant Context from Engram Memory]:\n- two\n- three-new\n- three-old"
        );
        assert_eq!(format_memory_context(&LookupResult::new(), 3, 500), "");
    }

    #[test]
    fn test_format_truncates_with_marker() {
        let mut results = LookupResult::new();
        results.insert(2, vec![entry(&"a".repeat(30), 1.0), entry(&"b".repeat(30), 2.0)]);
        results.insert(3, vec![entry("never reached", 3.0)]);
        let ctx = format_memory_context(&results, 3, 80);
        assert!(ctx.ends_with("- [truncated...]"));
        assert!(ctx.contains(&"b".repeat(30)));
        assert!(!ctx.contains("never reached"));
    }

    #[test]
    fn test_inject_modes() {
        let base = vec![Message::system("sys"), Message::user("question")];
        let mut sys = base.clone();
        inject_context(&mut sys, "CTX", InjectionMethod::System);
        assert_eq!(sys[0].content, "sys\n\nCTX");

        let mut prefix = base.clone();
        inject_context(&mut prefix, "CTX", InjectionMethod::Prefix);
        assert_eq!(prefix[1].content, "CTX\n\nquestion");

        let mut bare = vec![Message::user("q")];
        inject_context(&mut bare, "CTX", InjectionMethod::System);
        assert_eq!(bare[0], Message::system("CTX"));
    }

    #[tokio::test]
    async fn test_injection_never_leaks_into_caller_history() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(["ok"]));
        let mut gw = gateway(&dir, backend.clone(), InjectionMethod::System);
        gw.learn_from_conversation("how do I run tests", "use cargo test", Map::new())
            .await
            .unwrap();

        let history = vec![Message::system("sys"), Message::user("how do I run tests")];
        let out = gw.chat_completion(&history, &CompletionOptions::default()).await;
        assert_eq!(out, Completion::Text("ok".into()));
        assert_eq!(history[0].content, "sys");

        let sent = &backend.calls()[0].messages;
        assert!(sent[0].content.contains("- use cargo test"));
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_backend_error_is_error_shaped() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(Vec::<String>::new()));
        backend.push_error(LlmError::Status {
            status: 500,
            body: "boom".into(),
        });
        let mut gw = gateway(&dir, backend, InjectionMethod::None);
        let out = gw
            .chat_completion_streamed(&[Message::user("hi")], &CompletionOptions::default())
            .await;
        assert_eq!(out, Completion::Error("HTTP 500: boom".into()));
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_knowledge_truncates_and_tags_source() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(Vec::<String>::new()));
        let mut gw = gateway(&dir, backend, InjectionMethod::System);
        gw.store_knowledge("pytest needs conftest", &"x".repeat(900)).await.unwrap();
        let found = gw.memory().lookup(&tokenize("pytest needs conftest")).unwrap();
        let stored = &found[&2][0];
        assert_eq!(stored.info.chars().count(), 500);
        assert_eq!(stored.metadata["source"], "agent_store");
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_statistics_reflect_store_and_lookup() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(["ok"]));
        let mut gw = gateway(&dir, backend, InjectionMethod::System);
        gw.learn_from_conversation("list the files", "use ls", Map::new())
            .await
            .unwrap();
        gw.chat_completion(&[Message::user("list the files")], &CompletionOptions::default())
            .await;

        let stats = gw.statistics();
        assert_eq!(stats.memory.stats.stores, 1);
        assert!(stats.memory.stats.lookups >= 1);
        assert!(stats.memory.stats.hits >= 1);
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_identical_request_uses_prefetched_result() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(["one", "two"]));
        let mut gw = gateway(&dir, backend.clone(), InjectionMethod::System);
        gw.store_knowledge("how do I run tests", "use cargo test").await.unwrap();
        let messages = [Message::user("how do I run tests")];

        gw.chat_completion(&messages, &CompletionOptions::default()).await;
        for _ in 0..200 {
            if gw.statistics().prefetch_cache_size == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(gw.statistics().prefetch_cache_size, 1);
        let lookups_before = gw.statistics().memory.stats.lookups;

        gw.chat_completion(&messages, &CompletionOptions::default()).await;
        // 第二次直接取走预取结果，不再同步查询
        assert_eq!(gw.statistics().memory.stats.lookups, lookups_before);
        assert!(backend.calls()[1].messages[0].content.contains("- use cargo test"));
        gw.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_invalidates_prefetched_results() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(["one", "two"]));
        let mut gw = gateway(&dir, backend.clone(), InjectionMethod::System);
        let messages = [Message::user("how do I run tests")];

        gw.chat_completion(&messages, &CompletionOptions::default()).await;
        for _ in 0..200 {
            if gw.statistics().prefetch_cache_size == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        gw.store_knowledge("how do I run tests", "use cargo test").await.unwrap();
        assert_eq!(gw.statistics().prefetch_cache_size, 0);

        gw.chat_completion(&messages, &CompletionOptions::default()).await;
        assert!(backend.calls()[1].messages[0].content.contains("- use cargo test"));
        gw.shutdown().await;
    }
}
