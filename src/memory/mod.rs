//! 记忆层：对话消息、n-gram 记忆库（SQLite + LRU）、运行状态快照与状态看板

pub mod conversation;
pub mod engram;
pub mod lru;
pub mod snapshot;
pub mod status_board;
pub mod tokenizer;

pub use conversation::{total_chars, Message, Role};
pub use engram::{
    capacity_from_budget, top_recent, MemoryEntry, MemoryReport, MemoryStats, MemoryStore,
    NgramKey,
};
pub use lru::LruCache;
pub use snapshot::StateStore;
pub use status_board::StatusBoard;
pub use tokenizer::tokenize;
