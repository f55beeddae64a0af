//! LLM 层：后端抽象与实现（OpenAI 兼容 / 脚本化 Mock）、记忆增强网关、推测预取

pub mod gateway;
pub mod mock;
pub mod openai;
pub mod prefetch;
pub mod traits;

pub use gateway::{format_memory_context, Completion, Gateway, GatewayStatistics};
pub use mock::ScriptedBackend;
pub use openai::OpenAiBackend;
pub use prefetch::{PrefetchCache, PrefetchWorker};
pub use traits::{ChatBackend, CompletionOptions, LlmError, TextStream};
