//! 模型后端抽象
//!
//! 后端被视为不透明函数：消息序列 -> 一段文本（complete）或文本片段流（complete_stream）。
//! 所有失败都以 LlmError 返回，由 Gateway 统一转为错误形态的 Completion。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::core::AgentError;
use crate::memory::Message;

/// 后端调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl From<LlmError> for AgentError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Transport(m) => AgentError::Transport(m),
            LlmError::Timeout => AgentError::Timeout,
            LlmError::Status { status, body } => AgentError::BackendStatus { status, body },
            LlmError::Malformed(m) => AgentError::MalformedPayload(m),
        }
    }
}

/// 单次调用的采样参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2000,
        }
    }
}

impl CompletionOptions {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }
}

/// 文本片段流
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 模型后端 trait：非流式完成与流式完成
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<String, LlmError>;

    async fn complete_stream(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<TextStream, LlmError>;
}
