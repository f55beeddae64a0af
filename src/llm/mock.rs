//! 脚本化后端（用于测试，无需 API）
//!
//! 按顺序回放预设的回复，并记录每次收到的消息序列，便于断言注入内容与调用次数。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::traits::{ChatBackend, CompletionOptions, LlmError, TextStream};
use crate::memory::Message;

/// 一次调用的记录
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<Message>,
    pub options: CompletionOptions,
    pub streamed: bool,
}

#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    /// 脚本耗尽后的回复；None 时返回 Transport 错误
    fallback: Option<String>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedBackend {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Mutex::new(responses.into_iter().map(|s| Ok(s.into())).collect()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(text.into());
        self
    }

    /// 在脚本末尾追加一个错误
    pub fn push_error(&self, err: LlmError) {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(Err(err));
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn next(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        streamed: bool,
    ) -> Result<String, LlmError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                messages: messages.to_vec(),
                options: *options,
                streamed,
            });
        }
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(r) => r,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| LlmError::Transport("script exhausted".into())),
        }
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        self.next(messages, options, false)
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<TextStream, LlmError> {
        let content = self.next(messages, options, true)?;
        // 按字符切成小片段，模拟增量输出
        let chars: Vec<char> = content.chars().collect();
        let pieces: Vec<Result<String, LlmError>> = chars
            .chunks(16)
            .map(|c| Ok(c.iter().collect::<String>()))
            .collect();
        Ok(Box::pin(stream::iter(pieces)))
    }
}
