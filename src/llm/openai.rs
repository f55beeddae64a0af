//! OpenAI 兼容 chat-completions 后端
//!
//! 直接用 reqwest POST `{base_url}/chat/completions`；非流式使用请求超时，流式使用更长的流超时。
//! 流式响应按 SSE 行解析：`data: {json}` 取 `choices[0].delta.content`，遇到 `data: [DONE]` 结束，
//! 无法解析的块直接跳过。

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::LlmSection;
use crate::llm::traits::{ChatBackend, CompletionOptions, LlmError, TextStream};
use crate::memory::Message;
use crate::utils::truncate_chars;

pub struct OpenAiBackend {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    request_timeout: Duration,
    stream_timeout: Duration,
}

impl OpenAiBackend {
    pub fn new(cfg: &LlmSection) -> Self {
        let api_key = cfg
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty());
        Self {
            client: Client::new(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            api_key,
            request_timeout: Duration::from_secs(cfg.timeouts.request),
            stream_timeout: Duration::from_secs(cfg.timeouts.stream),
        }
    }

    fn body(&self, messages: &[Message], options: &CompletionOptions, stream: bool) -> Value {
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": stream,
        })
    }

    async fn post(&self, body: &Value, timeout: Duration) -> Result<reqwest::Response, LlmError> {
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(timeout)
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(map_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: truncate_chars(&text, 200).to_string(),
            });
        }
        Ok(resp)
    }
}

fn map_transport(e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout
    } else {
        LlmError::Transport(e.to_string())
    }
}

/// 从非流式响应中取出 `choices[0].message.content`
pub fn extract_content(payload: &Value) -> Result<String, LlmError> {
    if let Some(err) = payload.get("error") {
        let msg = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(LlmError::Malformed(msg));
    }
    payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| LlmError::Malformed("missing choices[0].message.content".into()))
}

/// SSE 行解码器：按字节缓存不完整的行（多字节字符可能跨块）
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl SseDecoder {
    /// 追加一个字节块，返回其中完整行解析出的文本片段
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut fragments = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            if self.done {
                continue;
            }
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                continue;
            }
            let Ok(parsed) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            if let Some(text) = parsed
                .pointer("/choices/0/delta/content")
                .and_then(Value::as_str)
            {
                if !text.is_empty() {
                    fragments.push(text.to_string());
                }
            }
        }
        fragments
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<String, LlmError> {
        let body = self.body(messages, options, false);
        let resp = self.post(&body, self.request_timeout).await?;
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;
        extract_content(&payload)
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
    ) -> Result<TextStream, LlmError> {
        let body = self.body(messages, options, true);
        let resp = self.post(&body, self.stream_timeout).await?;
        let bytes = Box::pin(resp.bytes_stream());

        let state = (bytes, SseDecoder::default(), VecDeque::<String>::new());
        let fragments = stream::unfold(state, |(mut bytes, mut decoder, mut pending)| async move {
            loop {
                if let Some(text) = pending.pop_front() {
                    return Some((Ok(text), (bytes, decoder, pending)));
                }
                if decoder.is_done() {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                    Some(Err(e)) => {
                        // 报告一次错误后结束
                        decoder.done = true;
                        return Some((Err(map_transport(e)), (bytes, decoder, pending)));
                    }
                    None => return None,
                }
            }
        });
        Ok(Box::pin(fragments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_content_and_error_payload() {
        let ok = json!({"choices": [{"message": {"content": "{\"done\": true}"}}]});
        assert_eq!(extract_content(&ok).unwrap(), "{\"done\": true}");

        let err = json!({"error": {"message": "model not loaded"}});
        assert_eq!(
            extract_content(&err).unwrap_err(),
            LlmError::Malformed("model not loaded".into())
        );
        assert!(extract_content(&json!({"choices": []})).is_err());
    }

    #[test]
    fn test_sse_decoder_handles_split_lines_and_done() {
        let mut d = SseDecoder::default();
        let mut out = d.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: {\"choi");
        out.extend(d.push(b"ces\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n"));
        out.extend(d.push(b"data: not-json\n\ndata: [DONE]\n\n"));
        out.extend(d.push(b"data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n"));
        assert_eq!(out, vec!["Hel", "lo"]);
        assert!(d.is_done());
    }

    #[test]
    fn test_request_body_shape() {
        let backend = OpenAiBackend::new(&LlmSection::default());
        let body = backend.body(&[Message::user("hi")], &CompletionOptions::new(0.3, 1000), true);
        assert_eq!(body["model"], "local-model");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["stream"], true);
    }
}
