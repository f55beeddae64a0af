//! 分层推理：草稿 -> 自评 -> 修正
//!
//! depth = 0 时只做一次前向调用；depth ≥ 1 时三次顺序调用，只有修正阶段的输出作为本轮回复。
//! 中间轮次放在 `internal` 里，是否写入对话由调用方按 preserve_internal_logs 决定。

use std::time::{Duration, Instant};

use crate::config::ReasoningSection;
use crate::core::AgentError;
use crate::llm::{Completion, CompletionOptions, Gateway};
use crate::memory::Message;

pub const CRITIQUE_INSTRUCTION: &str = "CRITIQUE: Review your previous plan for logic errors or missing data. \
CRITICAL: If the plan involves facts you aren't 100% sure of, suggest a SEARCH. \
If we just performed a search, did the results actually answer the user, or do we need to 'web_read' a specific URL? \
Highlight flaws and missing info, but DO NOT generate JSON yet.";

pub const REFINE_INSTRUCTION: &str = "FINAL REFINEMENT: Incorporate your self-critique. If you decided a search or web_read is needed, \
output that action now. Otherwise, provide the corrected implementation JSON.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Draft,
    Critique,
    Refine,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Draft => "draft",
            Stage::Critique => "critique",
            Stage::Refine => "refine",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReasoningOutcome {
    /// 本轮实际回复
    pub response: String,
    /// 中间轮次（草稿、自评指令、自评、修正指令）
    pub internal: Vec<Message>,
    pub timings: Vec<(Stage, Duration)>,
}

pub struct LayeredReasoner {
    cfg: ReasoningSection,
    /// 草稿与修正阶段的采样参数
    options: CompletionOptions,
    /// 自评阶段不限制输出长度，沿用全局 max_tokens
    critique_options: CompletionOptions,
}

impl LayeredReasoner {
    pub fn new(cfg: ReasoningSection, temperature: f32, max_tokens: u32) -> Self {
        Self {
            cfg,
            options: CompletionOptions::new(temperature, 2000),
            critique_options: CompletionOptions::new(temperature, max_tokens),
        }
    }

    pub fn depth(&self) -> u32 {
        self.cfg.depth
    }

    pub fn preserve_internal_logs(&self) -> bool {
        self.cfg.preserve_internal_logs
    }

    /// 是否对本轮启用分层推理
    pub fn should_engage(&self, confusion: bool) -> bool {
        self.cfg.enabled && self.cfg.depth > 0 && (!self.cfg.only_on_confusion || confusion)
    }

    async fn stage(
        &self,
        gateway: &Gateway,
        stage: Stage,
        messages: &[Message],
        options: &CompletionOptions,
        timings: &mut Vec<(Stage, Duration)>,
    ) -> Result<String, AgentError> {
        let started = Instant::now();
        let result = gateway.chat_completion(messages, options).await;
        let elapsed = started.elapsed();
        timings.push((stage, elapsed));
        tracing::debug!(stage = stage.as_str(), elapsed_ms = elapsed.as_millis() as u64, "reasoning stage finished");
        match result {
            Completion::Text(text) => Ok(text),
            Completion::Error(e) => Err(AgentError::Transport(format!("{} stage failed: {}", stage.as_str(), e))),
        }
    }

    /// 执行推理；任一阶段出错即以该错误中止
    pub async fn run(&self, gateway: &Gateway, messages: &[Message]) -> Result<ReasoningOutcome, AgentError> {
        let started = Instant::now();
        let mut timings = Vec::with_capacity(3);

        let draft = self
            .stage(gateway, Stage::Draft, messages, &self.options, &mut timings)
            .await?;
        if self.cfg.depth == 0 {
            return Ok(ReasoningOutcome {
                response: draft,
                internal: Vec::new(),
                timings,
            });
        }

        let mut transcript = messages.to_vec();
        transcript.push(Message::assistant(draft));
        transcript.push(Message::user(CRITIQUE_INSTRUCTION));
        let critique = self
            .stage(gateway, Stage::Critique, &transcript, &self.critique_options, &mut timings)
            .await?;

        transcript.push(Message::assistant(critique));
        transcript.push(Message::user(REFINE_INSTRUCTION));
        let response = self
            .stage(gateway, Stage::Refine, &transcript, &self.options, &mut timings)
            .await?;

        tracing::info!(
            depth = self.cfg.depth,
            total_ms = started.elapsed().as_millis() as u64,
            "layered reasoning finished"
        );
        let internal = transcript.split_off(messages.len());
        Ok(ReasoningOutcome {
            response,
            internal,
            timings,
        })
    }
}

/// 困惑信号：本轮检测到停滞、停滞计数非零，或最近观察含错误
pub fn is_confused(looping: bool, stagnation_count: u32, last_observation: Option<&str>) -> bool {
    let errored = last_observation
        .is_some_and(|o| o.contains("Error:") || o.to_lowercase().contains("failed"));
    looping || stagnation_count > 0 || errored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InjectionMethod, MemorySection};
    use crate::llm::{LlmError, ScriptedBackend};
    use crate::memory::{MemoryStore, Role};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn gateway(dir: &TempDir, backend: Arc<ScriptedBackend>) -> Gateway {
        let store = Arc::new(MemoryStore::open(dir.path(), vec![2, 3], 64).unwrap());
        let cfg = MemorySection {
            injection: InjectionMethod::None,
            ..Default::default()
        };
        Gateway::new(backend, store, cfg)
    }

    fn reasoner(depth: u32) -> LayeredReasoner {
        let cfg = ReasoningSection {
            depth,
            ..Default::default()
        };
        LayeredReasoner::new(cfg, 0.7, 2000)
    }

    #[tokio::test]
    async fn test_depth_zero_single_call() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(["draft"]));
        let gw = gateway(&dir, backend.clone());
        let out = reasoner(0).run(&gw, &[Message::user("go")]).await.unwrap();
        assert_eq!(out.response, "draft");
        assert!(out.internal.is_empty());
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_three_stages_in_order() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(["draft", "critique", "{\"done\": true}"]));
        let gw = gateway(&dir, backend.clone());
        let base = [Message::system("sys"), Message::user("go")];
        let out = reasoner(1).run(&gw, &base).await.unwrap();

        assert_eq!(out.response, "{\"done\": true}");
        assert_eq!(out.internal.len(), 4);
        assert_eq!(out.internal[0], Message::assistant("draft"));
        assert_eq!(out.timings.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![
            Stage::Draft,
            Stage::Critique,
            Stage::Refine
        ]);

        let calls = backend.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].messages.last().unwrap().content, CRITIQUE_INSTRUCTION);
        let refine = &calls[2].messages;
        assert_eq!(refine[refine.len() - 2].role, Role::Assistant);
        assert_eq!(refine[refine.len() - 2].content, "critique");
        assert_eq!(refine.last().unwrap().content, REFINE_INSTRUCTION);
    }

    #[tokio::test]
    async fn test_stage_error_aborts() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(["draft"]));
        backend.push_error(LlmError::Timeout);
        let gw = gateway(&dir, backend.clone());
        let err = reasoner(1).run(&gw, &[Message::user("go")]).await.unwrap_err();
        assert!(err.to_string().contains("critique"));
        assert_eq!(backend.call_count(), 2);
    }

    #[test]
    fn test_gating() {
        let always = reasoner(1);
        assert!(always.should_engage(false));
        assert!(!reasoner(0).should_engage(true));

        let gated = LayeredReasoner::new(
            ReasoningSection {
                only_on_confusion: true,
                ..Default::default()
            },
            0.7,
            2000,
        );
        assert!(!gated.should_engage(false));
        assert!(gated.should_engage(true));

        assert!(is_confused(false, 0, Some("Result: Error: boom")));
        assert!(is_confused(false, 0, Some("build FAILED")));
        assert!(is_confused(false, 2, None));
        assert!(!is_confused(false, 0, Some("Wrote 3 bytes to a")));
    }
}
