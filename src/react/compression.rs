//! 递归历史压缩（RCH）
//!
//! 对话字符数达到 max_context_chars 的阈值比例，或迭代数是 interval 的整数倍时触发；
//! 前提是存在可压缩的材料（已有摘要，或至少 2 条观察）。
//! 让模型把 {旧摘要 + 最近原始观察 + 最近迭代日志} 改写成一段有上限的因果叙述，
//! 结果替换 history_summary，观察缓冲只留最近几条，并累计压缩指标。

use crate::config::RchSection;
use crate::llm::{Completion, CompletionOptions, Gateway};
use crate::memory::Message;
use crate::react::state::{AgentState, SizePoint};
use crate::utils::truncate_chars;

const TRUNCATION_MARKER: &str = "...";

/// 触发原因
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trigger {
    /// 上下文使用率达到阈值（值为使用率，0..1）
    Threshold(f64),
    Interval,
}

pub struct HistoryCompressor {
    cfg: RchSection,
    max_context_chars: usize,
    /// 压缩后保留的最近观察条数
    keep_observations: usize,
}

impl HistoryCompressor {
    pub fn new(cfg: RchSection, max_context_chars: usize, keep_observations: usize) -> Self {
        Self {
            cfg,
            max_context_chars,
            keep_observations,
        }
    }

    pub fn should_compress(&self, state: &AgentState, transcript_chars: usize) -> Option<Trigger> {
        if !self.cfg.enabled {
            return None;
        }
        if state.history_summary.is_empty() && state.observations.len() < 2 {
            return None;
        }
        let threshold = self.max_context_chars as f64 * self.cfg.threshold_percent;
        if transcript_chars as f64 >= threshold {
            let usage = transcript_chars as f64 / self.max_context_chars.max(1) as f64;
            return Some(Trigger::Threshold(usage));
        }
        if self.cfg.interval > 0 && state.iteration % self.cfg.interval == 0 {
            return Some(Trigger::Interval);
        }
        None
    }

    /// 最近原始观察，`• ` 前缀逐行
    fn raw_logs(&self, state: &AgentState) -> (usize, String) {
        let start = state.observations.len().saturating_sub(self.cfg.recent_observations);
        let recent = &state.observations[start..];
        let text = recent
            .iter()
            .map(|o| format!("• {}", o))
            .collect::<Vec<_>>()
            .join("\n");
        (recent.len(), text)
    }

    pub fn build_prompt(&self, state: &AgentState) -> String {
        let (count, raw) = self.raw_logs(state);
        let start = state.iteration_log.len().saturating_sub(self.cfg.recent_log_entries);
        let log = state.iteration_log[start..]
            .iter()
            .map(|r| {
                format!(
                    "Iter {}: Task {} - {}",
                    r.iteration,
                    r.task_id.as_deref().unwrap_or("None"),
                    truncate_chars(&r.summary, 200)
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let summary = if state.history_summary.is_empty() {
            "(No previous summary)"
        } else {
            state.history_summary.as_str()
        };

        format!(
            "You are a project historian tasked with creating a high-density narrative summary.\n\n\
             Your goal: Compress the raw logs into a coherent story (MAX {cap} chars) that captures:\n\
             1. KEY DECISIONS and the reasoning behind them\n\
             2. FAILURES and their root causes\n\
             3. SUCCESSFUL OUTCOMES and what enabled them\n\
             4. ARCHITECTURAL CHANGES or pivots in approach\n\
             5. IMPORTANT CONTEXT that future iterations need\n\n\
             DISCARD noise such as:\n\
             - Successful file creations (unless architecturally significant)\n\
             - Repeated commands that didn't change anything\n\
             - Generic observations like \"Exit 0\" or \"file written\"\n\
             - Redundant status updates\n\n\
             PRESERVE intent and causality:\n\
             - WHY decisions were made, not just WHAT was done\n\
             - Connections between failures and subsequent fixes\n\
             - Evolution of the codebase/approach\n\n\
             Output ONLY the compressed summary, no preamble. Be concise and factual.\n\n\
             \nCURRENT HISTORY SUMMARY:\n{summary}\n\n\
             RECENT RAW LOGS (Last {count} observations):\n{raw}\n\n\
             ITERATION LOG:\n{log}\n\n\n\
             COMPRESSED SUMMARY:",
            cap = self.cfg.max_summary_chars,
        )
    }

    /// 执行一次压缩；后端出错时只告警，state 保持不变。返回是否压缩成功
    pub async fn compress(&self, gateway: &Gateway, state: &mut AgentState, trigger: Trigger) -> bool {
        match trigger {
            Trigger::Threshold(usage) => tracing::info!(
                iteration = state.iteration,
                usage = %format!("{:.1}%", usage * 100.0),
                "history compression triggered by context usage"
            ),
            Trigger::Interval => tracing::info!(
                iteration = state.iteration,
                "history compression triggered by interval"
            ),
        }

        let (_, raw) = self.raw_logs(state);
        let pre = state.history_summary.chars().count() + raw.chars().count();
        let prompt = self.build_prompt(state);
        let options = CompletionOptions::new(self.cfg.temperature, self.cfg.max_tokens);

        let started = std::time::Instant::now();
        let text = match gateway.chat_completion(&[Message::user(prompt)], &options).await {
            Completion::Text(t) => t,
            Completion::Error(e) => {
                tracing::warn!(error = %e, "history compression failed, keeping previous summary");
                return false;
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let compressed = self.enforce_cap(text.trim());
        let post = compressed.chars().count();
        self.record(state, compressed, pre, post);

        let m = &state.rch_metrics;
        tracing::info!(
            iteration = state.iteration,
            compression = m.compressions,
            chars_before = pre,
            chars_after = post,
            ratio = %format!("{:.1}%", m.last_ratio),
            tokens_saved = pre.saturating_sub(post) / self.cfg.chars_per_token.max(1),
            total_tokens_saved = m.tokens_saved,
            elapsed_ms,
            "history compressed"
        );
        true
    }

    /// 超过上限时截断并加标记，总长不超过上限
    pub fn enforce_cap(&self, text: &str) -> String {
        let cap = self.cfg.max_summary_chars;
        if text.chars().count() <= cap {
            return text.to_string();
        }
        // 上限放不下标记时只做硬截断
        if cap <= TRUNCATION_MARKER.len() {
            return truncate_chars(text, cap).to_string();
        }
        let keep = cap - TRUNCATION_MARKER.len();
        format!("{}{}", truncate_chars(text, keep), TRUNCATION_MARKER)
    }

    fn record(&self, state: &mut AgentState, compressed: String, pre: usize, post: usize) {
        let metrics = &mut state.rch_metrics;
        metrics.compressions += 1;
        metrics.chars_before += pre;
        metrics.chars_after += post;
        metrics.tokens_saved += pre.saturating_sub(post) / self.cfg.chars_per_token.max(1);
        metrics.last_ratio = if pre > 0 {
            (1.0 - post as f64 / pre as f64) * 100.0
        } else {
            0.0
        };
        metrics.size_trend.push(SizePoint {
            iteration: state.iteration,
            size: post,
        });

        state.history_summary = compressed;
        let start = state.observations.len().saturating_sub(self.keep_observations);
        state.observations.drain(..start);
    }
}

/// 运行结束时的压缩会话汇总（至少压缩过一次才输出）
pub fn log_session_summary(state: &AgentState) {
    let m = &state.rch_metrics;
    if m.compressions == 0 {
        return;
    }
    let overall = if m.chars_before > 0 {
        (1.0 - m.chars_after as f64 / m.chars_before as f64) * 100.0
    } else {
        0.0
    };
    let trend = m
        .size_trend
        .iter()
        .map(|p| format!("{}:{}", p.iteration, p.size))
        .collect::<Vec<_>>()
        .join(",");
    tracing::info!(
        compressions = m.compressions,
        chars_before = m.chars_before,
        chars_after = m.chars_after,
        overall_ratio = %format!("{:.1}%", overall),
        tokens_saved = m.tokens_saved,
        size_trend = %trend,
        "history compression session summary"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InjectionMethod, MemorySection};
    use crate::llm::{LlmError, ScriptedBackend};
    use crate::memory::MemoryStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn compressor(max_summary_chars: usize) -> HistoryCompressor {
        let cfg = RchSection {
            max_summary_chars,
            ..Default::default()
        };
        HistoryCompressor::new(cfg, 100_000, 3)
    }

    fn gateway(dir: &TempDir, backend: Arc<ScriptedBackend>) -> Gateway {
        let store = Arc::new(MemoryStore::open(dir.path(), vec![2, 3], 64).unwrap());
        let cfg = MemorySection {
            injection: InjectionMethod::None,
            ..Default::default()
        };
        Gateway::new(backend, store, cfg)
    }

    fn state_with(observations: usize) -> AgentState {
        let mut state = AgentState::new("goal");
        state.iteration = 5;
        state.observations = (0..observations).map(|i| format!("observation {i}")).collect();
        state
    }

    #[test]
    fn test_triggers() {
        let c = compressor(2000);
        let mut state = state_with(1);
        assert_eq!(c.should_compress(&state, 95_000), None);
        state.observations.push("second".into());
        assert_eq!(c.should_compress(&state, 100), Some(Trigger::Interval));
        state.iteration = 6;
        assert_eq!(c.should_compress(&state, 100), None);
        assert!(matches!(c.should_compress(&state, 90_000), Some(Trigger::Threshold(_))));
    }

    #[test]
    fn test_prompt_contains_sections() {
        let c = compressor(2000);
        let mut state = state_with(12);
        state.observations.push("latest".into());
        let prompt = c.build_prompt(&state);
        assert!(prompt.contains("MAX 2000 chars"));
        assert!(prompt.contains("(No previous summary)"));
        assert!(prompt.contains("RECENT RAW LOGS (Last 10 observations):\n• observation 3"));
        assert!(!prompt.contains("• observation 2\n"));
        assert!(prompt.ends_with("COMPRESSED SUMMARY:"));
    }

    #[test]
    fn test_cap_smaller_than_marker_still_holds() {
        for cap in [0, 2, 3] {
            let capped = compressor(cap).enforce_cap("abcdefgh");
            assert_eq!(capped.chars().count(), cap);
        }
        assert_eq!(compressor(4).enforce_cap("abcdefgh"), "a...");
    }

    #[tokio::test]
    async fn test_overlong_output_is_capped_with_marker() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(["n".repeat(500)]));
        let gw = gateway(&dir, backend.clone());
        let c = compressor(100);
        let mut state = state_with(6);

        assert!(c.compress(&gw, &mut state, Trigger::Interval).await);
        assert_eq!(state.history_summary.chars().count(), 100);
        assert!(state.history_summary.ends_with("..."));
        assert_eq!(state.observations.len(), 3);
        assert_eq!(state.rch_metrics.compressions, 1);
        assert_eq!(state.rch_metrics.size_trend[0].size, 100);

        let call = &backend.calls()[0];
        assert!(!call.streamed);
        assert_eq!(call.options.max_tokens, 1000);
        assert_eq!(call.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_backend_error_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(Vec::<String>::new()));
        backend.push_error(LlmError::Timeout);
        let gw = gateway(&dir, backend);
        let c = compressor(2000);
        let mut state = state_with(6);
        let before = state.clone();
        assert!(!c.compress(&gw, &mut state, Trigger::Interval).await);
        assert_eq!(state, before);
    }

    #[tokio::test]
    async fn test_metrics_accumulate() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(ScriptedBackend::new(["short story", "shorter"]));
        let gw = gateway(&dir, backend);
        let c = compressor(2000);
        let mut state = state_with(8);
        c.compress(&gw, &mut state, Trigger::Interval).await;
        state.observations.extend(["a".to_string(), "b".to_string()]);
        state.iteration = 10;
        c.compress(&gw, &mut state, Trigger::Interval).await;

        let m = &state.rch_metrics;
        assert_eq!(m.compressions, 2);
        assert_eq!(state.history_summary, "shorter");
        assert!(m.tokens_saved > 0);
        assert!(m.last_ratio > 0.0);
        assert_eq!(m.size_trend.len(), 2);
        log_session_summary(&state);
    }
}
