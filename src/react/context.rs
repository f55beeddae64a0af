//! 对话上下文管理
//!
//! 同时维护两个预算：消息条数与总字符数。
//! - 条数超限：滑动窗口，丢弃最早的消息，system 消息固定在首位；保留的消息内容不变（利于后端前缀缓存）
//! - 字符超限：在滑动之后对除最近 thin_keep_recent 条以外的消息做有损稀疏化
//!   （assistant 压成摘要行，state 类 user 消息压成占位 + 末尾指令）
//!
//! 另有旧式观察合并 `consolidate_observations`：观察缓冲过长时把较早的观察折叠进 history_summary。

use crate::config::ContextSection;
use crate::memory::{total_chars, Message, Role};
use crate::react::action::Action;
use crate::react::parser::parse_response;
use crate::react::state::AgentState;
use crate::utils::{tail_chars, truncate_chars, truncate_with};

/// 稀疏化后 assistant 消息的前缀
pub const COMPRESSED_PREFIX: &str = "[Compressed] ";
const STATE_HEADER: &str = "Current State:";
const PROCEED: &str = "Proceed with next step.";
const STATE_PLACEHOLDER: &str = "Previous State [truncated]...";
const FALLBACK_NOTICE: &str = "No structured output found in response:";

const SUMMARY_ELLIPSIS: &str = "... ";

/// 合并时单条观察的最大字符数
const CONSOLIDATED_OBSERVATION_CHARS: usize = 500;

/// manage() 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextAction {
    Untouched,
    /// 仅滑动窗口（无损）
    Slid { before: usize, after: usize },
    /// 滑动后又做了稀疏化（有损）
    Thinned { before: usize, after: usize },
}

pub struct ContextManager {
    messages: Vec<Message>,
    cfg: ContextSection,
}

impl ContextManager {
    pub fn new(system_prompt: impl Into<String>, cfg: ContextSection) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
            cfg,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn total_chars(&self) -> usize {
        total_chars(&self.messages)
    }

    /// 只保留 system 消息
    pub fn clear_to_system(&mut self) {
        self.messages.truncate(1);
    }

    /// 按双预算整理对话
    pub fn manage(&mut self) -> ContextAction {
        let limit = self.cfg.max_messages().max(1);
        let chars = self.total_chars();
        let before = self.messages.len();
        let over_chars = chars > self.cfg.max_context_chars;
        if before <= limit + 1 && !over_chars {
            return ContextAction::Untouched;
        }

        let body_start = 1.max(before.saturating_sub(limit));
        let mut kept: Vec<Message> = Vec::with_capacity(limit + 1);
        kept.extend(self.messages.drain(..1));
        kept.extend(self.messages.drain(body_start - 1..));
        self.messages = kept;

        let chars = self.total_chars();
        if chars <= self.cfg.max_context_chars {
            tracing::debug!(before, after = self.messages.len(), "context window slid");
            return ContextAction::Slid {
                before,
                after: self.messages.len(),
            };
        }

        tracing::info!(
            chars,
            budget = self.cfg.max_context_chars,
            "context budget exceeded, thinning history"
        );
        let body_len = self.messages.len() - 1;
        let thin_until = 1 + body_len.saturating_sub(self.cfg.thin_keep_recent);
        for i in 1..thin_until {
            if let Some(thinned) = self.thin(&self.messages[i]) {
                self.messages[i] = thinned;
            }
        }
        tracing::debug!(
            before,
            after = self.messages.len(),
            chars_after = self.total_chars(),
            "context thinned"
        );
        ContextAction::Thinned {
            before,
            after: self.messages.len(),
        }
    }

    /// 单条消息的稀疏化版本；无需或无法缩短时返回 None
    fn thin(&self, message: &Message) -> Option<Message> {
        let replacement = match message.role {
            Role::Assistant if !message.content.starts_with(COMPRESSED_PREFIX) => Message::assistant(format!(
                "{}{}",
                COMPRESSED_PREFIX,
                digest(
                    &message.content,
                    self.cfg.preserve_reasoning_chars,
                    self.cfg.preserve_observation_chars
                )
            )),
            Role::User if message.content.contains(STATE_HEADER) => {
                Message::user(thin_state_prompt(&message.content))
            }
            _ => return None,
        };
        (replacement.char_len() < message.char_len()).then_some(replacement)
    }
}

/// state 类 user 消息的占位版本，只保留末尾指令
fn thin_state_prompt(content: &str) -> String {
    let marker = format!("\n\n{PROCEED}");
    if let Some((_, tail)) = content.split_once(&marker) {
        return format!("{STATE_PLACEHOLDER}\n\n{PROCEED}{tail}");
    }
    // 状态 JSON 顶层的右括号位于行首
    match content.split_once("\n}\n\n") {
        Some((_, instruction)) => format!("{STATE_PLACEHOLDER}\n\n{instruction}"),
        None => format!("{STATE_PLACEHOLDER}\n\n{PROCEED}"),
    }
}

/// assistant 消息摘要：推理开头、每个动作一行、结果、任务切换
pub fn digest(content: &str, reasoning_chars: usize, observation_chars: usize) -> String {
    let parsed = parse_response(content);
    let mut parts = Vec::new();

    let json_start = content.find("```json").or_else(|| content.find('{'));
    if let Some(pos) = json_start.filter(|p| content[..*p].chars().count() > 50) {
        let reasoning = content[..pos].trim();
        if !reasoning.is_empty() {
            parts.push(format!("Reasoning: {}", truncate_chars(reasoning, reasoning_chars)));
        }
    }

    parts.extend(parsed.actions.iter().map(Action::summary));

    if let Some(obs) = parsed
        .observation
        .as_deref()
        .filter(|o| !o.is_empty() && !o.starts_with(FALLBACK_NOTICE))
    {
        parts.push(format!("Result: {}", truncate_chars(obs, observation_chars)));
    }

    if let Some(task) = parsed.plan_update.as_ref().and_then(|p| p.switched_to()) {
        parts.push(format!("Switched to: {}", task));
    }

    if parts.is_empty() {
        "[No significant action]".to_string()
    } else {
        parts.join(" | ")
    }
}

/// 旧式观察合并：观察过多或过长时，把除最近几条外的观察去重、去噪后追加到 history_summary
///
/// 摘要上限为 `min(legacy_summary_cap, max_summary_chars)`，超出时保留尾部并加 `... ` 前缀。
/// 返回是否发生了合并。
pub fn consolidate_observations(state: &mut AgentState, cfg: &ContextSection, max_summary_chars: usize) -> bool {
    let total: usize = state.observations.iter().map(|o| o.chars().count()).sum();
    if state.observations.len() <= cfg.max_observations_before_summary && total <= cfg.observation_summary_chars {
        return false;
    }
    let keep = cfg.recent_observations_count;
    let split = state.observations.len().saturating_sub(keep);
    let older: Vec<String> = state.observations.drain(..split).collect();

    let mut kept: Vec<String> = Vec::new();
    for obs in older {
        let obs = obs.trim();
        if obs.is_empty() || obs.contains("Exit 0") || obs.contains("Wrote 0 bytes") {
            continue;
        }
        let obs = truncate_with(obs, CONSOLIDATED_OBSERVATION_CHARS, "...");
        if kept.last() != Some(&obs) {
            kept.push(obs);
        }
    }

    if !kept.is_empty() {
        state
            .history_summary
            .push_str(&format!("\n- Iter {}: {}", state.iteration, kept.join(" | ")));
    }

    let cap = cfg.legacy_summary_cap.min(max_summary_chars);
    if state.history_summary.chars().count() > cap {
        state.history_summary = if cap > SUMMARY_ELLIPSIS.len() {
            let tail = tail_chars(&state.history_summary, cap - SUMMARY_ELLIPSIS.len());
            format!("{SUMMARY_ELLIPSIS}{tail}")
        } else {
            tail_chars(&state.history_summary, cap).to_string()
        };
    }
    tracing::debug!(
        iteration = state.iteration,
        summary_chars = state.history_summary.chars().count(),
        remaining = state.observations.len(),
        "observations consolidated"
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(max_history: usize, max_chars: usize) -> ContextSection {
        ContextSection {
            max_message_history: max_history,
            max_context_chars: max_chars,
            ..Default::default()
        }
    }

    fn assistant_turn(i: usize) -> String {
        format!(
            "Let me think carefully about step {i}. {}\n```json\n{{\"action\": \"write\", \"file\": \"f{i}.py\", \"content\": \"{}\"}}\n```",
            "reasoning ".repeat(20),
            "x".repeat(400)
        )
    }

    #[test]
    fn test_slide_keeps_system_and_content() {
        let mut ctx = ContextManager::new("sys", section(2, 1_000_000));
        for i in 0..6 {
            ctx.push(Message::user(format!("u{i}")));
            ctx.push(Message::assistant(format!("a{i}")));
        }
        let action = ctx.manage();
        assert_eq!(action, ContextAction::Slid { before: 13, after: 5 });
        assert_eq!(ctx.messages()[0], Message::system("sys"));
        assert_eq!(ctx.messages()[1].content, "u4");
        assert_eq!(ctx.messages()[4].content, "a5");
    }

    #[test]
    fn test_slide_alone_fitting_budget_does_not_thin() {
        let mut ctx = ContextManager::new("sys", section(2, 2_000));
        for i in 0..4 {
            ctx.push(Message::user(format!("Current State:\n{{}}\n\nProceed with next step. {i}")));
            ctx.push(Message::assistant(assistant_turn(i)));
        }
        ctx.push(Message::user("u4"));
        ctx.push(Message::assistant("a4"));
        ctx.push(Message::user("u5"));
        ctx.push(Message::assistant(assistant_turn(5)));
        assert!(ctx.total_chars() > 2_000);

        assert_eq!(ctx.manage(), ContextAction::Slid { before: 13, after: 5 });
        assert!(ctx.total_chars() <= 2_000);
        assert_eq!(ctx.messages()[4].content, assistant_turn(5));
        assert!(ctx.messages().iter().all(|m| !m.content.starts_with(COMPRESSED_PREFIX)));
    }

    #[test]
    fn test_under_budget_untouched() {
        let mut ctx = ContextManager::new("sys", section(25, 100_000));
        ctx.push(Message::user("hi"));
        assert_eq!(ctx.manage(), ContextAction::Untouched);
    }

    #[test]
    fn test_thinning_shortens_all_but_recent_four() {
        let mut ctx = ContextManager::new("sys", section(25, 2_000));
        for i in 0..5 {
            ctx.push(Message::user(format!(
                "Current State:\n{{\n  \"iteration\": {i}\n}}\n\nProceed with next step."
            )));
            ctx.push(Message::assistant(assistant_turn(i)));
        }
        let before: Vec<Message> = ctx.messages().to_vec();
        let chars_before = ctx.total_chars();
        assert!(matches!(ctx.manage(), ContextAction::Thinned { .. }));
        let after = ctx.messages();
        assert_eq!(after.len(), before.len());
        let n = after.len();
        for i in 1..n - 4 {
            if after[i].role == Role::Assistant {
                assert!(after[i].char_len() < before[i].char_len());
                assert!(after[i].content.starts_with(COMPRESSED_PREFIX));
                assert!(after[i].content.contains("Action: write f"));
            }
        }
        for i in n - 4..n {
            assert_eq!(after[i], before[i]);
        }
        assert!(ctx.total_chars() < chars_before);
    }

    #[test]
    fn test_state_prompt_keeps_trailing_instruction() {
        let with_note = "Current State:\n{\n  \"a\": 1\n}\n\nProceed with next step.\n\nCRITICAL: change";
        assert_eq!(
            thin_state_prompt(with_note),
            "Previous State [truncated]...\n\nProceed with next step.\n\nCRITICAL: change"
        );
        let directive = "Current State:\n{\n  \"a\": {\n    \"b\": 1\n  }\n}\n\n### USER DIRECTIVE ###\nuse rust";
        assert_eq!(
            thin_state_prompt(directive),
            "Previous State [truncated]...\n\n### USER DIRECTIVE ###\nuse rust"
        );
    }

    #[test]
    fn test_digest_lines() {
        let text = format!(
            "{}\n```json\n{{\"observation\": \"tests pass\", \"plan_update\": {{\"current_task_id\": \"T2\"}}, \"execute\": [{{\"action\": \"run\", \"command\": \"pytest\"}}]}}\n```",
            "I should run the tests now to verify the fix is actually working."
        );
        let d = digest(&text, 200, 300);
        assert!(d.starts_with("Reasoning: I should run the tests"));
        assert!(d.contains("Action: run 'pytest'"));
        assert!(d.contains("Result: tests pass"));
        assert!(d.ends_with("Switched to: T2"));
        assert_eq!(digest("just prose", 200, 300), "[No significant action]");
    }

    #[test]
    fn test_consolidation_filters_noise_and_keeps_recent() {
        let cfg = ContextSection::default();
        let mut state = AgentState::new("goal");
        state.iteration = 7;
        state.observations = vec![
            "Exit 0".into(),
            "built module".into(),
            "built module".into(),
            "Wrote 0 bytes to x".into(),
            "long ".repeat(200),
        ];
        for i in 0..8 {
            state.observations.push(format!("recent {i}"));
        }
        assert!(consolidate_observations(&mut state, &cfg, 2000));
        assert_eq!(state.observations, vec!["recent 5", "recent 6", "recent 7"]);
        assert!(state.history_summary.starts_with("\n- Iter 7: built module | long long"));
        assert_eq!(state.history_summary.matches("built module").count(), 1);
        assert!(state.history_summary.contains("long ... | recent 0"));
    }

    #[test]
    fn test_consolidation_tiny_cap() {
        let cfg = ContextSection {
            max_observations_before_summary: 2,
            ..Default::default()
        };
        for cap in [3, 4, 5] {
            let mut state = AgentState::new("goal");
            state.observations = (0..6).map(|i| format!("obs {i}")).collect();
            assert!(consolidate_observations(&mut state, &cfg, cap));
            assert!(state.history_summary.chars().count() <= cap);
        }
    }

    #[test]
    fn test_consolidation_respects_cap() {
        let cfg = ContextSection {
            max_observations_before_summary: 2,
            ..Default::default()
        };
        let mut state = AgentState::new("goal");
        state.history_summary = "y".repeat(1990);
        state.observations = (0..6).map(|i| format!("obs {i} {}", "z".repeat(100))).collect();
        assert!(consolidate_observations(&mut state, &cfg, 2000));
        assert_eq!(state.history_summary.chars().count(), 2000);
        assert!(state.history_summary.starts_with("... "));
    }
}
