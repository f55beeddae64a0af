//! 人工介入（HITL）
//!
//! 每轮生成前展示一块仪表盘，等待操作者输入：回车继续、自由文本作为高优先级指令、
//! 或控制命令（quit / /reset / /replan / /skip / /clear）。
//! 读取通过 `OperatorChannel` 抽象，终端实现在阻塞线程池里读 stdin，测试用脚本实现。

use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::memory::{Message, Role};
use crate::react::action::Action;
use crate::react::parser::parse_response;
use crate::react::state::AgentState;
use crate::utils::truncate_with;

const SEPARATOR_WIDTH: usize = 60;
const DIRECTIVE_OPEN: &str = "### USER DIRECTIVE ###";
const DIRECTIVE_CLOSE: &str = "######################";
const PROCEED: &str = "Proceed with next step.";
const REPETITION_PHRASES: [&str; 4] = ["don't repeat", "stop repeating", "you already said", "redundant"];

/// 操作者输入通道；返回 None 表示通道已关闭
#[async_trait]
pub trait OperatorChannel: Send + Sync {
    async fn prompt(&self, dashboard: &str) -> Option<String>;
}

/// 终端操作者：打印仪表盘并从 stdin 读一行
pub struct StdinOperator;

#[async_trait]
impl OperatorChannel for StdinOperator {
    async fn prompt(&self, dashboard: &str) -> Option<String> {
        let dashboard = dashboard.to_string();
        let read = tokio::task::spawn_blocking(move || {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "{}", dashboard);
            let _ = write!(
                out,
                "\n[USER] Feedback/Correction (ENTER to proceed, type 'quit' or special commands like /reset): "
            );
            let _ = out.flush();
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) => None,
                Ok(_) => Some(line),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read operator input");
                    None
                }
            }
        })
        .await;
        read.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "operator input task failed");
            None
        })
    }
}

/// 按顺序回放预设输入（测试用），并记录收到的仪表盘
#[derive(Default)]
pub struct ScriptedOperator {
    inputs: Mutex<VecDeque<String>>,
    dashboards: Mutex<Vec<String>>,
}

impl ScriptedOperator {
    pub fn new<I, S>(inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inputs: Mutex::new(inputs.into_iter().map(Into::into).collect()),
            dashboards: Mutex::new(Vec::new()),
        }
    }

    pub fn dashboards(&self) -> Vec<String> {
        self.dashboards.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl OperatorChannel for ScriptedOperator {
    async fn prompt(&self, dashboard: &str) -> Option<String> {
        if let Ok(mut d) = self.dashboards.lock() {
            d.push(dashboard.to_string());
        }
        // 脚本耗尽后一律回车继续
        let next = self.inputs.lock().ok().and_then(|mut i| i.pop_front());
        Some(next.unwrap_or_default())
    }
}

/// 操作者命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Proceed,
    Quit,
    Reset,
    Replan,
    Skip,
    Clear,
    RepetitionComplaint(String),
    Directive(String),
}

pub fn parse_operator_input(input: &str) -> OperatorCommand {
    let input = input.trim();
    let lower = input.to_lowercase();
    match lower.as_str() {
        "exit" | "quit" | "stop" => return OperatorCommand::Quit,
        "" => return OperatorCommand::Proceed,
        _ => {}
    }
    if lower.starts_with("/reset") {
        OperatorCommand::Reset
    } else if lower.starts_with("/replan") {
        OperatorCommand::Replan
    } else if lower.starts_with("/skip") {
        OperatorCommand::Skip
    } else if lower.starts_with("/clear") {
        OperatorCommand::Clear
    } else if REPETITION_PHRASES.iter().any(|p| lower.contains(p)) {
        OperatorCommand::RepetitionComplaint(input.to_string())
    } else {
        OperatorCommand::Directive(input.to_string())
    }
}

impl OperatorCommand {
    /// 下一轮提示中使用的指令文本；Quit 没有
    pub fn prompt_text(&self) -> Option<String> {
        let text = match self {
            OperatorCommand::Quit => return None,
            OperatorCommand::Proceed => PROCEED.to_string(),
            OperatorCommand::Reset => {
                "The user has reset your state. Start fresh with your current task.".to_string()
            }
            OperatorCommand::Replan => {
                "The user requests you to REPLAN from scratch. Review the goal and create a new plan.".to_string()
            }
            OperatorCommand::Skip => {
                "The user has skipped the current task. Move to the next task in your plan.".to_string()
            }
            OperatorCommand::Clear => "The user has cleared the conversation history. Start fresh.".to_string(),
            OperatorCommand::RepetitionComplaint(input) => format!(
                "\n\n{DIRECTIVE_OPEN}\n{input}\n\nCRITICAL: The user is frustrated with repetition. \
                 You MUST provide a completely DIFFERENT response or approach.\n{DIRECTIVE_CLOSE}\n"
            ),
            OperatorCommand::Directive(input) => format!("\n\n{DIRECTIVE_OPEN}\n{input}\n{DIRECTIVE_CLOSE}\n"),
        };
        Some(text)
    }
}

/// 简单按词折行
fn wrap(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let needed = current.chars().count() + word.chars().count() + usize::from(!current.is_empty());
        if needed > width && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// 用户消息在仪表盘中的简述
fn user_line(content: &str) -> String {
    if let Some((_, after)) = content.split_once(DIRECTIVE_OPEN) {
        let inner = after.split(DIRECTIVE_CLOSE).next().unwrap_or(after);
        return inner.trim().to_string();
    }
    if content.contains(PROCEED) {
        return "(No feedback - proceeding)".to_string();
    }
    content.lines().last().unwrap_or(content).trim().to_string()
}

/// 助手消息在仪表盘中的简述：chat 文本、chat 动作，或动作列表
fn assistant_line(content: &str) -> String {
    let parsed = parse_response(content);
    if let Some(chat) = parsed.chat {
        return chat;
    }
    if let Some(message) = parsed.actions.iter().find_map(|a| match a {
        Action::Chat { message } => Some(message.clone()),
        _ => None,
    }) {
        return message;
    }
    if parsed.actions.is_empty() {
        return "[Thinking...]".to_string();
    }
    let actions: Vec<String> = parsed
        .actions
        .iter()
        .map(|a| match a {
            Action::Write { file, .. } | Action::Read { file } => format!("{}({})", a.kind(), file),
            Action::Run { command } => format!("run({})", command),
            other => format!("{}()", other.kind()),
        })
        .collect();
    format!("[Performing Actions: {}]", actions.join(", "))
}

/// 最近 4 条非 system 消息
fn render_conversation(messages: &[Message], out: &mut String) {
    let chat: Vec<&Message> = messages.iter().filter(|m| m.role != Role::System).collect();
    let recent = &chat[chat.len().saturating_sub(4)..];
    if recent.is_empty() {
        return;
    }
    out.push_str("\n  RECENT CONVERSATION:\n");
    for msg in recent {
        if msg.role == Role::User {
            for (i, line) in wrap(&user_line(&msg.content), 50).iter().enumerate() {
                let prefix = if i == 0 { "You > " } else { "      " };
                let indent = 80usize.saturating_sub(line.chars().count() + 8);
                out.push_str(&format!("{}{}{}\n", " ".repeat(indent), prefix, line));
            }
        } else {
            for (i, line) in wrap(&assistant_line(&msg.content), 60).iter().enumerate() {
                let prefix = if i == 0 { "AGENT > " } else { "        " };
                out.push_str(&format!("  {}{}\n", prefix, line));
            }
        }
    }
}

/// 渲染仪表盘
pub fn render_dashboard(state: &AgentState, threshold: u32, messages: &[Message]) -> String {
    let sep = "=".repeat(SEPARATOR_WIDTH);
    let mut out = String::new();
    out.push_str(&format!(
        "\n{sep}\n  HUMAN-IN-THE-LOOP DASHBOARD (Iter {})\n{sep}\n",
        state.iteration
    ));
    out.push_str(&format!(
        "  Current Task:    {}\n",
        state.plan.current_task_id.as_deref().unwrap_or("---")
    ));

    let last = state.last_observation().unwrap_or("---");
    if last.to_lowercase().contains("chat message:") {
        let message = last
            .split_once("Result: Chat message: ")
            .or_else(|| last.split_once("Chat message: "))
            .map(|(_, m)| m)
            .unwrap_or(last);
        let message = truncate_with(message, 997, "...");
        out.push_str("  Last Chat:\n");
        for line in wrap(&message, 78) {
            out.push_str(&format!("  {}\n", line));
        }
    } else {
        out.push_str(&format!("  Last Obs:        {}\n", truncate_with(last, 997, "...")));
    }
    if last.contains("Result:") && !last.contains("Chat message:") {
        out.push_str("  [!] NEW DATA PENDING: Press ENTER to let the agent process the tool results above.\n");
    }

    out.push_str(&format!(
        "  Stagnation:      {}/{} ({})\n",
        state.stagnation_count,
        threshold,
        state.loop_type.map(|l| l.as_str()).unwrap_or("none")
    ));
    let done = state.plan.done_task_ids();
    out.push_str(&format!(
        "  Tasks Done:      {}\n",
        if done.is_empty() {
            "None".to_string()
        } else {
            done.join(", ")
        }
    ));
    render_conversation(messages, &mut out);
    out.push_str(&sep);
    out
}
