//! 提示词构造：系统提示、目标摘要、每轮的状态快照提示

use serde_json::{json, Map, Value};

use crate::react::state::AgentState;
use crate::utils::truncate_chars;

pub const PROCEED: &str = "Proceed with next step.";

/// 目标摘要的最大字符数与行数
const BRIEF_MAX_CHARS: usize = 500;
const BRIEF_MAX_LINES: usize = 15;

pub const DEFAULT_SYSTEM_PROMPT: &str = r####"You are an autonomous loop controller, a high-privilege agent working inside a sandboxed workspace.

SYSTEM AUTHORITY (CRITICAL):
- You have DIRECT ACCESS to the terminal and filesystem of the workspace.
- You are NOT a restricted text-only AI. Use tools to verify reality instead of guessing.

CRITICAL: You MUST output a JSON state block. If you're running low on space, OUTPUT THE JSON FIRST.

STRATEGIC PLANNING:
- Manage a "plan" object to track progress.
- Decompose the goal into discrete tasks (T1, T2, etc.).
- Update task status to "done" and provide a "result" summary when finished.
- Use "plan_update" in your JSON to modify the plan, e.g. {"plan_update": {"current_task_id": "T1", "tasks": [{"id": "T1", "description": "...", "status": "in_progress"}]}}
- Set {"done": true} once the whole goal is complete.

TASK COMPLETION CRITERIA (ANTI-STAGNATION):
- If the user asks a direct question (e.g. "what is 2+2"), answer it using the "chat" action.
- A task is "done" when the required files exist and contain working code, OR when a direct question has been answered.
- If code is written and tested successfully, mark the task "done".

Rules:
0. CRITICAL: If you see a "### USER DIRECTIVE ###" block, you MUST prioritize its instructions above all else.
1. Keep responses concise and focused.
2. If an action fails or returns "Skipped: identical content", DO NOT repeat it.
3. Use "chat" for questions, greetings, or simple logic that doesn't need a script.

STRICT SCHEMA RULES:
1. Write/Edit: {"action": "write", "file": "name.py", "content": "..."}
2. Run command: {"action": "run", "command": "..."}
3. Read file: {"action": "read", "file": "..."}
4. List files: {"action": "ls", "path": "...", "recursive": true}
5. Make directory: {"action": "mkdir", "path": "..."}
6. Search files: {"action": "grep", "query": "regex or text"}
7. Chat/Answer: {"action": "chat", "message": "Your text answer here"}
8. Web Search: {"action": "search", "query": "Your search query"}
9. Web Read: {"action": "web_read", "url": "https://example.com"}
10. Remember: {"store_knowledge": {"pattern": "when this comes up", "info": "what to recall"}}
Several actions may be batched as {"execute": [ ... ]}.

ARCHITECTURE CONTEXT:
- Layered reasoning: an internal draft/critique/refine loop for deep planning and research validation.
- History compression: older iterations are rewritten into a dense narrative summary sent with each state.

IMPORTANT: Simply stating you did it is NOT enough. If code is required, you MUST use "write". If only an answer is required, use "chat". Use "search" to verify current information or find solutions online.
"####;

/// 目标摘要：跳过空行与分隔线，遇到第二个 markdown 标题即停止；最多 15 行 / 500 字符
pub fn brief_goal(goal: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut chars = 0;
    for line in goal.lines() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with("---") || stripped.starts_with("===") {
            continue;
        }
        if stripped.starts_with('#') && lines.iter().any(|l| l.starts_with('#')) {
            break;
        }
        lines.push(line);
        chars += line.chars().count();
        if chars >= BRIEF_MAX_CHARS {
            break;
        }
    }
    lines.truncate(BRIEF_MAX_LINES);
    let brief = lines.join("\n");
    if brief.is_empty() {
        return "Build the application as specified.".to_string();
    }
    if brief.chars().count() > BRIEF_MAX_CHARS {
        format!("{}...", truncate_chars(&brief, BRIEF_MAX_CHARS))
    } else {
        brief
    }
}

/// 系统提示：固定说明 + 目标摘要 + 完整目标文件位置
pub fn system_prompt(goal: &str, spec_file: &str) -> String {
    format!(
        "{DEFAULT_SYSTEM_PROMPT}\n\n=== YOUR GOAL (Brief) ===\n{}\n\n\
         Full specification available in workspace: '{spec_file}' (use read action to access)\n\
         Your plan status is sent with each iteration.\n=================\n",
        brief_goal(goal)
    )
}

/// 每轮发送给模型的状态快照
pub fn state_summary(state: &AgentState, threshold: u32) -> Value {
    let plan_status: Map<String, Value> = state
        .plan
        .tasks
        .iter()
        .map(|t| (t.id.clone(), json!(t.status)))
        .collect();
    json!({
        "iteration": state.iteration,
        "active_task": state.plan.current_task_id,
        "stagnation_metrics": {
            "count": state.stagnation_count,
            "threshold": threshold,
            "detected_loop": state.loop_type.map(|l| l.as_str()).unwrap_or("none"),
        },
        "history_summary": state.history_summary,
        "recent_observations": state.observations,
        "plan_status": plan_status,
    })
}

/// `Current State:` + 状态 JSON + 本轮指令 + 可选的停滞补救块
pub fn user_prompt(state: &AgentState, threshold: u32, instruction: &str, repetition_note: &str) -> String {
    let summary = state_summary(state, threshold);
    let pretty = serde_json::to_string_pretty(&summary).unwrap_or_else(|_| summary.to_string());
    format!("Current State:\n{pretty}\n\n{instruction}{repetition_note}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::react::stagnation::LoopType;
    use crate::react::state::{Task, TaskStatus};

    #[test]
    fn test_brief_goal_stops_at_second_header() {
        let goal = "# Todo CLI\n\nBuild a todo app.\n---\nIt stores items in sqlite.\n\n## Details\nlots of text";
        assert_eq!(brief_goal(goal), "# Todo CLI\nBuild a todo app.\nIt stores items in sqlite.");
        assert_eq!(brief_goal("\n\n"), "Build the application as specified.");
    }

    #[test]
    fn test_brief_goal_caps_length() {
        let goal = "word ".repeat(300);
        let brief = brief_goal(&goal);
        assert_eq!(brief.chars().count(), 503);
        assert!(brief.ends_with("..."));
    }

    #[test]
    fn test_system_prompt_mentions_spec_file() {
        let p = system_prompt("Build it", "_full_spec.md");
        assert!(p.contains("=== YOUR GOAL (Brief) ===\nBuild it\n"));
        assert!(p.contains("'_full_spec.md'"));
    }

    #[test]
    fn test_user_prompt_shape() {
        let mut state = AgentState::new("goal");
        state.iteration = 2;
        state.loop_type = Some(LoopType::ReadLoop);
        state.plan.tasks.push(Task {
            id: "T1".into(),
            description: String::new(),
            status: TaskStatus::InProgress,
            result: None,
        });
        let prompt = user_prompt(&state, 5, PROCEED, "");
        assert!(prompt.starts_with("Current State:\n{\n  \""));
        assert!(prompt.ends_with("}\n\nProceed with next step."));

        let summary = state_summary(&state, 5);
        assert_eq!(summary["plan_status"]["T1"], "in_progress");
        assert_eq!(summary["stagnation_metrics"]["detected_loop"], "read_loop");
        assert!(summary["active_task"].is_null());
    }
}
