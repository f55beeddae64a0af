//! 面向人的状态文件：任务看板、累计历史、当前快照
//!
//! 全部由 AgentState 派生，每次保存时覆盖写入工作区；程序从不读回。

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::config::AppSection;
use crate::react::state::{AgentState, Task};
use crate::utils::truncate_chars;

pub struct StatusBoard {
    plan_path: PathBuf,
    whole_path: PathBuf,
    current_path: PathBuf,
}

fn task_line(task: &Task, active: bool) -> Vec<String> {
    let marker = if active { " 👈 **ACTIVE**" } else { "" };
    let mut lines = vec![format!(
        "- {} **{}**: {}{}",
        task.status.icon(),
        task.id,
        task.description,
        marker
    )];
    if let Some(result) = &task.result {
        lines.push(format!("  - _Result_: {}", result));
    }
    lines
}

impl StatusBoard {
    pub fn new(workspace: &Path, app: &AppSection) -> Self {
        Self {
            plan_path: workspace.join(&app.plan_file),
            whole_path: workspace.join(&app.whole_state_file),
            current_path: workspace.join(&app.current_state_file),
        }
    }

    /// 重写三个状态文件
    pub fn sync(&self, state: &AgentState) -> anyhow::Result<()> {
        write(&self.plan_path, &render_task_board(state))?;
        write(&self.whole_path, &render_history(state))?;
        write(&self.current_path, &render_current(state))?;
        Ok(())
    }
}

fn write(path: &Path, content: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content).with_context(|| format!("write {}", path.display()))
}

pub fn render_task_board(state: &AgentState) -> String {
    let mut md = vec![
        format!("# Task Board\n\n**Goal**: {}\n", state.goal),
        "## Plan Status\n".to_string(),
    ];
    if state.plan.tasks.is_empty() {
        md.push("_No tasks defined yet. Agent is planning..._".to_string());
    }
    for task in &state.plan.tasks {
        let active = state.plan.current_task_id.as_deref() == Some(task.id.as_str());
        md.extend(task_line(task, active));
    }
    md.join("\n")
}

pub fn render_history(state: &AgentState) -> String {
    let mut md = vec![
        format!("# Universal History\n\n**Goal**: {}\n", state.goal),
        "## Full Plan\n".to_string(),
    ];
    for task in &state.plan.tasks {
        md.extend(task_line(task, false));
    }
    md.push("\n## Iteration Log\n".to_string());
    for entry in &state.iteration_log {
        let task = entry
            .task_id
            .as_deref()
            .map(|t| format!(" [{}]", t))
            .unwrap_or_default();
        md.push(format!("### Iteration {}{}", entry.iteration, task));
        md.push(format!("{}\n", entry.summary));
    }
    md.join("\n")
}

pub fn render_current(state: &AgentState) -> String {
    let mut md = vec![
        "# Current State".to_string(),
        format!("**Iteration**: {}", state.iteration),
        format!(
            "**Active Task**: {}",
            state.plan.current_task_id.as_deref().unwrap_or("Planning...")
        ),
        "\n## Recent Observations".to_string(),
    ];
    let start = state.observations.len().saturating_sub(5);
    for obs in &state.observations[start..] {
        md.push(format!("- {}", truncate_chars(obs, 500)));
    }
    if !state.failures.is_empty() {
        md.push("\n## Recent Failures".to_string());
        let start = state.failures.len().saturating_sub(3);
        for failure in &state.failures[start..] {
            md.push(format!("- {}", failure));
        }
    }
    md.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::react::state::TaskStatus;
    use tempfile::TempDir;

    fn sample_state() -> AgentState {
        let mut state = AgentState::new("ship it");
        state.iteration = 2;
        state.plan.tasks = vec![
            Task {
                id: "T1".into(),
                description: "scaffold".into(),
                status: TaskStatus::Done,
                result: Some("created src/".into()),
            },
            Task {
                id: "T2".into(),
                description: "tests".into(),
                status: TaskStatus::InProgress,
                result: None,
            },
        ];
        state.plan.current_task_id = Some("T2".into());
        state.observations = vec!["Wrote 10 bytes to a.py".into()];
        state.record_iteration(10);
        state
    }

    #[test]
    fn test_task_board_marks_active_task() {
        let md = render_task_board(&sample_state());
        assert!(md.contains("- ✅ **T1**: scaffold"));
        assert!(md.contains("  - _Result_: created src/"));
        assert!(md.contains("- ⏳ **T2**: tests 👈 **ACTIVE**"));
    }

    #[test]
    fn test_empty_plan_placeholder() {
        let md = render_task_board(&AgentState::new("g"));
        assert!(md.contains("_No tasks defined yet. Agent is planning..._"));
        assert!(render_current(&AgentState::new("g")).contains("**Active Task**: Planning..."));
    }

    #[test]
    fn test_sync_writes_three_files() {
        let dir = TempDir::new().unwrap();
        let board = StatusBoard::new(dir.path(), &AppSection::default());
        board.sync(&sample_state()).unwrap();
        let history = std::fs::read_to_string(dir.path().join("whole.task.md")).unwrap();
        assert!(history.contains("### Iteration 2 [T2]"));
        assert!(dir.path().join("todo.md").exists());
        assert!(dir.path().join("current.state.md").exists());
    }
}
