//! 运行状态：计划、观察、历史摘要、迭代日志、停滞计数、RCH 指标
//!
//! AgentState 只由 LoopController 持有和修改，每轮结束时整体落盘。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::react::action::{PlanPatch, TasksPatch};
use crate::react::stagnation::LoopType;
use crate::utils::truncate_chars;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
    Skipped,
}

impl TaskStatus {
    /// 宽松解析模型给出的状态字符串；无法识别时视为 todo
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "in_progress" | "doing" | "active" | "started" => TaskStatus::InProgress,
            "done" | "complete" | "completed" | "finished" => TaskStatus::Done,
            "skipped" | "skip" => TaskStatus::Skipped,
            _ => TaskStatus::Todo,
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            TaskStatus::Done => "✅",
            TaskStatus::InProgress => "⏳",
            TaskStatus::Todo | TaskStatus::Skipped => "⚪",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default, alias = "desc")]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

fn value_to_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

impl Task {
    /// 从模型输出的任意 JSON 对象构造任务；缺少 id 时返回 None
    pub fn from_value(v: &Value) -> Option<Self> {
        let obj = v.as_object()?;
        let id = obj.get("id").and_then(value_to_text)?;
        let mut task = Task {
            id,
            description: String::new(),
            status: TaskStatus::Todo,
            result: None,
        };
        task.apply_changes(obj);
        Some(task)
    }

    /// 定向字段更新（description/desc、status、result）
    pub fn apply_changes(&mut self, changes: &serde_json::Map<String, Value>) {
        for (k, v) in changes {
            match k.as_str() {
                "description" | "desc" => {
                    if let Some(d) = value_to_text(v) {
                        self.description = d;
                    }
                }
                "status" => {
                    if let Some(s) = v.as_str() {
                        self.status = TaskStatus::parse_lenient(s);
                    }
                }
                "result" => self.result = value_to_text(v),
                _ => {}
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub current_task_id: Option<String>,
}

impl Plan {
    /// 应用计划补丁：有 current_task_id 则设置；列表整体替换；映射按 id 定向更新
    pub fn apply(&mut self, patch: &PlanPatch) {
        if let Some(current) = &patch.current_task_id {
            self.current_task_id = current.clone();
        }
        match &patch.tasks {
            TasksPatch::Replace(tasks) => self.tasks = tasks.clone(),
            TasksPatch::Targeted(updates) => {
                for (id, changes) in updates {
                    let Some(changes) = changes.as_object() else {
                        continue;
                    };
                    if let Some(task) = self.tasks.iter_mut().find(|t| &t.id == id) {
                        task.apply_changes(changes);
                    }
                }
            }
            TasksPatch::None => {}
        }
    }

    pub fn current_task_mut(&mut self) -> Option<&mut Task> {
        let id = self.current_task_id.clone()?;
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn done_task_ids(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Done)
            .map(|t| t.id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    #[serde(default)]
    pub task_id: Option<String>,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizePoint {
    pub iteration: u32,
    pub size: usize,
}

/// 递归历史压缩累计指标
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RchMetrics {
    pub compressions: u32,
    pub chars_before: usize,
    pub chars_after: usize,
    pub tokens_saved: usize,
    /// 最近一次压缩率（%）
    pub last_ratio: f64,
    pub size_trend: Vec<SizePoint>,
}

/// 迭代日志摘要的最大字符数
const ITERATION_SUMMARY_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub goal: String,
    pub iteration: u32,
    #[serde(default)]
    pub plan: Plan,
    #[serde(default)]
    pub observations: Vec<String>,
    #[serde(default)]
    pub history_summary: String,
    #[serde(default)]
    pub iteration_log: Vec<IterationRecord>,
    #[serde(default)]
    pub stagnation_count: u32,
    #[serde(default)]
    pub loop_type: Option<LoopType>,
    #[serde(default)]
    pub rch_metrics: RchMetrics,
    #[serde(default)]
    pub failures: Vec<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentState {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            iteration: 0,
            plan: Plan::default(),
            observations: Vec::new(),
            history_summary: String::new(),
            iteration_log: Vec::new(),
            stagnation_count: 0,
            loop_type: None,
            rch_metrics: RchMetrics::default(),
            failures: Vec::new(),
            done: false,
            error: None,
        }
    }

    pub fn last_observation(&self) -> Option<&str> {
        self.observations.last().map(String::as_str)
    }

    /// 记录本轮迭代日志（每轮至多一条），并把日志限制在 max_entries 条以内
    pub fn record_iteration(&mut self, max_entries: usize) {
        if self.observations.is_empty() {
            return;
        }
        if self
            .iteration_log
            .last()
            .is_some_and(|r| r.iteration == self.iteration)
        {
            return;
        }
        let start = self.observations.len().saturating_sub(3);
        let joined = self.observations[start..].join(" | ");
        self.iteration_log.push(IterationRecord {
            iteration: self.iteration,
            task_id: self.plan.current_task_id.clone(),
            summary: truncate_chars(&joined, ITERATION_SUMMARY_CHARS).to_string(),
        });
        if self.iteration_log.len() > max_entries.max(1) {
            let excess = self.iteration_log.len() - max_entries.max(1);
            self.iteration_log.drain(..excess);
        }
    }

    /// 终止运行并记录原因
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        self.failures.push(reason.clone());
        self.error = Some(reason);
        self.done = true;
    }
}
