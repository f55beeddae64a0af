//! 动作与状态更新的强类型表示
//!
//! 模型输出先由 parser 抽取为 JSON 对象，再归一化为 `Update`，最后按合并规则折叠进 `ParsedResponse`：
//! - 带 `action` 键的对象 -> 追加一个 Action
//! - `execute`（单个或列表）-> 逐个追加，保持出现顺序
//! - observation / done / plan_update / chat / store_knowledge 等标量 -> 后写覆盖先写

use serde_json::{Map, Value};

use crate::react::state::Task;
use crate::utils::truncate_chars;

/// 封闭的动作集合
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// write / edit：edit 只影响展示名
    Write { file: String, content: String, edit: bool },
    Run { command: String },
    Read { file: String },
    Ls { path: String, recursive: bool },
    Mkdir { path: String },
    Grep { query: String },
    Chat { message: String },
    Search { query: String },
    WebRead { url: String },
    PlanUpdate(Value),
    StoreKnowledge { pattern: String, info: String },
    /// 已识别的动作但缺少必需字段
    Invalid { action: String, reason: String },
    Unknown { name: String, raw: Value },
}

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::String(_) | Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn bool_field(obj: &Map<String, Value>, key: &str) -> bool {
    match obj.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.to_lowercase().as_str(), "true" | "yes" | "1"),
        Some(Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
        _ => false,
    }
}

impl Action {
    /// 从已归一化的动作对象构造（`action` 键为类型名）
    pub fn from_object(obj: &Map<String, Value>) -> Action {
        let name = obj
            .get("action")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_lowercase())
            .unwrap_or_default();
        let invalid = |reason: &str| Action::Invalid {
            action: name.clone(),
            reason: reason.to_string(),
        };

        match name.as_str() {
            "write" | "edit" => match str_field(obj, "file") {
                Some(file) => Action::Write {
                    file,
                    content: obj
                        .get("content")
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            Value::Null => String::new(),
                            other => other.to_string(),
                        })
                        .unwrap_or_default(),
                    edit: name == "edit",
                },
                None => invalid("No filename"),
            },
            "run" => match str_field(obj, "command") {
                Some(command) => Action::Run { command },
                None => invalid("No command"),
            },
            "read" => match str_field(obj, "file") {
                Some(file) => Action::Read { file },
                None => invalid("No filename"),
            },
            "ls" => Action::Ls {
                path: str_field(obj, "path").unwrap_or_else(|| ".".to_string()),
                recursive: bool_field(obj, "recursive"),
            },
            "mkdir" => match str_field(obj, "path") {
                Some(path) => Action::Mkdir { path },
                None => invalid("No path"),
            },
            "grep" => match str_field(obj, "query") {
                Some(query) => Action::Grep { query },
                None => invalid("No query"),
            },
            "search" => match str_field(obj, "query") {
                Some(query) => Action::Search { query },
                None => invalid("No query"),
            },
            "web_read" => match str_field(obj, "url") {
                Some(url) => Action::WebRead { url },
                None => invalid("No URL"),
            },
            "chat" => Action::Chat {
                message: str_field(obj, "message")
                    .or_else(|| str_field(obj, "content"))
                    .or_else(|| str_field(obj, "chat"))
                    .unwrap_or_else(|| "No message content".to_string()),
            },
            "plan_update" => Action::PlanUpdate(Value::Object(obj.clone())),
            "store_knowledge" => match (str_field(obj, "pattern"), str_field(obj, "info")) {
                (Some(pattern), Some(info)) => Action::StoreKnowledge { pattern, info },
                _ => invalid("store_knowledge needs pattern and info"),
            },
            _ => Action::Unknown {
                name: name.clone(),
                raw: Value::Object(obj.clone()),
            },
        }
    }

    /// 动作类型名
    pub fn kind(&self) -> &str {
        match self {
            Action::Write { edit: true, .. } => "edit",
            Action::Write { .. } => "write",
            Action::Run { .. } => "run",
            Action::Read { .. } => "read",
            Action::Ls { .. } => "ls",
            Action::Mkdir { .. } => "mkdir",
            Action::Grep { .. } => "grep",
            Action::Chat { .. } => "chat",
            Action::Search { .. } => "search",
            Action::WebRead { .. } => "web_read",
            Action::PlanUpdate(_) => "plan_update",
            Action::StoreKnowledge { .. } => "store_knowledge",
            Action::Invalid { action, .. } => action,
            Action::Unknown { name, .. } => name,
        }
    }

    /// 动作目标（文件、命令、查询等），用于 `Executing <kind>: <target>` 标记
    pub fn target(&self) -> String {
        match self {
            Action::Write { file, .. } | Action::Read { file } => file.clone(),
            Action::Run { command } => command.clone(),
            Action::Ls { path, .. } | Action::Mkdir { path } => path.clone(),
            Action::Grep { query } | Action::Search { query } => query.clone(),
            Action::WebRead { url } => url.clone(),
            Action::Chat { message } => truncate_chars(message, 80).to_string(),
            Action::StoreKnowledge { pattern, .. } => truncate_chars(pattern, 80).to_string(),
            Action::PlanUpdate(_) => "plan".to_string(),
            Action::Invalid { reason, .. } => reason.clone(),
            Action::Unknown { name, .. } => name.clone(),
        }
    }

    /// 摘要行，如 `Action: write a.py`、`Action: run 'pytest'`
    pub fn summary(&self) -> String {
        match self {
            Action::Write { file, .. } => format!("Action: write {}", file),
            Action::Run { command } => format!("Action: run '{}'", command),
            Action::Read { file } => format!("Action: read {}", file),
            Action::Search { query } => format!("Action: search '{}'", query),
            Action::WebRead { url } => format!("Action: web_read {}", url),
            other => format!("Action: {}", other.kind()),
        }
    }

    /// 响应去重签名片段
    pub fn signature_part(&self) -> String {
        match self {
            Action::Chat { message } => format!("chat:{}", message),
            Action::Write { file, .. } | Action::Read { file } => format!("{}:{}", self.kind(), file),
            Action::Run { command } => format!("run:{}", command),
            Action::Grep { query } | Action::Search { query } => format!("{}:{}", self.kind(), query),
            other => format!("{}:", other.kind()),
        }
    }
}

/// 任务列表补丁：整体替换 / 按 id 定向更新 / 无
#[derive(Debug, Clone, PartialEq, Default)]
pub enum TasksPatch {
    Replace(Vec<Task>),
    Targeted(Map<String, Value>),
    #[default]
    None,
}

/// 计划补丁；current_task_id 为 Some(None) 表示显式清空
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlanPatch {
    pub current_task_id: Option<Option<String>>,
    pub tasks: TasksPatch,
}

impl PlanPatch {
    pub fn from_value(v: &Value) -> Option<Self> {
        let obj = v.as_object()?;
        let current_task_id = obj.get("current_task_id").map(|c| match c {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        });
        let tasks = match obj.get("tasks") {
            Some(Value::Array(items)) => {
                TasksPatch::Replace(items.iter().filter_map(Task::from_value).collect())
            }
            Some(Value::Object(map)) => TasksPatch::Targeted(map.clone()),
            _ => TasksPatch::None,
        };
        Some(Self {
            current_task_id,
            tasks,
        })
    }

    /// 切换到的任务 id（用于压缩摘要中的 `Switched to:`）
    pub fn switched_to(&self) -> Option<&str> {
        self.current_task_id.as_ref()?.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Knowledge {
    pub pattern: String,
    pub info: String,
}

/// 单个更新（由一个 JSON 对象的一个键产生）
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Observation(String),
    Done(bool),
    PlanUpdate(PlanPatch),
    Execute(Vec<Action>),
    Chat(String),
    StoreKnowledge { pattern: String, info: String },
}

/// 一次模型回复合并后的逻辑更新
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedResponse {
    pub actions: Vec<Action>,
    pub observation: Option<String>,
    pub done: Option<bool>,
    pub plan_update: Option<PlanPatch>,
    pub chat: Option<String>,
    pub store_knowledge: Option<Knowledge>,
    /// 是否经由兜底路径得到
    pub fallback: bool,
}

impl ParsedResponse {
    /// 合并规则：Execute 追加，其余后写覆盖
    pub fn apply(&mut self, update: Update) {
        match update {
            Update::Observation(o) => self.observation = Some(o),
            Update::Done(d) => self.done = Some(d),
            Update::PlanUpdate(p) => self.plan_update = Some(p),
            Update::Execute(actions) => self.actions.extend(actions),
            Update::Chat(c) => self.chat = Some(c),
            Update::StoreKnowledge { pattern, info } => {
                self.store_knowledge = Some(Knowledge { pattern, info })
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
            && self.observation.is_none()
            && self.done.is_none()
            && self.plan_update.is_none()
            && self.chat.is_none()
            && self.store_knowledge.is_none()
    }

    /// 去重签名：chat 文本 + 各动作标识；无可签名内容时返回 None
    pub fn signature(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(chat) = &self.chat {
            parts.push(format!("chat:{}", chat));
        }
        parts.extend(self.actions.iter().map(Action::signature_part));
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("|"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_from_object_variants() {
        let a = Action::from_object(&obj(json!({"action": "write", "file": "a.py", "content": "x"})));
        assert_eq!(
            a,
            Action::Write {
                file: "a.py".into(),
                content: "x".into(),
                edit: false
            }
        );
        let r = Action::from_object(&obj(json!({"action": "ls", "recursive": "true"})));
        assert_eq!(
            r,
            Action::Ls {
                path: ".".into(),
                recursive: true
            }
        );
        let u = Action::from_object(&obj(json!({"action": "dance"})));
        assert_eq!(u.kind(), "dance");
        assert!(matches!(u, Action::Unknown { .. }));
    }

    #[test]
    fn test_missing_fields_are_invalid() {
        let a = Action::from_object(&obj(json!({"action": "run"})));
        assert_eq!(
            a,
            Action::Invalid {
                action: "run".into(),
                reason: "No command".into()
            }
        );
        let w = Action::from_object(&obj(json!({"action": "write", "content": "x"})));
        assert!(matches!(w, Action::Invalid { .. }));
    }

    #[test]
    fn test_summary_lines() {
        let run = Action::Run {
            command: "pytest".into(),
        };
        assert_eq!(run.summary(), "Action: run 'pytest'");
        let write = Action::Write {
            file: "a.py".into(),
            content: String::new(),
            edit: true,
        };
        assert_eq!(write.summary(), "Action: write a.py");
        assert_eq!(write.kind(), "edit");
        assert_eq!(Action::Mkdir { path: "src".into() }.summary(), "Action: mkdir");
    }

    #[test]
    fn test_merge_rule() {
        let mut parsed = ParsedResponse::default();
        parsed.apply(Update::Observation("first".into()));
        parsed.apply(Update::Execute(vec![Action::Run {
            command: "ls".into(),
        }]));
        parsed.apply(Update::Observation("second".into()));
        parsed.apply(Update::Execute(vec![Action::Read { file: "a".into() }]));
        assert_eq!(parsed.observation.as_deref(), Some("second"));
        assert_eq!(parsed.actions.len(), 2);
        assert_eq!(parsed.actions[0].kind(), "run");
    }

    #[test]
    fn test_signature() {
        let mut parsed = ParsedResponse::default();
        assert!(parsed.signature().is_none());
        parsed.chat = Some("hello".into());
        parsed.actions.push(Action::Run {
            command: "ls".into(),
        });
        assert_eq!(parsed.signature().as_deref(), Some("chat:hello|run:ls"));
    }

    #[test]
    fn test_plan_patch_from_value() {
        let p = PlanPatch::from_value(&json!({"current_task_id": "T2", "tasks": {"T1": {"status": "done"}}})).unwrap();
        assert_eq!(p.switched_to(), Some("T2"));
        assert!(matches!(p.tasks, TasksPatch::Targeted(_)));
        let cleared = PlanPatch::from_value(&json!({"current_task_id": null})).unwrap();
        assert_eq!(cleared.current_task_id, Some(None));
        assert!(PlanPatch::from_value(&json!("nope")).is_none());
    }
}
