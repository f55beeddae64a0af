//! 解析 LLM 输出：从自由文本中恢复结构化的状态更新
//!
//! 流程：
//! 1. `extract_objects`：平衡括号扫描，跟踪字符串 / 转义状态，字符串内的 `{}` 不影响深度
//! 2. 每个候选先直接解析，失败再 `repair` 后解析
//! 3. 对象 -> `Update` 列表 -> 按合并规则折叠为 `ParsedResponse`
//! 4. 一个对象都没有得到任何更新时走兜底路径（正则找 observation / done，及 `FILE:` + 代码块的隐式写入）

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::react::action::{Action, ParsedResponse, PlanPatch, Update};
use crate::utils::truncate_chars;

static TRIPLE_QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)"""(.*?)""""#).expect("Invalid triple-quote regex"));

static FALLBACK_OBSERVATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""observation"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("Invalid observation regex")
});

static FALLBACK_DONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""done"\s*:\s*(true|false)"#).expect("Invalid done regex"));

static IMPLICIT_WRITE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:FILE|WRITE|EDIT|PATH):\s*`?([^\s`*]+)`?[^\n]*\n\s*```[^\n]*\n((?s:.*?))```")
        .expect("Invalid implicit write regex")
});

/// 字段别名（alias -> 规范名）
const FIELD_ALIASES: &[(&str, &str)] = &[
    ("cmd", "command"),
    ("file_path", "file"),
    ("filename", "file"),
    ("path_target", "path"),
];

/// 扫描文本中所有顶层的平衡 `{...}` 片段
///
/// 某个 `{` 直到文本末尾都没有闭合时，从它之后的下一个 `{` 重新扫描，
/// 散文里的孤立花括号不会吞掉后面的对象。
pub fn extract_objects(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        match balanced_end(&text[start..]) {
            Some(len) => {
                out.push(text[start..start + len].to_string());
                pos = start + len;
            }
            None => pos = start + 1,
        }
    }
    out
}

/// `text` 以 `{` 开头；返回平衡对象的字节长度，未闭合时为 None
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// 修复常见的非法 JSON：三引号多行串、字符串内裸换行、尾随逗号、全单引号
pub fn repair(candidate: &str) -> String {
    // 1. """...""" -> 合法 JSON 字符串（转义换行与引号）
    let s = TRIPLE_QUOTED.replace_all(candidate, |caps: &regex::Captures<'_>| {
        serde_json::to_string(&caps[1]).unwrap_or_else(|_| "\"\"".to_string())
    });

    // 2. 去掉 `}` / `]` 前的尾随逗号，并转义字符串内的裸控制字符
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
            } else {
                match c {
                    '\\' => {
                        escaped = true;
                        out.push(c);
                    }
                    '"' => {
                        in_string = false;
                        out.push(c);
                    }
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    _ => out.push(c),
                }
            }
        } else if c == '"' {
            in_string = true;
            out.push(c);
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if !matches!(next, Some('}') | Some(']')) {
                out.push(c);
            }
        } else {
            out.push(c);
        }
        i += 1;
    }

    // 3. 完全没有双引号时，把单引号当作双引号
    if !out.contains('"') {
        out = out.replace('\'', "\"");
    }
    out
}

/// 解析单个候选为 JSON 对象（必要时先 repair）
pub fn parse_candidate(candidate: &str) -> Option<Map<String, Value>> {
    let value = serde_json::from_str::<Value>(candidate)
        .or_else(|_| serde_json::from_str::<Value>(&repair(candidate)))
        .ok()?;
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// 归一化动作对象：展开嵌套的 action 对象，`type` 提升为 `action`，字段别名映射
pub fn normalize_action_object(mut obj: Map<String, Value>) -> Map<String, Value> {
    match obj.get("action").cloned() {
        Some(Value::Object(inner)) => {
            let action_type = inner
                .get("type")
                .or_else(|| inner.get("action"))
                .cloned()
                .unwrap_or(Value::Null);
            for (k, v) in inner {
                obj.entry(k).or_insert(v);
            }
            obj.insert("action".into(), action_type);
        }
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        _ => {
            if let Some(t) = obj.get("type").cloned() {
                obj.insert("action".into(), t);
            }
        }
    }

    for (alias, target) in FIELD_ALIASES {
        if !obj.contains_key(*target) {
            if let Some(v) = obj.get(*alias).cloned() {
                obj.insert((*target).to_string(), v);
            }
        }
    }
    obj
}

fn value_text(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn value_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" => Some(true),
            "false" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn to_action(v: &Value) -> Option<Action> {
    match v {
        Value::Object(map) => Some(Action::from_object(&normalize_action_object(map.clone()))),
        _ => None,
    }
}

/// 一个对象产生的更新序列
pub fn object_to_updates(obj: Map<String, Value>) -> Vec<Update> {
    let mut updates = Vec::new();

    if obj.contains_key("action") {
        let observation = obj.get("observation").and_then(value_text);
        let done = obj.get("done").and_then(value_bool);
        updates.push(Update::Execute(vec![Action::from_object(
            &normalize_action_object(obj),
        )]));
        if let Some(o) = observation {
            updates.push(Update::Observation(o));
        }
        if let Some(d) = done {
            updates.push(Update::Done(d));
        }
        return updates;
    }

    if let Some(o) = obj.get("observation").and_then(value_text) {
        updates.push(Update::Observation(o));
    }
    if let Some(d) = obj.get("done").and_then(value_bool) {
        updates.push(Update::Done(d));
    }
    if let Some(p) = obj.get("plan_update").and_then(PlanPatch::from_value) {
        updates.push(Update::PlanUpdate(p));
    }
    match obj.get("execute") {
        Some(Value::Array(items)) => {
            updates.push(Update::Execute(items.iter().filter_map(to_action).collect()))
        }
        Some(single) => {
            if let Some(a) = to_action(single) {
                updates.push(Update::Execute(vec![a]));
            }
        }
        None => {}
    }
    if let Some(c) = obj
        .get("chat")
        .and_then(value_text)
        .or_else(|| obj.get("message").and_then(value_text))
    {
        updates.push(Update::Chat(c));
    }
    if let Some(Value::Object(k)) = obj.get("store_knowledge") {
        let pattern = k.get("pattern").and_then(value_text).unwrap_or_default();
        let info = k.get("info").and_then(value_text).unwrap_or_default();
        if !pattern.is_empty() && !info.is_empty() {
            updates.push(Update::StoreKnowledge { pattern, info });
        }
    }
    updates
}

/// 兜底：正则找 observation / done，以及 `FILE:` 标签后的代码块
fn fallback(text: &str) -> ParsedResponse {
    let mut parsed = ParsedResponse {
        fallback: true,
        ..Default::default()
    };

    if let Some(caps) = FALLBACK_OBSERVATION.captures(text) {
        let raw = format!("\"{}\"", &caps[1]);
        let obs = serde_json::from_str::<String>(&raw).unwrap_or_else(|_| caps[1].to_string());
        parsed.apply(Update::Observation(obs));
    }
    if let Some(caps) = FALLBACK_DONE.captures(text) {
        parsed.apply(Update::Done(&caps[1] == "true"));
    }

    let writes: Vec<Action> = IMPLICIT_WRITE
        .captures_iter(text)
        .map(|caps| Action::Write {
            file: caps[1].to_string(),
            content: caps[2].to_string(),
            edit: false,
        })
        .collect();
    if !writes.is_empty() {
        parsed.apply(Update::Execute(writes));
    }

    if parsed.is_empty() {
        parsed.observation = Some(format!(
            "No structured output found in response: {}",
            truncate_chars(text.trim(), 200)
        ));
    }
    parsed
}

/// 解析一次完整回复
pub fn parse_response(text: &str) -> ParsedResponse {
    let mut parsed = ParsedResponse::default();
    for candidate in extract_objects(text) {
        let Some(obj) = parse_candidate(&candidate) else {
            tracing::debug!(preview = %truncate_chars(&candidate, 80), "unparsable json candidate");
            continue;
        };
        for update in object_to_updates(obj) {
            parsed.apply(update);
        }
    }

    if parsed.is_empty() {
        return fallback(text);
    }
    parsed
}
