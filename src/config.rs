//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MARTEN__*` 覆盖（双下划线表示嵌套，如 `MARTEN__LLM__MODEL=qwen`）。
//! 配置在启动时构造一次，之后以 `Arc<AppConfig>` 只读传给各组件；命令行覆盖通过 `with_overrides` 生成新值。

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub memory: MemorySection,
    pub context: ContextSection,
    pub rch: RchSection,
    pub reasoning: ReasoningSection,
    #[serde(rename = "loop")]
    pub loop_: LoopSection,
    pub tools: ToolsSection,
}

/// [app] 段：工作区、状态目录、迭代上限、状态文件名
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 沙箱根目录
    pub workspace_root: PathBuf,
    /// 运行状态 JSON 所在目录；未设置时用工作区的父目录
    pub state_dir: Option<PathBuf>,
    pub max_iterations: u32,
    pub plan_file: String,
    pub whole_state_file: String,
    pub current_state_file: String,
    /// 完整目标写入工作区的文件名
    pub spec_file: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("./marten_workspace"),
            state_dir: None,
            max_iterations: 50,
            plan_file: "todo.md".into(),
            whole_state_file: "whole.task.md".into(),
            current_state_file: "current.state.md".into(),
            spec_file: "_full_spec.md".into(),
        }
    }
}

impl AppSection {
    /// 运行状态目录：显式配置优先，否则为工作区父目录
    pub fn resolved_state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        self.workspace_root
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// [llm] 段：后端地址、模型、采样参数与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:1234/v1".into(),
            model: "local-model".into(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 2000,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 非流式请求超时（秒）
    pub request: u64,
    /// 流式请求超时（秒）
    pub stream: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: 120,
            stream: 300,
        }
    }
}

/// 记忆注入方式：追加到 system、前缀到 user、或不注入
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InjectionMethod {
    #[default]
    System,
    Prefix,
    None,
}

/// [memory] 段：n-gram 记忆库与预取
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub storage_path: PathBuf,
    pub ngram_orders: Vec<usize>,
    /// 内存缓存预算（MB），除以 avg_entry_bytes 得到 LRU 容量
    pub max_memory_mb: usize,
    pub avg_entry_bytes: usize,
    /// 每个阶数注入的最新条目数
    pub top_entries: usize,
    pub max_inject_chars: usize,
    /// learn_from_conversation 保存的回复最大字符数
    pub truncate_length: usize,
    /// store_knowledge 保存的信息最大字符数
    pub knowledge_truncate_length: usize,
    pub injection: InjectionMethod,
    pub prefetch_queue_capacity: usize,
    pub prefetch_results_capacity: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./engram_memory"),
            ngram_orders: vec![2, 3],
            max_memory_mb: 512,
            avg_entry_bytes: 1000,
            top_entries: 3,
            max_inject_chars: 500,
            truncate_length: 200,
            knowledge_truncate_length: 500,
            injection: InjectionMethod::System,
            prefetch_queue_capacity: 32,
            prefetch_results_capacity: 64,
        }
    }
}

impl MemorySection {
    /// LRU 常驻条目上限（至少 1）
    pub fn cache_capacity(&self) -> usize {
        crate::memory::capacity_from_budget(self.max_memory_mb, self.avg_entry_bytes)
    }
}

/// [context] 段：对话窗口与观察缓冲的双重预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    /// 保留的对话轮数（消息条数上限为其两倍）
    pub max_message_history: usize,
    pub max_context_chars: usize,
    /// 稀疏化时保持原样的最近消息条数
    pub thin_keep_recent: usize,
    pub preserve_reasoning_chars: usize,
    pub preserve_observation_chars: usize,
    pub max_observation_chars: usize,
    pub max_observations_before_summary: usize,
    pub observation_summary_chars: usize,
    pub recent_observations_count: usize,
    pub legacy_summary_cap: usize,
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_message_history: 25,
            max_context_chars: 100_000,
            thin_keep_recent: 4,
            preserve_reasoning_chars: 200,
            preserve_observation_chars: 300,
            max_observation_chars: 1500,
            max_observations_before_summary: 10,
            observation_summary_chars: 4000,
            recent_observations_count: 3,
            legacy_summary_cap: 3000,
        }
    }
}

impl ContextSection {
    pub fn max_messages(&self) -> usize {
        self.max_message_history * 2
    }
}

/// [rch] 段：递归历史压缩
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RchSection {
    pub enabled: bool,
    /// 每 N 次迭代压缩一次
    pub interval: u32,
    pub max_summary_chars: usize,
    /// 对话字符数达到 max_context_chars 的该比例时触发
    pub threshold_percent: f64,
    pub chars_per_token: usize,
    pub recent_observations: usize,
    pub recent_log_entries: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for RchSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 5,
            max_summary_chars: 2000,
            threshold_percent: 0.9,
            chars_per_token: 4,
            recent_observations: 10,
            recent_log_entries: 5,
            temperature: 0.3,
            max_tokens: 1000,
        }
    }
}

/// [reasoning] 段：草稿 / 自评 / 修正 多轮推理
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReasoningSection {
    pub enabled: bool,
    pub depth: u32,
    pub preserve_internal_logs: bool,
    /// 仅在停滞或最近出错时启用
    pub only_on_confusion: bool,
}

impl Default for ReasoningSection {
    fn default() -> Self {
        Self {
            enabled: true,
            depth: 1,
            preserve_internal_logs: false,
            only_on_confusion: false,
        }
    }
}

/// [loop] 段：停滞检测、响应去重、人工介入
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopSection {
    /// 连续停滞达到该次数即终止
    pub stagnation_threshold: u32,
    /// 注入补救指令的停滞次数；未设置时为 threshold - 1
    pub remediation_at: Option<u32>,
    pub stagnation_window: usize,
    pub response_cache_size: usize,
    pub hitl_enabled: bool,
    pub max_history_log_entries: usize,
}

impl Default for LoopSection {
    fn default() -> Self {
        Self {
            stagnation_threshold: 5,
            remediation_at: None,
            stagnation_window: 5,
            response_cache_size: 10,
            hitl_enabled: false,
            max_history_log_entries: 200,
        }
    }
}

impl LoopSection {
    pub fn remediation_level(&self) -> u32 {
        self.remediation_at
            .unwrap_or_else(|| self.stagnation_threshold.saturating_sub(1))
            .max(1)
    }
}

/// [tools] 段：命令超时与黑名单、Web 抓取限制
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub command_timeout_secs: u64,
    pub blocked_commands: Vec<String>,
    pub max_command_output_chars: usize,
    pub web_timeout_secs: u64,
    pub web_max_chars: usize,
    pub search_max_results: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            command_timeout_secs: 60,
            blocked_commands: vec!["rm ".into(), "sudo ".into(), "mv ".into()],
            max_command_output_chars: 1000,
            web_timeout_secs: 15,
            web_max_chars: 2500,
            search_max_results: 8,
        }
    }
}

/// 一次性命令行覆盖（仅在构造时应用）
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub max_iterations: Option<u32>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub workspace_root: Option<PathBuf>,
    pub storage_path: Option<PathBuf>,
    pub reasoning_enabled: Option<bool>,
    pub reasoning_depth: Option<u32>,
    pub hitl_enabled: Option<bool>,
}

impl AppConfig {
    /// 应用命令行覆盖，返回新配置
    pub fn with_overrides(mut self, o: Overrides) -> Self {
        if let Some(n) = o.max_iterations {
            self.app.max_iterations = n;
        }
        if let Some(m) = o.model {
            self.llm.model = m;
        }
        if let Some(u) = o.base_url {
            self.llm.base_url = u;
        }
        if let Some(w) = o.workspace_root {
            self.app.workspace_root = w;
        }
        if let Some(s) = o.storage_path {
            self.memory.storage_path = s;
        }
        if let Some(e) = o.reasoning_enabled {
            self.reasoning.enabled = e;
        }
        if let Some(d) = o.reasoning_depth {
            self.reasoning.depth = d;
        }
        if let Some(h) = o.hitl_enabled {
            self.loop_.hitl_enabled = h;
        }
        self.llm.base_url = normalize_base_url(&self.llm.base_url);
        self
    }
}

/// 规范化 OpenAI 兼容端点：去掉末尾 `/`，缺少 `/v1` 时补上
pub fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

/// 从 config 目录加载配置，环境变量 MARTEN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MARTEN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MARTEN")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
