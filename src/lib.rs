//! Marten - 自主编码循环智能体
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量），启动时构造一次后只读
//! - **core**: 错误类型与优雅关闭
//! - **llm**: 后端抽象（OpenAI 兼容 / 脚本化 Mock）、记忆增强网关、推测预取
//! - **memory**: 对话消息、n-gram 记忆库（SQLite + LRU）、运行状态快照与状态看板
//! - **react**: 动作解析、上下文管理、历史压缩、分层推理、停滞检测、人工介入与主循环
//! - **tools**: 沙箱文件系统、Shell、Web 检索与动作执行器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;
pub mod utils;

pub use config::{load_config, AppConfig, Overrides};
pub use react::{LoopController, RunOutcome};
