//! Agent 错误类型
//!
//! 传输 / 解析 / 执行 / 持久化 各自一类；执行错误在执行器内转为观察文本回灌给模型，
//! 只有传输错误会终止一次运行。

use thiserror::Error;

/// Agent 运行过程中可能出现的错误（网络、解析、执行、路径逃逸、持久化等）
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Backend returned HTTP {status}: {body}")]
    BackendStatus { status: u16, body: String },

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Memory store error: {0}")]
    Memory(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::Memory(e.to_string())
    }
}

impl From<config::ConfigError> for AgentError {
    fn from(e: config::ConfigError) -> Self {
        AgentError::Config(e.to_string())
    }
}

impl AgentError {
    /// 是否应终止整个运行（目前只有后端传输类错误）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentError::Transport(_)
                | AgentError::Timeout
                | AgentError::BackendStatus { .. }
                | AgentError::MalformedPayload(_)
        )
    }
}
