//! Shell 执行器：在工作区内 `sh -c` 执行命令，带黑名单、超时与输出清理
//!
//! 黑名单按子串匹配（命令前补一个空格后小写化，因此 `rm ` 也能命中开头的 `rm`）。

use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use crate::config::ToolsSection;
use crate::core::AgentError;
use crate::utils::truncate_chars;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07]*\x07").expect("Invalid ANSI regex")
});

/// 命令执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// stdout + stderr，已去除 ANSI 转义并截断
    pub output: String,
}

pub struct CommandRunner {
    blocked: Vec<String>,
    timeout: Duration,
    max_output_chars: usize,
}

impl CommandRunner {
    pub fn new(blocked: Vec<String>, timeout_secs: u64, max_output_chars: usize) -> Self {
        Self {
            blocked: blocked.into_iter().map(|b| b.to_lowercase()).collect(),
            timeout: Duration::from_secs(timeout_secs),
            max_output_chars,
        }
    }

    pub fn from_config(cfg: &ToolsSection) -> Self {
        Self::new(
            cfg.blocked_commands.clone(),
            cfg.command_timeout_secs,
            cfg.max_command_output_chars,
        )
    }

    pub fn is_blocked(&self, command: &str) -> bool {
        let padded = format!(" {}", command).to_lowercase();
        self.blocked.iter().any(|b| padded.contains(b.as_str()))
    }

    /// 在 cwd 下执行命令；超时会杀掉子进程并返回 Execution 错误
    pub async fn run(&self, command: &str, cwd: &Path) -> Result<CommandOutput, AgentError> {
        tracing::debug!(command = %command, "shell execute");
        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                AgentError::Execution(format!(
                    "Command timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| AgentError::Execution(e.to_string()))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let clean = strip_ansi(&combined);
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            output: truncate_chars(clean.trim(), self.max_output_chars).to_string(),
        })
    }
}

pub fn strip_ansi(s: &str) -> String {
    ANSI_ESCAPE.replace_all(s, "").to_string()
}
