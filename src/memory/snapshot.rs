//! 运行状态快照
//!
//! 每轮结束把 AgentState 写成一个 JSON 文件，文件名由目标文本的 sha256 前 16 位决定；
//! 下次以相同目标启动时自动续跑。写入走临时文件 + rename，中途崩溃不会留下半截 JSON。

use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};

use crate::react::state::AgentState;

#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

/// 目标文本的文件名安全哈希
pub fn goal_hash(goal: &str) -> String {
    let digest = Sha256::digest(goal.as_bytes());
    hex::encode(digest)[..16].to_string()
}

impl StateStore {
    pub fn new(state_dir: impl AsRef<Path>, goal: &str) -> Self {
        let path = state_dir
            .as_ref()
            .join(format!("marten_state_{}.json", goal_hash(goal)));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取快照；文件不存在、无法解析或目标不一致时返回 None
    pub fn load(&self, goal: &str) -> Option<AgentState> {
        let data = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<AgentState>(&data) {
            Ok(state) if state.goal == goal => {
                tracing::info!(iteration = state.iteration, path = %self.path.display(), "resuming saved state");
                Some(state)
            }
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(error = %e, path = %self.path.display(), "unreadable state snapshot ignored");
                None
            }
        }
    }

    /// 原子写入（同目录临时文件 + rename）
    pub fn save(&self, state: &AgentState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create state dir {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(state).context("serialize agent state")?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(())
    }
}
