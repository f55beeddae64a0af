//! 沙箱文件系统
//!
//! SafeFs 绑定 root_dir，所有请求路径先做词法归一（去掉 `..`、`.`、开头的 `/`、反斜杠与盘符），
//! 再拼到根目录下；已存在的路径还要 canonicalize 校验仍在根内（防止符号链接逃逸）。

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use walkdir::WalkDir;

use crate::core::AgentError;

static DRIVE_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]:").expect("Invalid drive prefix regex"));

/// grep 最多返回的匹配行数
const MAX_GREP_MATCHES: usize = 50;

/// 写入结果
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// 已存在且内容相同，未写入
    Identical,
    Written { bytes: usize, relative: String },
}

/// 沙箱文件系统：绑定根目录，任何请求路径都被强制落在根下
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    /// 创建（必要时建目录）并规范化根目录
    pub fn new(root_dir: impl AsRef<Path>) -> Result<Self, AgentError> {
        let root = root_dir.as_ref();
        std::fs::create_dir_all(root)
            .map_err(|e| AgentError::Execution(format!("Create workspace: {}", e)))?;
        let root_dir = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        Ok(Self { root_dir })
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 词法归一：返回根下的相对路径（可能为空，表示根本身）
    pub fn coerce(&self, requested: &str) -> PathBuf {
        let mut s = requested.trim().replace('\\', "/");
        let root_str = self.root_dir.to_string_lossy().replace('\\', "/");
        if let Some(rest) = s.strip_prefix(root_str.as_str()) {
            s = rest.to_string();
        }
        let s = DRIVE_PREFIX.replace(&s, "");
        s.split('/')
            .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
            .collect()
    }

    /// 解析为根下的绝对路径；已存在部分经 canonicalize 后若落在根外返回 PathEscape
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, AgentError> {
        let rel = self.coerce(requested);
        let full = if rel.as_os_str().is_empty() {
            self.root_dir.clone()
        } else {
            self.root_dir.join(rel)
        };
        let existing = full
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or(&self.root_dir);
        let canonical = existing
            .canonicalize()
            .map_err(|e| AgentError::Execution(format!("Resolve {}: {}", requested, e)))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(full)
        } else {
            Err(AgentError::PathEscape(requested.to_string()))
        }
    }

    /// 相对根目录的展示路径；根本身为 "."
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root_dir).unwrap_or(path);
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().to_string()),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            ".".to_string()
        } else {
            parts.join("/")
        }
    }

    /// 写文件；内容与现有文件完全相同时跳过
    pub fn write_file(&self, requested: &str, content: &str) -> Result<WriteOutcome, AgentError> {
        let path = self.resolve(requested)?;
        if path.is_file() {
            if let Ok(existing) = std::fs::read_to_string(&path) {
                if existing == content {
                    return Ok(WriteOutcome::Identical);
                }
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AgentError::Execution(e.to_string()))?;
        }
        std::fs::write(&path, content).map_err(|e| AgentError::Execution(e.to_string()))?;
        Ok(WriteOutcome::Written {
            bytes: content.len(),
            relative: self.relative(&path),
        })
    }

    pub fn read_file(&self, requested: &str) -> Result<String, AgentError> {
        let path = self.resolve(requested)?;
        std::fs::read_to_string(&path).map_err(|e| AgentError::Execution(e.to_string()))
    }

    /// 列出目录（单层），返回 (展示路径, 排序后的条目名)
    pub fn list_dir(&self, requested: &str) -> Result<(String, Vec<String>), AgentError> {
        let dir = self.resolve(requested)?;
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&dir).map_err(|e| AgentError::Execution(e.to_string()))? {
            let e = e.map_err(|e| AgentError::Execution(e.to_string()))?;
            entries.push(e.file_name().to_string_lossy().to_string());
        }
        entries.sort();
        Ok((self.relative(&dir), entries))
    }

    /// 递归列出所有文件（相对根目录）
    pub fn tree(&self, requested: &str) -> Result<Vec<String>, AgentError> {
        let dir = self.resolve(requested)?;
        if !dir.is_dir() {
            return Err(AgentError::Execution(format!("Not a directory: {}", requested)));
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(&dir).sort_by_file_name() {
            let entry = entry.map_err(|e| AgentError::Execution(e.to_string()))?;
            if entry.file_type().is_file() {
                files.push(self.relative(entry.path()));
            }
        }
        Ok(files)
    }

    pub fn mkdir(&self, requested: &str) -> Result<PathBuf, AgentError> {
        let path = self.resolve(requested)?;
        std::fs::create_dir_all(&path).map_err(|e| AgentError::Execution(e.to_string()))?;
        Ok(path)
    }

    /// 在工作区文本文件中按正则检索，返回 `path:line: text`；非法正则按字面量匹配
    pub fn grep(&self, query: &str) -> Vec<String> {
        let re = Regex::new(query).or_else(|_| Regex::new(&regex::escape(query)));
        let Ok(re) = re else {
            return Vec::new();
        };
        let mut matches = Vec::new();
        let walker = WalkDir::new(&self.root_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker.filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let rel = self.relative(entry.path());
            for (idx, line) in text.lines().enumerate() {
                if re.is_match(line) {
                    matches.push(format!("{}:{}: {}", rel, idx + 1, line.trim_end()));
                    if matches.len() >= MAX_GREP_MATCHES {
                        return matches;
                    }
                }
            }
        }
        matches
    }
}
