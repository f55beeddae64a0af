//! 动作执行器
//!
//! 把封闭的 Action 集合分派到工作区沙箱、Shell 与 Web 工具；所有失败都转为观察文本（ok = false），
//! 从不向上传播，模型可以据此调整。每次调用输出结构化审计日志（JSON）。

use std::sync::{Arc, LazyLock};
use std::time::Instant;

use regex::Regex;

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::react::action::Action;
use crate::tools::filesystem::{SafeFs, WriteOutcome};
use crate::tools::search::WebTools;
use crate::tools::shell::CommandRunner;
use crate::utils::truncate_chars;

static WEATHER_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(current |today's )?weather in ").expect("Invalid query relax regex")
});

/// 单个动作的执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub observation: String,
    pub ok: bool,
}

impl ActionOutcome {
    fn success(observation: impl Into<String>) -> Self {
        Self {
            observation: observation.into(),
            ok: true,
        }
    }

    fn failure(observation: impl Into<String>) -> Self {
        Self {
            observation: observation.into(),
            ok: false,
        }
    }
}

pub struct ActionExecutor {
    fs: SafeFs,
    runner: CommandRunner,
    web: Arc<dyn WebTools>,
    max_read_chars: usize,
    web_max_chars: usize,
    search_max_results: usize,
}

impl ActionExecutor {
    pub fn new(fs: SafeFs, runner: CommandRunner, web: Arc<dyn WebTools>) -> Self {
        Self {
            fs,
            runner,
            web,
            max_read_chars: 1500,
            web_max_chars: 2500,
            search_max_results: 8,
        }
    }

    pub fn from_config(cfg: &AppConfig, web: Arc<dyn WebTools>) -> Result<Self, AgentError> {
        let fs = SafeFs::new(&cfg.app.workspace_root)?;
        Ok(Self {
            fs,
            runner: CommandRunner::from_config(&cfg.tools),
            web,
            max_read_chars: cfg.context.max_observation_chars,
            web_max_chars: cfg.tools.web_max_chars,
            search_max_results: cfg.tools.search_max_results,
        })
    }

    pub fn workspace(&self) -> &SafeFs {
        &self.fs
    }

    /// 执行一个动作并输出审计日志
    pub async fn execute(&self, action: &Action) -> ActionOutcome {
        let start = Instant::now();
        let outcome = self.dispatch(action).await;
        let audit = serde_json::json!({
            "event": "action_audit",
            "action": action.kind(),
            "ok": outcome.ok,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&action.target()),
        });
        tracing::info!(audit = %audit.to_string(), "action");
        outcome
    }

    async fn dispatch(&self, action: &Action) -> ActionOutcome {
        match action {
            Action::Write { file, content, .. } => match self.fs.write_file(file, content) {
                Ok(WriteOutcome::Identical) => ActionOutcome::failure(format!(
                    "Skipped: Content for {} is already identical to existing file. Try a different approach.",
                    file
                )),
                Ok(WriteOutcome::Written { bytes, relative }) => {
                    ActionOutcome::success(format!("Wrote {} bytes to {}", bytes, relative))
                }
                Err(e) => ActionOutcome::failure(format!("Write error: {}", e)),
            },
            Action::Run { command } => {
                if self.runner.is_blocked(command) {
                    return ActionOutcome::failure(format!(
                        "Error: Command blocked for safety: {}",
                        command
                    ));
                }
                match self.runner.run(command, self.fs.root()).await {
                    Ok(out) => ActionOutcome {
                        observation: format!("Exit {}\nOutput: {}", out.exit_code, out.output),
                        ok: out.exit_code == 0,
                    },
                    Err(e) => ActionOutcome::failure(format!("Run error: {}", e)),
                }
            }
            Action::Read { file } => match self.fs.read_file(file) {
                Ok(content) => {
                    let total = content.chars().count();
                    let body = if total > self.max_read_chars {
                        format!(
                            "{}\n\n[... Truncated {} chars ...]",
                            truncate_chars(&content, self.max_read_chars),
                            total - self.max_read_chars
                        )
                    } else {
                        content
                    };
                    ActionOutcome::success(format!("Content of {}:\n---\n{}\n---", file, body))
                }
                Err(e) => ActionOutcome::failure(format!("read error: {}", e)),
            },
            Action::Ls { path, recursive: true } => match self.fs.tree(path) {
                Ok(files) => ActionOutcome::success(format!("Project Tree:\n{}", files.join("\n"))),
                Err(e) => ActionOutcome::failure(format!("ls error: {}", e)),
            },
            Action::Ls { path, recursive: false } => match self.fs.list_dir(path) {
                Ok((rel, entries)) => {
                    ActionOutcome::success(format!("Contents of {}: {}", rel, entries.join(", ")))
                }
                Err(e) => ActionOutcome::failure(format!("ls error: {}", e)),
            },
            Action::Mkdir { path } => match self.fs.mkdir(path) {
                Ok(_) => ActionOutcome::success(format!("Created directory: {}", path)),
                Err(e) => ActionOutcome::failure(format!("mkdir error: {}", e)),
            },
            Action::Grep { query } => {
                let hits = self.fs.grep(query);
                let body = if hits.is_empty() {
                    "No matches".to_string()
                } else {
                    hits.join("\n")
                };
                ActionOutcome::success(format!("Search for '{}':\n{}", query, body))
            }
            Action::Chat { message } => ActionOutcome::success(format!("Chat message: {}", message)),
            Action::Search { query } => self.search(query).await,
            Action::WebRead { url } => match self.web.read(url).await {
                Ok(content) if content.trim().is_empty() => {
                    ActionOutcome::failure("Error: Could not extract content from the URL.")
                }
                Ok(content) => ActionOutcome::success(format!(
                    "Content of {}:\n---\n{}\n---",
                    url,
                    truncate_chars(&content, self.web_max_chars)
                )),
                Err(e) => ActionOutcome::failure(format!("Web read error: {}", e)),
            },
            Action::PlanUpdate(_) => {
                ActionOutcome::success("Plan update requested. (Processed via top-level logic)")
            }
            Action::StoreKnowledge { .. } => {
                ActionOutcome::failure("Error: store_knowledge is handled by the memory gateway")
            }
            Action::Invalid { reason, .. } => ActionOutcome::failure(format!("Error: {}", reason)),
            Action::Unknown { name, .. } => {
                ActionOutcome::failure(format!("Unknown action: {}", name))
            }
        }
    }

    /// 无结果时去掉 "weather in" 类前缀再试一次
    async fn search(&self, query: &str) -> ActionOutcome {
        let mut hits = match self.web.search(query, self.search_max_results).await {
            Ok(hits) => hits,
            Err(e) => return ActionOutcome::failure(format!("Search error: {}", e)),
        };
        if hits.is_empty() {
            let relaxed = WEATHER_PREFIX.replace(query, "").trim().to_string();
            if relaxed != query && !relaxed.is_empty() {
                hits = self
                    .web
                    .search(&relaxed, self.search_max_results.min(5))
                    .await
                    .unwrap_or_default();
            }
        }
        if hits.is_empty() {
            return ActionOutcome::failure(format!(
                "Search for '{}' returned no results. Try a broader query.",
                query
            ));
        }
        let formatted: Vec<String> = hits
            .iter()
            .map(|h| format!("Title: {}\nURL: {}\nSnippet: {}\n", h.title, h.url, h.snippet))
            .collect();
        ActionOutcome::success(format!(
            "Search results for '{}':\n\n{}",
            query,
            formatted.join("\n")
        ))
    }
}

fn args_preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", truncate_chars(s, 200))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::search::SearchHit;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// 离线 Web 工具：记录查询，按预设返回
    #[derive(Default)]
    struct StubWeb {
        hits: Vec<SearchHit>,
        page: String,
        queries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WebTools for StubWeb {
        async fn search(&self, query: &str, _max: usize) -> Result<Vec<SearchHit>, String> {
            self.queries.lock().unwrap().push(query.to_string());
            if query.contains("weather") {
                return Ok(vec![]);
            }
            Ok(self.hits.clone())
        }

        async fn read(&self, _url: &str) -> Result<String, String> {
            Ok(self.page.clone())
        }
    }

    fn executor(dir: &TempDir, web: StubWeb) -> ActionExecutor {
        ActionExecutor::new(
            SafeFs::new(dir.path()).unwrap(),
            CommandRunner::new(vec!["rm ".into()], 5, 1000),
            Arc::new(web),
        )
    }

    #[tokio::test]
    async fn test_write_then_identical_write_skips() {
        let dir = TempDir::new().unwrap();
        let ex = executor(&dir, StubWeb::default());
        let write = Action::Write {
            file: "out.txt".into(),
            content: "hi".into(),
            edit: false,
        };
        let first = ex.execute(&write).await;
        assert_eq!(first.observation, "Wrote 2 bytes to out.txt");
        assert!(first.ok);
        let second = ex.execute(&write).await;
        assert!(second.observation.starts_with("Skipped: Content for out.txt"));
        assert!(!second.ok);
    }

    #[tokio::test]
    async fn test_read_truncates_long_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("big.txt"), "a".repeat(1600)).unwrap();
        let ex = executor(&dir, StubWeb::default());
        let out = ex.execute(&Action::Read { file: "big.txt".into() }).await;
        assert!(out.observation.contains("[... Truncated 100 chars ...]"));
        assert!(out.observation.starts_with("Content of big.txt:\n---\n"));
    }

    #[tokio::test]
    async fn test_blocked_and_unknown_become_observations() {
        let dir = TempDir::new().unwrap();
        let ex = executor(&dir, StubWeb::default());
        let blocked = ex.execute(&Action::Run { command: "rm -rf x".into() }).await;
        assert_eq!(blocked.observation, "Error: Command blocked for safety: rm -rf x");
        let unknown = ex
            .execute(&Action::Unknown {
                name: "teleport".into(),
                raw: serde_json::Value::Null,
            })
            .await;
        assert_eq!(unknown.observation, "Unknown action: teleport");
        let invalid = ex
            .execute(&Action::Invalid {
                action: "run".into(),
                reason: "No command".into(),
            })
            .await;
        assert_eq!(invalid.observation, "Error: No command");
    }

    #[tokio::test]
    async fn test_search_relaxes_query_and_formats_hits() {
        let dir = TempDir::new().unwrap();
        let web = StubWeb {
            hits: vec![SearchHit {
                title: "Oslo".into(),
                url: "https://example.com/oslo".into(),
                snippet: "Cloudy".into(),
            }],
            ..Default::default()
        };
        let ex = executor(&dir, web);
        let out = ex
            .execute(&Action::Search {
                query: "current weather in Oslo".into(),
            })
            .await;
        assert!(out.ok);
        assert!(out
            .observation
            .starts_with("Search results for 'current weather in Oslo':\n\nTitle: Oslo"));
    }

    #[tokio::test]
    async fn test_web_read_empty_content() {
        let dir = TempDir::new().unwrap();
        let ex = executor(&dir, StubWeb::default());
        let out = ex
            .execute(&Action::WebRead {
                url: "https://example.com".into(),
            })
            .await;
        assert_eq!(out.observation, "Error: Could not extract content from the URL.");
    }

    #[tokio::test]
    async fn test_ls_flat_and_recursive() {
        let dir = TempDir::new().unwrap();
        let ex = executor(&dir, StubWeb::default());
        ex.execute(&Action::Mkdir { path: "pkg".into() }).await;
        std::fs::write(dir.path().join("pkg/a.py"), "").unwrap();
        let flat = ex
            .execute(&Action::Ls {
                path: ".".into(),
                recursive: false,
            })
            .await;
        assert_eq!(flat.observation, "Contents of .: pkg");
        let tree = ex
            .execute(&Action::Ls {
                path: ".".into(),
                recursive: true,
            })
            .await;
        assert_eq!(tree.observation, "Project Tree:\npkg/a.py");
    }
}
