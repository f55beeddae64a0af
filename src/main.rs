//! Marten - 自主编码循环
//!
//! 入口：解析命令行、加载配置、组装记忆库 / 网关 / 执行器，并运行主循环直到终止。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use marten::{
    core::ShutdownManager,
    llm::{Gateway, OpenAiBackend},
    load_config,
    memory::MemoryStore,
    observability,
    tools::{ActionExecutor, HttpWebTools},
    LoopController, Overrides, RunOutcome,
};

#[derive(Debug, Parser)]
#[command(name = "marten", version, about = "Autonomous coding loop against an OpenAI-compatible endpoint")]
struct Cli {
    /// Goal text
    #[arg(long, conflicts_with = "prompt_file")]
    goal: Option<String>,

    /// Markdown/text file containing the goal
    #[arg(long)]
    prompt_file: Option<PathBuf>,

    /// OpenAI-compatible server URL (`/v1` is appended when missing)
    #[arg(long)]
    url: Option<String>,

    #[arg(long)]
    model: Option<String>,

    /// Max iterations for this run
    #[arg(long)]
    iterations: Option<u32>,

    /// Engram storage directory
    #[arg(long)]
    storage: Option<PathBuf>,

    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Enable layered reasoning (draft, critique, refine)
    #[arg(long)]
    deep_thought: bool,

    /// Layered reasoning depth
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=5))]
    thinking_level: Option<u32>,

    /// Pause for operator input before every step
    #[arg(long)]
    hitl: bool,

    #[arg(long)]
    debug: bool,

    /// Extra TOML config layered over config/default.toml
    #[arg(long)]
    config: Option<PathBuf>,
}

fn read_goal(cli: &Cli) -> anyhow::Result<String> {
    let goal = match &cli.prompt_file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Prompt file not found: {}", path.display()))?;
            tracing::info!(path = %path.display(), "loaded goal from file");
            text.trim().to_string()
        }
        None => cli.goal.clone().unwrap_or_default().trim().to_string(),
    };
    if goal.is_empty() {
        bail!("Either --goal or --prompt-file is required.");
    }
    Ok(goal)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    observability::init(cli.debug);

    let goal = read_goal(&cli)?;

    let overrides = Overrides {
        max_iterations: cli.iterations,
        model: cli.model.clone(),
        base_url: cli.url.clone(),
        workspace_root: cli.workspace.clone(),
        storage_path: cli.storage.clone(),
        reasoning_enabled: cli.deep_thought.then_some(true),
        reasoning_depth: cli.thinking_level,
        hitl_enabled: cli.hitl.then_some(true),
    };
    let cfg = Arc::new(
        load_config(cli.config.clone())
            .context("Failed to load config")?
            .with_overrides(overrides),
    );
    tracing::info!(
        model = %cfg.llm.model,
        base_url = %cfg.llm.base_url,
        workspace = %cfg.app.workspace_root.display(),
        "initializing"
    );

    let store = Arc::new(
        MemoryStore::open(
            &cfg.memory.storage_path,
            cfg.memory.ngram_orders.clone(),
            cfg.memory.cache_capacity(),
        )
        .context("Failed to open engram store")?,
    );
    let backend = Arc::new(OpenAiBackend::new(&cfg.llm));
    let gateway = Gateway::new(backend, store, cfg.memory.clone());
    let web = Arc::new(HttpWebTools::new(cfg.tools.web_timeout_secs));
    let executor = ActionExecutor::from_config(&cfg, web).context("Failed to prepare workspace")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let mut controller = LoopController::new(cfg.clone(), goal, gateway, executor, shutdown.token())
        .context("Failed to create loop controller")?;
    let outcome = controller.run().await;
    controller.shutdown().await;

    match outcome {
        RunOutcome::Completed => tracing::info!("goal completed"),
        RunOutcome::MaxIterations => tracing::warn!("stopped at iteration limit"),
        RunOutcome::Interrupted => tracing::info!(
            reason = shutdown.reason().map(|r| r.as_str()).unwrap_or("unknown"),
            "interrupted, state saved"
        ),
        RunOutcome::Stopped { reason } => {
            tracing::error!(reason = %reason, "run stopped");
            std::process::exit(1);
        }
    }
    Ok(())
}
