//! 自主循环控制器
//!
//! 每轮：合并旧观察 -> 可能的历史压缩 -> 停滞检测 -> 可选人工介入 -> 生成（直接流式或分层推理）
//! -> 解析动作 -> 在工作区逐个执行 -> 应用计划补丁 -> 学习 -> 落盘。
//! 终止条件：模型或操作者置 done、致命停滞、后端不可恢复错误、达到本次运行的迭代上限。
//! 取消是协作式的：在各阶段之间检查 CancellationToken，被取消时先落盘再返回 Interrupted。

use std::sync::Arc;

use serde_json::{json, Map};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::llm::{Completion, CompletionOptions, Gateway};
use crate::memory::{Message, StateStore, StatusBoard};
use crate::react::action::{Action, ParsedResponse, PlanPatch};
use crate::react::compression::{log_session_summary, HistoryCompressor};
use crate::react::context::{consolidate_observations, ContextAction, ContextManager};
use crate::react::dedup::ResponseCache;
use crate::react::hitl::{parse_operator_input, render_dashboard, OperatorChannel, OperatorCommand, StdinOperator};
use crate::react::parser::parse_response;
use crate::react::prompt::{system_prompt, user_prompt, PROCEED};
use crate::react::reasoning::{is_confused, LayeredReasoner};
use crate::react::stagnation::{fatal_reason, remediation, remediation_block, StagnationDetector, StagnationVerdict};
use crate::react::state::{AgentState, TaskStatus};
use crate::tools::ActionExecutor;
use crate::utils::truncate_chars;

const DUPLICATE_WARNING: &str = "[INTERNAL WARNING] Duplicate response detected";

/// 一次运行的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// 因错误或致命停滞终止
    Stopped { reason: String },
    MaxIterations,
    Interrupted,
}

pub struct LoopController {
    cfg: Arc<AppConfig>,
    gateway: Gateway,
    executor: ActionExecutor,
    context: ContextManager,
    state: AgentState,
    store: StateStore,
    board: StatusBoard,
    detector: StagnationDetector,
    dedup: ResponseCache,
    compressor: HistoryCompressor,
    reasoner: LayeredReasoner,
    operator: Option<Arc<dyn OperatorChannel>>,
    cancel: CancellationToken,
    options: CompletionOptions,
}

impl LoopController {
    /// 构造控制器：写出完整目标文件，存在同一目标的快照时自动恢复
    pub fn new(
        cfg: Arc<AppConfig>,
        goal: impl Into<String>,
        gateway: Gateway,
        executor: ActionExecutor,
        cancel: CancellationToken,
    ) -> Result<Self, AgentError> {
        let goal = goal.into();
        executor.workspace().write_file(&cfg.app.spec_file, &goal)?;

        let store = StateStore::new(cfg.app.resolved_state_dir(), &goal);
        let state = store
            .load(&goal)
            .unwrap_or_else(|| AgentState::new(goal.clone()));

        let board = StatusBoard::new(executor.workspace().root(), &cfg.app);
        let operator: Option<Arc<dyn OperatorChannel>> = if cfg.loop_.hitl_enabled {
            Some(Arc::new(StdinOperator))
        } else {
            None
        };

        Ok(Self {
            context: ContextManager::new(system_prompt(&goal, &cfg.app.spec_file), cfg.context.clone()),
            detector: StagnationDetector::new(&cfg.loop_),
            dedup: ResponseCache::new(cfg.loop_.response_cache_size),
            compressor: HistoryCompressor::new(
                cfg.rch.clone(),
                cfg.context.max_context_chars,
                cfg.context.recent_observations_count,
            ),
            reasoner: LayeredReasoner::new(cfg.reasoning.clone(), cfg.llm.temperature, cfg.llm.max_tokens),
            options: CompletionOptions::new(cfg.llm.temperature, cfg.llm.max_tokens),
            cfg,
            gateway,
            executor,
            state,
            store,
            board,
            operator,
            cancel,
        })
    }

    /// 替换操作者通道（同时启用人工介入）
    pub fn with_operator(mut self, operator: Arc<dyn OperatorChannel>) -> Self {
        self.operator = Some(operator);
        self
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn messages(&self) -> &[Message] {
        self.context.messages()
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// 运行直到终止条件
    pub async fn run(&mut self) -> RunOutcome {
        let max = self.cfg.app.max_iterations;
        let mut steps = 0;
        tracing::info!(goal = %truncate_chars(&self.state.goal, 80), max_iterations = max, "run started");

        let outcome = loop {
            if self.state.done {
                break match &self.state.error {
                    Some(reason) => RunOutcome::Stopped { reason: reason.clone() },
                    None => RunOutcome::Completed,
                };
            }
            if self.cancel.is_cancelled() {
                self.persist();
                break RunOutcome::Interrupted;
            }
            if steps >= max {
                tracing::warn!(iterations = steps, "max iterations reached");
                break RunOutcome::MaxIterations;
            }
            self.run_step().await;
            steps += 1;
        };

        log_session_summary(&self.state);
        let stats = self.gateway.statistics();
        tracing::info!(
            lookups = stats.memory.stats.lookups,
            hit_rate = stats.memory.hit_rate,
            cache_hit_rate = stats.memory.cache_hit_rate,
            resident = stats.memory.resident_entries,
            prefetch_cached = stats.prefetch_cache_size,
            "memory statistics"
        );
        tracing::info!(outcome = ?outcome, iteration = self.state.iteration, "run finished");
        outcome
    }

    /// 执行一轮
    pub async fn run_step(&mut self) {
        self.state.iteration += 1;
        let iteration = self.state.iteration;
        tracing::debug!(iteration, "iteration started");

        consolidate_observations(&mut self.state, &self.cfg.context, self.cfg.rch.max_summary_chars);
        if let Some(trigger) = self.compressor.should_compress(&self.state, self.context.total_chars()) {
            self.compressor.compress(&self.gateway, &mut self.state, trigger).await;
        }
        if self.cancel.is_cancelled() {
            return;
        }

        let verdict = self.detector.update(&mut self.state);
        let threshold = self.detector.threshold();
        let mut repetition_note = String::new();
        match verdict {
            StagnationVerdict::Fatal { count, loop_type } => {
                tracing::error!(iteration, loop_type = %loop_type, count, "stagnation threshold reached, stopping");
                self.state.fail(fatal_reason(&self.cfg.app));
                self.persist();
                return;
            }
            StagnationVerdict::Warn { count, loop_type } => {
                repetition_note = remediation_block(count, threshold, &remediation(loop_type, &self.cfg.app));
                tracing::warn!(iteration, loop_type = %loop_type, count, "remediation directive injected");
            }
            StagnationVerdict::Stagnant { .. } | StagnationVerdict::Clear => {}
        }

        let instruction = match self.consult_operator(threshold).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                self.persist();
                return;
            }
            Err(e) => {
                tracing::info!(iteration, error = %e, "step abandoned while waiting for operator");
                return;
            }
        };

        let prompt = user_prompt(&self.state, threshold, &instruction, &repetition_note);
        self.context.push(Message::user(prompt.clone()));
        match self.context.manage() {
            ContextAction::Untouched => {}
            ContextAction::Slid { before, after } => tracing::debug!(before, after, "context slid (cache preserved)"),
            ContextAction::Thinned { before, after } => tracing::debug!(before, after, "context thinned (cache reset)"),
        }
        if self.cancel.is_cancelled() {
            return;
        }

        let confused = is_confused(
            verdict.is_looping(),
            self.state.stagnation_count,
            self.state.last_observation(),
        );
        let content = match self.generate(confused).await {
            Ok(text) => text,
            Err(AgentError::Cancelled) => {
                tracing::info!(iteration, "generation interrupted");
                return;
            }
            Err(e) if e.is_terminal() => {
                tracing::error!(iteration, error = %e, "model call failed, ending run");
                self.state.fail(e.to_string());
                self.persist();
                return;
            }
            Err(e) => {
                tracing::warn!(iteration, error = %e, "model call failed, continuing");
                self.state.observations.push(format!("Error: {}", e));
                self.persist();
                return;
            }
        };

        let parsed = parse_response(&content);
        if let Some(signature) = parsed.signature() {
            if self.dedup.check(&signature) {
                self.state.observations.push(DUPLICATE_WARNING.to_string());
            }
        }
        self.context.push(Message::assistant(content.clone()));
        self.apply(parsed).await;

        let mut meta = Map::new();
        meta.insert("iter".into(), json!(iteration));
        if let Err(e) = self.gateway.learn_from_conversation(&prompt, &content, meta).await {
            tracing::warn!(error = %e, "failed to learn from exchange");
        }

        self.state.record_iteration(self.cfg.loop_.max_history_log_entries);
        self.persist();
    }

    /// 人工介入；返回本轮指令文本，Ok(None) 表示操作者退出
    async fn consult_operator(&mut self, threshold: u32) -> Result<Option<String>, AgentError> {
        let Some(operator) = self.operator.clone() else {
            return Ok(Some(PROCEED.to_string()));
        };
        let dashboard = render_dashboard(&self.state, threshold, self.context.messages());
        let input = tokio::select! {
            input = operator.prompt(&dashboard) => input,
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
        };
        // 通道关闭视为退出
        let command = input
            .map(|i| parse_operator_input(&i))
            .unwrap_or(OperatorCommand::Quit);
        tracing::info!(command = ?command, "operator input");

        match &command {
            OperatorCommand::Quit => {
                tracing::info!("session terminated by operator");
                self.state.done = true;
            }
            OperatorCommand::Reset => {
                self.state.stagnation_count = 0;
                self.state.loop_type = None;
                self.state.observations.clear();
                self.dedup.clear();
            }
            OperatorCommand::Replan => self.state.plan.current_task_id = None,
            OperatorCommand::Skip => {
                if let Some(task) = self.state.plan.current_task_mut() {
                    task.status = TaskStatus::Skipped;
                    tracing::info!(task = %task.id, "task skipped by operator");
                }
                self.state.plan.current_task_id = None;
            }
            OperatorCommand::Clear => {
                self.context.clear_to_system();
                self.state.history_summary.clear();
            }
            OperatorCommand::RepetitionComplaint(_) => {
                self.state.stagnation_count = 0;
                self.dedup.clear();
            }
            OperatorCommand::Proceed | OperatorCommand::Directive(_) => {}
        }
        Ok(command.prompt_text())
    }

    /// 生成本轮回复：分层推理或单次流式调用
    async fn generate(&mut self, confused: bool) -> Result<String, AgentError> {
        if self.reasoner.should_engage(confused) {
            tracing::info!(depth = self.reasoner.depth(), confused, "layered reasoning engaged");
            let outcome = tokio::select! {
                outcome = self.reasoner.run(&self.gateway, self.context.messages()) => outcome?,
                _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            };
            if self.reasoner.preserve_internal_logs() {
                for message in outcome.internal {
                    self.context.push(message);
                }
            }
            return Ok(outcome.response);
        }
        let completion = tokio::select! {
            c = self.gateway.chat_completion_streamed(self.context.messages(), &self.options) => c,
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
        };
        match completion {
            Completion::Text(text) => Ok(text),
            Completion::Error(e) => Err(AgentError::Transport(e)),
        }
    }

    /// 应用解析结果：observation、done、计划补丁、动作执行、知识存储
    async fn apply(&mut self, parsed: ParsedResponse) {
        if let Some(observation) = parsed.observation {
            self.state.observations.push(observation);
        }
        if let Some(done) = parsed.done {
            self.state.done = done;
        }
        if let Some(patch) = &parsed.plan_update {
            let note = self.apply_plan(patch);
            self.state.observations.push(note);
        }

        let mut actions = parsed.actions;
        if let Some(chat) = parsed.chat {
            if !actions.iter().any(|a| matches!(a, Action::Chat { .. })) {
                actions.insert(0, Action::Chat { message: chat });
            }
        }
        for action in &actions {
            if self.cancel.is_cancelled() {
                tracing::info!("interrupted, skipping remaining actions");
                break;
            }
            let result = self.dispatch(action).await;
            self.state.observations.push(format!(
                "{} | Executing {}: {} | Result: {}",
                action.summary(),
                action.kind(),
                action.target(),
                result
            ));
        }

        if let Some(k) = parsed.store_knowledge {
            self.remember(&k.pattern, &k.info).await;
        }
    }

    async fn dispatch(&mut self, action: &Action) -> String {
        match action {
            Action::StoreKnowledge { pattern, info } => self.remember(pattern, info).await,
            Action::PlanUpdate(raw) => {
                let body = raw.get("plan_update").unwrap_or(raw);
                match PlanPatch::from_value(body) {
                    Some(patch) => self.apply_plan(&patch),
                    None => format!("Error: {}", AgentError::Parse("plan_update needs an object".into())),
                }
            }
            other => self.executor.execute(other).await.observation,
        }
    }

    fn apply_plan(&mut self, patch: &PlanPatch) -> String {
        self.state.plan.apply(patch);
        let note = format!(
            "Plan updated. Current task: {}",
            self.state.plan.current_task_id.as_deref().unwrap_or("none")
        );
        tracing::debug!(iteration = self.state.iteration, "{}", note);
        note
    }

    async fn remember(&self, pattern: &str, info: &str) -> String {
        match self.gateway.store_knowledge(pattern, info).await {
            Ok(()) => {
                tracing::debug!(pattern = %truncate_chars(pattern, 50), "knowledge stored");
                format!("Stored knowledge: {}", truncate_chars(pattern, 50))
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to store knowledge");
                format!("Error: {}", e)
            }
        }
    }

    /// 保存快照并同步状态文件
    pub fn save_state(&self) -> Result<(), AgentError> {
        self.store
            .save(&self.state)
            .map_err(|e| AgentError::Persistence(format!("state snapshot: {e:#}")))?;
        self.board
            .sync(&self.state)
            .map_err(|e| AgentError::Persistence(format!("status files: {e:#}")))
    }

    /// 落盘失败只记录日志，不中断运行
    fn persist(&self) {
        if let Err(e) = self.save_state() {
            tracing::warn!(error = %e, "failed to persist state");
        }
    }

    /// 关闭网关（排空预取队列）
    pub async fn shutdown(&mut self) {
        self.gateway.shutdown().await;
    }
}
