//! 自主循环：动作解析、上下文管理、历史压缩、分层推理、停滞检测、人工介入与主循环

pub mod action;
pub mod compression;
pub mod context;
pub mod dedup;
pub mod hitl;
pub mod loop_;
pub mod parser;
pub mod prompt;
pub mod reasoning;
pub mod stagnation;
pub mod state;

pub use action::{Action, ParsedResponse, PlanPatch, TasksPatch, Update};
pub use compression::{HistoryCompressor, Trigger};
pub use context::{consolidate_observations, digest, ContextAction, ContextManager};
pub use dedup::ResponseCache;
pub use hitl::{
    parse_operator_input, render_dashboard, OperatorChannel, OperatorCommand, ScriptedOperator,
    StdinOperator,
};
pub use loop_::{LoopController, RunOutcome};
pub use parser::parse_response;
pub use reasoning::{LayeredReasoner, ReasoningOutcome};
pub use stagnation::{LoopType, StagnationDetector, StagnationVerdict};
pub use state::{AgentState, Plan, Task, TaskStatus};
