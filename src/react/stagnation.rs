//! 停滞检测
//!
//! 检查最近 ≤5 条原始观察并归类为五种循环之一；按顺序逐条判断，后命中的规则覆盖先命中的
//! （command_loop 优先级最高）。命中则计数 +1，未命中则计数归零并清除循环类型。
//! 计数达到阈值为致命停滞；达到补救级别时向下一轮提示注入针对循环类型的补救指令。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{AppSection, LoopSection};
use crate::react::state::AgentState;

/// 循环类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    IdenticalObservations,
    RedundantWrites,
    ReadLoop,
    PlanningLoop,
    CommandLoop,
}

impl LoopType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopType::IdenticalObservations => "identical_observations",
            LoopType::RedundantWrites => "redundant_writes",
            LoopType::ReadLoop => "read_loop",
            LoopType::PlanningLoop => "planning_loop",
            LoopType::CommandLoop => "command_loop",
        }
    }
}

impl fmt::Display for LoopType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一轮检测的结论
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagnationVerdict {
    Clear,
    Stagnant { count: u32, loop_type: LoopType },
    /// 达到补救级别：下一轮提示带补救指令
    Warn { count: u32, loop_type: LoopType },
    /// 达到阈值：终止运行
    Fatal { count: u32, loop_type: LoopType },
}

impl StagnationVerdict {
    pub fn is_looping(&self) -> bool {
        !matches!(self, StagnationVerdict::Clear)
    }
}

const RUN_MARKER: &str = "Executing run:";

/// 取 `Executing run:` 之后的命令文本（截到结果分隔符为止）
fn run_command(observation: &str) -> Option<&str> {
    let (_, after) = observation.rsplit_once(RUN_MARKER)?;
    let cmd = after.split(" | Result:").next().unwrap_or(after);
    Some(cmd.trim())
}

fn is_skip_marker(observation: &str) -> bool {
    observation.starts_with("Skipped:") || observation.contains("Result: Skipped:")
}

pub struct StagnationDetector {
    threshold: u32,
    remediation_at: u32,
    window: usize,
}

impl StagnationDetector {
    pub fn new(cfg: &LoopSection) -> Self {
        Self {
            threshold: cfg.stagnation_threshold.max(1),
            remediation_at: cfg.remediation_level(),
            window: cfg.stagnation_window.max(3),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// 对最近的观察归类；少于 3 条时不判断
    pub fn classify(&self, observations: &[String]) -> Option<LoopType> {
        let start = observations.len().saturating_sub(self.window);
        let recent = &observations[start..];
        if recent.len() < 3 {
            return None;
        }
        let last3 = &recent[recent.len() - 3..];
        let mut found = None;

        if last3.iter().all(|o| o == &last3[2]) {
            found = Some(LoopType::IdenticalObservations);
        }
        if is_skip_marker(&last3[2]) {
            found = Some(LoopType::RedundantWrites);
        }

        let joined = last3.join(" | ");
        if joined.contains("Action: read")
            && !joined.contains("Action: write")
            && !joined.contains("Action: run")
            && joined.matches("Action: read").count() >= 2
        {
            found = Some(LoopType::ReadLoop);
        }
        if joined.matches("Plan updated").count() >= 2 && !joined.contains("Executing") {
            found = Some(LoopType::PlanningLoop);
        }
        if joined.contains("Action: run") {
            let commands: Vec<&str> = recent.iter().filter_map(|o| run_command(o)).collect();
            let installs = commands
                .iter()
                .filter(|c| c.to_lowercase().contains("pip install"))
                .count();
            if commands.len() >= 3 && installs >= 3 {
                found = Some(LoopType::CommandLoop);
            }
        }
        found
    }

    /// 更新 state 中的停滞计数与循环类型，返回本轮结论
    pub fn update(&self, state: &mut AgentState) -> StagnationVerdict {
        let Some(loop_type) = self.classify(&state.observations) else {
            state.stagnation_count = 0;
            state.loop_type = None;
            return StagnationVerdict::Clear;
        };
        state.stagnation_count += 1;
        state.loop_type = Some(loop_type);
        let count = state.stagnation_count;
        tracing::warn!(
            iteration = state.iteration,
            loop_type = %loop_type,
            count,
            threshold = self.threshold,
            "stagnation detected"
        );
        if count >= self.threshold {
            StagnationVerdict::Fatal { count, loop_type }
        } else if count >= self.remediation_at {
            StagnationVerdict::Warn { count, loop_type }
        } else {
            StagnationVerdict::Stagnant { count, loop_type }
        }
    }
}

/// 致命停滞时写入 state.error 的原因
pub fn fatal_reason(app: &AppSection) -> String {
    format!(
        "Loop detected: Agent stopped to prevent token waste. Check {} to debug.",
        app.whole_state_file
    )
}

/// 针对循环类型的补救指令
pub fn remediation(loop_type: LoopType, app: &AppSection) -> String {
    match loop_type {
        LoopType::PlanningLoop => concat!(
            "You are stuck in a PLANNING LOOP - updating plans without executing actions.\n",
            "REQUIRED ACTION: Stop planning and START EXECUTING:\n",
            "  1. Use {'action': 'write', ...} to create/modify a file\n",
            "  2. Use {'action': 'run', 'command': '...'} to test your code\n",
            "  3. Use {'action': 'read', ...} only if you need to check file contents\n",
            "DO NOT just read files and update plans. Take concrete action NOW."
        )
        .to_string(),
        LoopType::ReadLoop => concat!(
            "You are stuck in a READ LOOP - reading files without taking action.\n",
            "REQUIRED ACTION: Stop reading and START BUILDING:\n",
            "  1. Write actual implementation code (not placeholders)\n",
            "  2. Run tests to identify errors\n",
            "  3. Fix the errors you find\n",
            "Reading files will not make progress. Execute something concrete NOW."
        )
        .to_string(),
        LoopType::RedundantWrites => concat!(
            "You are trying to write identical content repeatedly.\n",
            "REQUIRED ACTION: Change your approach:\n",
            "  1. Read the file you're trying to write to understand what exists\n",
            "  2. Identify what's DIFFERENT from what you want\n",
            "  3. Write ONLY the changed version\n",
            "  4. Or try a completely different approach to solve the problem"
        )
        .to_string(),
        LoopType::CommandLoop => concat!(
            "You are stuck in a COMMAND LOOP - running the same commands repeatedly.\n",
            "REQUIRED ACTION: Stop repeating commands and ANALYZE THE PROBLEM:\n",
            "  1. The command likely succeeded - check if packages are already installed\n",
            "  2. If you're getting errors, READ THE ERROR MESSAGE carefully\n",
            "  3. Try a DIFFERENT approach instead of running the same command\n",
            "  4. Consider: Are you solving the right problem?\n",
            "Running 'pip install' repeatedly will NOT fix import errors caused by code issues."
        )
        .to_string(),
        LoopType::IdenticalObservations => format!(
            "Suggested: Read '{}' and '{}' to re-orient yourself.",
            app.whole_state_file, app.plan_file
        ),
    }
}

/// 把补救指令包进 `CRITICAL: You are STAGNANT` 块
pub fn remediation_block(count: u32, threshold: u32, remediation: &str) -> String {
    let rule = "=".repeat(60);
    format!(
        "\n\n{rule}\nCRITICAL: You are STAGNANT (Count: {count}/{threshold}).\n\
         You have repeated the same observation multiple times.\n\
         YOU MUST CHANGE YOUR APPROACH IMMEDIATELY.\n{rule}\n\n{remediation}\n{rule}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> StagnationDetector {
        StagnationDetector::new(&LoopSection::default())
    }

    fn obs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_identical_observations() {
        let o = obs(&["x", "same", "same", "same"]);
        assert_eq!(detector().classify(&o), Some(LoopType::IdenticalObservations));
    }

    #[test]
    fn test_fewer_than_three_never_loops() {
        assert_eq!(detector().classify(&obs(&["a", "a"])), None);
    }

    #[test]
    fn test_redundant_writes_marker() {
        let o = obs(&[
            "a",
            "b",
            "Action: write a.py | Executing write: a.py | Result: Skipped: Content for a.py is already identical",
        ]);
        assert_eq!(detector().classify(&o), Some(LoopType::RedundantWrites));
    }

    #[test]
    fn test_read_loop() {
        let o = obs(&[
            "Action: read a.py | Executing read: a.py | Result: x",
            "Action: ls | Executing ls: . | Result: y",
            "Action: read b.py | Executing read: b.py | Result: z",
        ]);
        assert_eq!(detector().classify(&o), Some(LoopType::ReadLoop));
    }

    #[test]
    fn test_planning_loop() {
        let o = obs(&["Plan updated: T1", "Chat message: thinking", "Plan updated: T2"]);
        assert_eq!(detector().classify(&o), Some(LoopType::PlanningLoop));
    }

    #[test]
    fn test_command_loop_has_highest_precedence() {
        let run = |c: &str| format!("Action: run '{c}' | Executing run: {c} | Result: Exit 0");
        let o = vec![
            run("pip install a"),
            run("python main.py"),
            run("pip install a"),
            run("pip install a"),
            run("pip install a"),
        ];
        // 最后 3 条也完全相同，但 command_loop 覆盖 identical_observations
        assert_eq!(detector().classify(&o), Some(LoopType::CommandLoop));
    }

    #[test]
    fn test_three_installs_in_window_is_command_loop() {
        let run = |c: &str| format!("Action: run '{c}' | Executing run: {c} | Result: Exit 1");
        let o = vec![
            run("pip install requests"),
            run("python main.py"),
            run("pip install flask"),
            run("python app.py"),
            run("pip install -r requirements.txt"),
        ];
        assert_eq!(detector().classify(&o[..4]), None);
        assert_eq!(detector().classify(&o), Some(LoopType::CommandLoop));
    }

    #[test]
    fn test_varied_sequence_resets_counter() {
        let d = detector();
        let mut state = AgentState::new("goal");
        state.observations = obs(&["same", "same", "same"]);
        assert!(d.update(&mut state).is_looping());
        assert_eq!(state.stagnation_count, 1);

        state.observations = obs(&["a", "b", "c"]);
        assert_eq!(d.update(&mut state), StagnationVerdict::Clear);
        assert_eq!(state.stagnation_count, 0);
        assert!(state.loop_type.is_none());
    }

    #[test]
    fn test_warn_then_fatal() {
        let d = detector();
        let mut state = AgentState::new("goal");
        state.observations = obs(&["same", "same", "same"]);
        let verdicts: Vec<_> = (0..5).map(|_| d.update(&mut state)).collect();
        assert!(matches!(verdicts[2], StagnationVerdict::Stagnant { count: 3, .. }));
        assert!(matches!(verdicts[3], StagnationVerdict::Warn { count: 4, .. }));
        assert!(matches!(verdicts[4], StagnationVerdict::Fatal { count: 5, .. }));
    }

    #[test]
    fn test_remediation_block_shape() {
        let app = AppSection::default();
        let text = remediation(LoopType::IdenticalObservations, &app);
        assert!(text.contains("whole.task.md"));
        let block = remediation_block(4, 5, &text);
        assert!(block.contains("CRITICAL: You are STAGNANT (Count: 4/5)."));
        assert!(block.ends_with(&format!("{}\n", "=".repeat(60))));
    }
}
