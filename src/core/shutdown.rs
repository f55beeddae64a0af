//! 优雅关闭：Ctrl+C / SIGTERM -> CancellationToken
//!
//! 主循环在各阶段之间检查 token，被取消时先落盘 AgentState 再返回 Interrupted；
//! 预取 worker 不挂在这个 token 上，由 `Gateway::shutdown` 单独排空。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 中断来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl ShutdownReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownReason::Interrupt => "interrupt",
            ShutdownReason::Terminate => "terminate",
        }
    }
}

#[derive(Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    /// 只记录第一次的原因
    reason: Mutex<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 传给 LoopController 的协作式取消 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert(reason);
        }
        self.token.cancel();
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|r| *r)
    }

    /// 后台等待第一个信号
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let reason = tokio::select! {
                r = tokio::signal::ctrl_c() => match r {
                    Ok(()) => ShutdownReason::Interrupt,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                        return;
                    }
                },
                _ = terminate() => ShutdownReason::Terminate,
            };
            tracing::info!(reason = reason.as_str(), "signal received, interrupting after the current phase");
            manager.trigger(reason);
        });
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to listen for SIGTERM");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_cancels_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        assert_eq!(manager.reason(), None);

        manager.trigger(ShutdownReason::Terminate);
        assert!(token.is_cancelled());
        assert_eq!(manager.reason(), Some(ShutdownReason::Terminate));
    }

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        manager.trigger(ShutdownReason::Interrupt);
        manager.trigger(ShutdownReason::Terminate);
        assert_eq!(manager.reason(), Some(ShutdownReason::Interrupt));
    }
}
