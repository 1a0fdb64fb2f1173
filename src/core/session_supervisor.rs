//! 会话监管：单次循环的中断管理
//!
//! 每个分派循环开始时领取一个新的 CancellationToken；用户 stop 只取消当前循环，
//! 不影响排在后面的指令。stop 不经过命令队列，因此能打断正在阻塞的模型请求或能力调用。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

/// 会话级中断管理：持有当前循环的取消令牌
#[derive(Debug)]
pub struct SessionSupervisor {
    current: Mutex<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(CancellationToken::new()),
        }
    }

    /// 为新一轮循环换发令牌（旧令牌若已取消也不会影响新循环）
    pub fn begin_cycle(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = token.clone();
        token
    }

    /// 触发取消（用户 stop）
    pub fn stop(&self) {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.cancel();
    }

}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
