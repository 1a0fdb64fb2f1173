//! 输入守卫：进程级锁定状态
//!
//! 只在唯一入口（AgentHandle::submit）处检查一次；锁定时拒绝用户输入。
//! 定时任务在创建时已获授权，不受锁定影响。

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct InputGuard {
    locked: AtomicBool,
}

impl InputGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) {
        if !self.locked.swap(true, Ordering::SeqCst) {
            tracing::warn!("input guard engaged, user input will be rejected");
        }
    }

    pub fn unlock(&self) {
        if self.locked.swap(false, Ordering::SeqCst) {
            tracing::info!("input guard released");
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }
}
