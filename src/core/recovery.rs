//! 错误恢复引擎
//!
//! 根据模型错误与已失败次数返回 RecoveryAction，供分派循环决定是退避重试还是终止。
//! 只针对模型请求；已执行的能力调用永远不会被重试。

use std::time::Duration;

use crate::core::RecoveryAction;
use crate::llm::LlmError;

/// 模型请求的重试策略：最多重试次数 + 指数退避（有上限）
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败（从 0 开始）后的退避时长：base * 2^attempt，不超过 backoff_max
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// 语义化错误恢复：将模型错误映射为「退避后重试」或「终止」
#[derive(Debug, Default, Clone)]
pub struct RecoveryEngine {
    policy: RetryPolicy,
}

impl RecoveryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// attempt 为已失败的次数减一（第一次失败传 0）
    pub fn handle(&self, err: &LlmError, attempt: u32) -> RecoveryAction {
        if attempt >= self.policy.max_retries {
            return RecoveryAction::Abort;
        }
        let backoff = self.policy.backoff(attempt);
        match err {
            LlmError::RateLimited { retry_after_ms } => {
                let hinted = Duration::from_millis(*retry_after_ms);
                RecoveryAction::RetryAfter(hinted.max(backoff).min(self.policy.backoff_max))
            }
            LlmError::Timeout { .. } | LlmError::Transport(_) | LlmError::Protocol(_) => {
                RecoveryAction::RetryAfter(backoff)
            }
        }
    }
}
