//! Agent 错误类型与恢复动作
//!
//! AgentError 是循环/运行时级别的错误；ErrorKind 是可序列化的错误分类，
//! 随 ToolResult 与 DispatchOutcome 一起写回上下文或交给上层。
//! 与 RecoveryEngine 配合：根据模型错误决定 RetryAfter / Abort。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 运行时句柄与沙箱返回的错误（锁定、运行时关闭、路径逃逸）；模型错误走 LlmError
#[derive(Error, Debug)]
pub enum AgentError {
    /// 输入守卫处于锁定状态，拒绝用户输入
    #[error("Input rejected: agent is locked")]
    Locked,

    /// 运行时任务已退出（命令通道关闭）
    #[error("Agent runtime is not running")]
    RuntimeClosed,

    #[error("Path escape attempt: {0}")]
    PathEscape(String),
}

/// 错误分类：能力级错误进入 ToolResult，循环级错误进入 DispatchOutcome，
/// 调度器错误同步返回给调用方
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownCapability,
    InvalidArguments,
    CapabilityFailure,
    Timeout,
    /// 用户 stop 中断了正在阻塞的调用
    Cancelled,
    ModelUnavailable,
    ModelProtocolError,
    InvalidTrigger,
    NotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownCapability => "UnknownCapability",
            ErrorKind::InvalidArguments => "InvalidArguments",
            ErrorKind::CapabilityFailure => "CapabilityFailure",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::ModelUnavailable => "ModelUnavailable",
            ErrorKind::ModelProtocolError => "ModelProtocolError",
            ErrorKind::InvalidTrigger => "InvalidTrigger",
            ErrorKind::NotFound => "NotFound",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 恢复引擎根据模型错误给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待给定时长后重发同一个请求
    RetryAfter(Duration),
    /// 放弃：以 ModelUnavailable / ModelProtocolError 结束当前循环
    Abort,
}
