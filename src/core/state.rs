//! 状态定义：分派循环阶段与运行时状态投影
//!
//! 运行时通过 watch 通道发布轻量的 RuntimeState（阶段、排队数、活跃能力、最近错误），
//! 供用户界面层渲染；完整上下文只由运行时任务持有。

use serde::Serialize;

/// 分派循环阶段：Idle -> AwaitingModel -> ExecutingTools -> AwaitingModel ... -> Done
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    AwaitingModel,
    ExecutingTools,
    Done,
}

/// 界面看到的「投影」状态
#[derive(Clone, Debug, Serialize)]
pub struct RuntimeState {
    pub phase: LoopPhase,
    /// 等待运行时处理的指令数（不含正在执行的一条）
    pub queued: usize,
    pub active_capability: Option<String>,
    pub last_error: Option<String>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            phase: LoopPhase::Idle,
            queued: 0,
            active_capability: None,
            last_error: None,
        }
    }
}
