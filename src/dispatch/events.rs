//! 分派过程事件：推送给界面层展示步数、调用、观察与最终回复

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// 执行周期更新（已消耗 / 上限）
    StepUpdate { cycle: usize, max_turns: usize },
    /// 正在等待模型
    Thinking,
    /// 即将执行一次调用
    ToolCall {
        invocation_id: String,
        capability: String,
        arguments: serde_json::Value,
    },
    /// 调用结果（预览，避免过长）
    Observation {
        invocation_id: String,
        capability: String,
        success: bool,
        preview: String,
    },
    /// 模型请求失败后的恢复动作
    Recovery { action: String, detail: String },
    /// 最终回复
    Answer { text: String },
    Error { text: String },
}
