//! 短期记忆：对话上下文
//!
//! 有序的 Turn 日志，只追加：append / snapshot（不可变拷贝）/ reset。
//! 回合结束后由运行时调用 trim_at_boundary 剪枝，切点总落在用户文本回合上，
//! 保证调用请求与其结果不会被拆开。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tools::{ToolInvocationRequest, ToolResult};

/// 回合角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

/// 回合来源：用户输入或调度器合成的指令
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOrigin {
    #[default]
    User,
    Scheduler,
}

/// 回合内容
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnContent {
    Text { text: String },
    ToolCalls { calls: Vec<ToolInvocationRequest> },
    ToolResult { result: ToolResult },
}

/// 单个回合
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
    #[serde(default)]
    pub origin: TurnOrigin,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, TurnContent::Text { text: text.into() }, TurnOrigin::User)
    }

    /// 调度器触发的合成指令（user 角色，来源标记为 Scheduler）
    pub fn scheduled(text: impl Into<String>) -> Self {
        Self::new(
            Role::User,
            TurnContent::Text { text: text.into() },
            TurnOrigin::Scheduler,
        )
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(
            Role::Assistant,
            TurnContent::Text { text: text.into() },
            TurnOrigin::User,
        )
    }

    pub fn tool_calls(calls: Vec<ToolInvocationRequest>) -> Self {
        Self::new(Role::Assistant, TurnContent::ToolCalls { calls }, TurnOrigin::User)
    }

    pub fn tool_result(result: ToolResult) -> Self {
        Self::new(
            Role::ToolResult,
            TurnContent::ToolResult { result },
            TurnOrigin::User,
        )
    }

    fn new(role: Role, content: TurnContent, origin: TurnOrigin) -> Self {
        Self {
            role,
            content,
            origin,
            timestamp: Utc::now(),
        }
    }

    /// 文本内容（非文本回合返回 None）
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            TurnContent::Text { text } => Some(text),
            _ => None,
        }
    }

    /// 用户文本回合：剪枝时唯一合法的切点
    pub fn is_user_text(&self) -> bool {
        self.role == Role::User && matches!(self.content, TurnContent::Text { .. })
    }
}

/// 对话上下文：只追加的回合日志
#[derive(Clone, Debug, Default)]
pub struct ConversationContext {
    turns: Vec<Turn>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从持久化恢复
    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn append(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    /// 不可变拷贝，之后的 append 不会影响已取出的快照
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn reset(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// 超出 max_turns*2 时丢弃最旧的回合，切点前移到第一个用户文本回合；
    /// 找不到切点则保持原样。返回丢弃的回合数
    pub fn trim_at_boundary(&mut self, max_turns: usize) -> usize {
        let limit = max_turns * 2;
        if self.turns.len() <= limit {
            return 0;
        }
        let earliest = self.turns.len() - limit;
        let cut = self.turns[earliest..]
            .iter()
            .position(Turn::is_user_text)
            .map(|offset| earliest + offset);
        match cut {
            Some(cut) if cut > 0 => {
                self.turns.drain(..cut);
                cut
            }
            _ => 0,
        }
    }
}
