//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 两种用法：
//! - 脚本模式：按顺序返回预设回复（文本或错误），并记录每次收到的消息，便于断言；
//! - 默认模式（脚本耗尽且未设置 repeat）：若最后一条是工具结果则给出最终回复，
//!   否则回显为一次 echo 调用，便于本地跑通分派流程。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{ChatRole, LlmClient, LlmError, Message, SamplingParams};

/// 工具结果写回上下文时使用的前缀（与 dispatch::planner 的渲染一致）
const TOOL_RESULT_PREFIX: &str = "Tool result ";

/// 单条预设回复
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Error(LlmError),
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<MockReply>,
    repeat: Option<MockReply>,
    requests: Vec<Vec<Message>>,
}

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient {
    state: Mutex<MockState>,
    delay: Option<Duration>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按顺序返回给定文本
    pub fn scripted<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::default();
        for r in replies {
            client.push(MockReply::Text(r.into()));
        }
        client
    }

    /// 脚本耗尽后始终返回同一回复
    pub fn repeating(reply: impl Into<String>) -> Self {
        let client = Self::default();
        client.lock().repeat = Some(MockReply::Text(reply.into()));
        client
    }

    /// 每次回复前等待（用于测试 stop 与超时）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, reply: MockReply) {
        self.lock().script.push_back(reply);
    }

    pub fn push_error(&self, err: LlmError) {
        self.push(MockReply::Error(err));
    }

    /// 收到过的全部请求（每个请求是完整消息列表，含 system）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn default_reply(messages: &[Message]) -> String {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        if last.starts_with(TOOL_RESULT_PREFIX) {
            format!("Echo from Mock: {last}")
        } else {
            serde_json::json!({ "tool": "echo", "args": { "text": last } }).to_string()
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(
        &self,
        messages: &[Message],
        _sampling: &SamplingParams,
    ) -> Result<String, LlmError> {
        let reply = {
            let mut state = self.lock();
            state.requests.push(messages.to_vec());
            state.script.pop_front().or_else(|| state.repeat.clone())
        };
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match reply {
            Some(MockReply::Text(text)) => Ok(text),
            Some(MockReply::Error(e)) => Err(e),
            None => Ok(Self::default_reply(messages)),
        }
    }
}
