//! Planner：组装模型请求并解析回复
//!
//! 每次请求都重新拼 system prompt（基础提示 + 当前注册能力的 schema + 调用格式 schema），
//! 再把上下文回合转换为 Message；parse_model_reply 把回复解析为最终答案或有序调用列表。

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::llm::{LlmClient, LlmError, Message, SamplingParams};
use crate::memory::{Role, Turn, TurnContent, TurnOrigin};
use crate::tools::{new_invocation_id, tool_call_schema_json, ToolInvocationRequest, ToolRegistry};

/// 工具结果回合写回模型时的前缀
pub const TOOL_RESULT_PREFIX: &str = "Tool result ";
/// 调度器合成指令写回模型时的前缀
pub const SCHEDULED_PREFIX: &str = "[Scheduled] ";

/// 默认基础提示
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Lumen, a personal assistant. \
Answer in plain text when no capability is needed. \
To use capabilities, reply with JSON only: {\"tool\": name, \"args\": {...}} for one call, \
or {\"tool_calls\": [{\"tool\": name, \"args\": {...}}, ...]} for several calls that run in order. \
Tool results come back as user messages starting with \"Tool result\".";

/// 解析后的模型回复
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    /// 最终答案
    Final(String),
    /// 非空、有序的调用请求
    Invoke(Vec<ToolInvocationRequest>),
}

#[derive(Deserialize)]
struct RawCall {
    tool: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    Batch { tool_calls: Vec<RawCall> },
    Single(RawCall),
    Answer { answer: String },
}

impl RawCall {
    fn into_request(self) -> ToolInvocationRequest {
        let arguments = if self.args.is_null() {
            Value::Object(Default::default())
        } else {
            self.args
        };
        ToolInvocationRequest {
            invocation_id: self
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(new_invocation_id),
            capability: self.tool,
            arguments,
        }
    }
}

/// 从回复中取出 JSON 部分：```json 围栏内容，或以 `{` 开头的整段文本；纯文本返回 None
fn extract_json(trimmed: &str) -> Option<&str> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    if trimmed.starts_with('{') {
        return Some(trimmed);
    }
    None
}

/// 解析模型回复：纯文本为最终答案；JSON 为调用请求或 {"answer"}；空回复或无法解析为 Protocol 错误
pub fn parse_model_reply(output: &str) -> Result<ModelReply, LlmError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(LlmError::Protocol("empty model reply".to_string()));
    }
    let Some(json_str) = extract_json(trimmed) else {
        return Ok(ModelReply::Final(trimmed.to_string()));
    };

    let envelope: Envelope = serde_json::from_str(json_str)
        .map_err(|e| LlmError::Protocol(format!("{}: {}", e, json_str)))?;

    match envelope {
        Envelope::Batch { tool_calls } => {
            if tool_calls.is_empty() {
                return Err(LlmError::Protocol("empty tool_calls list".to_string()));
            }
            if tool_calls.iter().any(|c| c.tool.is_empty()) {
                return Err(LlmError::Protocol("tool_calls entry without a name".to_string()));
            }
            Ok(ModelReply::Invoke(
                tool_calls.into_iter().map(RawCall::into_request).collect(),
            ))
        }
        Envelope::Single(call) if call.tool.is_empty() => Ok(ModelReply::Final(trimmed.to_string())),
        Envelope::Single(call) => Ok(ModelReply::Invoke(vec![call.into_request()])),
        Envelope::Answer { answer } if answer.trim().is_empty() => {
            Err(LlmError::Protocol("empty answer".to_string()))
        }
        Envelope::Answer { answer } => Ok(ModelReply::Final(answer)),
    }
}

/// 把上下文回合转换为模型消息
pub fn render_turns(turns: &[Turn]) -> Vec<Message> {
    turns
        .iter()
        .map(|turn| match &turn.content {
            TurnContent::Text { text } => match (turn.role, turn.origin) {
                (Role::Assistant, _) => Message::assistant(text.clone()),
                (_, TurnOrigin::Scheduler) => Message::user(format!("{SCHEDULED_PREFIX}{text}")),
                (_, TurnOrigin::User) => Message::user(text.clone()),
            },
            TurnContent::ToolCalls { calls } => {
                let calls: Vec<Value> = calls
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "id": c.invocation_id,
                            "tool": c.capability,
                            "args": c.arguments,
                        })
                    })
                    .collect();
                Message::assistant(serde_json::json!({ "tool_calls": calls }).to_string())
            }
            TurnContent::ToolResult { result } => {
                Message::user(format!("{TOOL_RESULT_PREFIX}{}", result.render()))
            }
        })
        .collect()
}

/// Planner：持有 LLM、基础提示、采样参数与单次请求超时
pub struct Planner {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    sampling: SamplingParams,
    request_timeout: Duration,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            sampling: SamplingParams::default(),
            request_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base_system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 获取 LLM 累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 基础提示 + 能力 schema + 调用格式 schema
    pub fn system_prompt_for(&self, registry: &ToolRegistry) -> String {
        format!(
            "{}\n\nAvailable capabilities (JSON Schema for args):\n{}\n\nInvocation format:\n{}",
            self.system_prompt,
            registry.to_schema_json(),
            tool_call_schema_json()
        )
    }

    /// 发送一次请求（带超时），返回原始回复文本
    pub async fn request(&self, registry: &ToolRegistry, turns: &[Turn]) -> Result<String, LlmError> {
        let mut messages = vec![Message::system(self.system_prompt_for(registry))];
        messages.extend(render_turns(turns));
        match tokio::time::timeout(self.request_timeout, self.llm.complete(&messages, &self.sampling)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                secs: self.request_timeout.as_secs(),
            }),
        }
    }
}
