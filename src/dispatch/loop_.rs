//! 分派主循环
//!
//! 指令入上下文 -> 请求模型 -> 最终答案则结束；调用请求则按顺序执行、逐条写回结果 -> 再请求模型。
//! 执行周期达到 max_turns 后，模型只剩一次给出最终答案的机会，再要调用就以降级答案结束（不执行）。
//! 模型请求失败按 RecoveryEngine 退避重试；已执行的调用不会重试。stop 随时打断等待。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::core::{ErrorKind, LoopPhase, RecoveryAction, RecoveryEngine, RuntimeState};
use crate::dispatch::{parse_model_reply, DispatchEvent, ModelReply, Planner};
use crate::llm::LlmError;
use crate::memory::{ConversationContext, Turn, TurnContent};
use crate::tools::{ToolExecutor, ToolInvocationRequest, ToolResult};

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

const BUDGET_EXHAUSTED_ANSWER: &str = "抱歉，这个任务需要的步骤超出了限制，我先停在这里。";
const MODEL_UNAVAILABLE_ANSWER: &str = "抱歉，模型服务暂时不可用，请稍后再试。";
const MODEL_PROTOCOL_ANSWER: &str = "抱歉，我没能理解模型的回复，请换个说法再试。";
const STOPPED_ANSWER: &str = "[已停止] 本轮已中断，已完成的操作保持生效。";

/// 进入循环的一条指令
#[derive(Debug, Clone)]
pub enum Instruction {
    /// 用户输入
    User(String),
    /// 调度器触发：合成文本 + 可选的调用模板（作为第一个执行周期）
    Scheduled {
        text: String,
        invoke: Option<ToolInvocationRequest>,
    },
}

impl Instruction {
    pub fn user(text: impl Into<String>) -> Self {
        Instruction::User(text.into())
    }
}

/// 循环结束方式
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Answered,
    BudgetExhausted,
    ModelUnavailable,
    ModelProtocolError,
    Stopped,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Answered => "answered",
            DispatchStatus::BudgetExhausted => "budget_exhausted",
            DispatchStatus::ModelUnavailable => "model_unavailable",
            DispatchStatus::ModelProtocolError => "model_protocol_error",
            DispatchStatus::Stopped => "stopped",
        }
    }
}

/// 单次循环的结果
#[derive(Clone, Debug, Serialize)]
pub struct DispatchOutcome {
    pub status: DispatchStatus,
    /// 最终答案或降级答案（已写入上下文）
    pub answer: String,
    /// 实际消耗的执行周期数
    pub cycles: usize,
    /// 循环级错误的详情（模型错误等）
    pub error: Option<String>,
}

impl DispatchOutcome {
    /// 降级结束时对应的错误分类
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self.status {
            DispatchStatus::ModelUnavailable => Some(ErrorKind::ModelUnavailable),
            DispatchStatus::ModelProtocolError => Some(ErrorKind::ModelProtocolError),
            DispatchStatus::Stopped => Some(ErrorKind::Cancelled),
            _ => None,
        }
    }
}

/// 单次循环的外部协作者：取消令牌（必需）、事件通道与状态投影（可选）
pub struct DispatchSession<'a> {
    pub cancel: CancellationToken,
    pub events: Option<&'a mpsc::UnboundedSender<DispatchEvent>>,
    pub state: Option<&'a watch::Sender<RuntimeState>>,
}

impl<'a> DispatchSession<'a> {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            events: None,
            state: None,
        }
    }

    pub fn with_events(mut self, tx: &'a mpsc::UnboundedSender<DispatchEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn with_state(mut self, tx: &'a watch::Sender<RuntimeState>) -> Self {
        self.state = Some(tx);
        self
    }

    fn send(&self, ev: DispatchEvent) {
        if let Some(tx) = self.events {
            let _ = tx.send(ev);
        }
    }

    fn phase(&self, phase: LoopPhase, active: Option<&str>) {
        if let Some(tx) = self.state {
            tx.send_modify(|s| {
                s.phase = phase;
                s.active_capability = active.map(String::from);
            });
        }
    }
}

/// 模型请求没能拿到可用回复的原因
enum Halt {
    Stopped,
    Failed(LlmError),
}

/// 分派器：Planner + 执行器 + 恢复引擎 + 周期上限
pub struct Dispatcher {
    planner: Planner,
    executor: Arc<ToolExecutor>,
    recovery: RecoveryEngine,
    max_turns: usize,
}

impl Dispatcher {
    pub fn new(
        planner: Planner,
        executor: Arc<ToolExecutor>,
        recovery: RecoveryEngine,
        max_turns: usize,
    ) -> Self {
        Self {
            planner,
            executor,
            recovery,
            max_turns: max_turns.max(1),
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    /// 运行一次完整循环，直到最终答案、预算耗尽、模型失败或被 stop
    pub async fn run(
        &self,
        context: &mut ConversationContext,
        instruction: Instruction,
        session: &DispatchSession<'_>,
    ) -> DispatchOutcome {
        let mut cycles = 0;

        match instruction {
            Instruction::User(text) => context.append(Turn::user(text)),
            Instruction::Scheduled { text, invoke } => {
                context.append(Turn::scheduled(text));
                if let Some(request) = invoke {
                    cycles += 1;
                    session.send(DispatchEvent::StepUpdate {
                        cycle: cycles,
                        max_turns: self.max_turns,
                    });
                    if !self.execute_batch(context, vec![request], session).await {
                        return self.finish_stopped(context, cycles, session);
                    }
                }
            }
        }

        loop {
            if session.cancel.is_cancelled() {
                return self.finish_stopped(context, cycles, session);
            }
            session.phase(LoopPhase::AwaitingModel, None);
            session.send(DispatchEvent::Thinking);

            let reply = match self.request_model(context, session).await {
                Ok(reply) => reply,
                Err(Halt::Stopped) => return self.finish_stopped(context, cycles, session),
                Err(Halt::Failed(e)) => return self.finish_model_failure(context, cycles, e, session),
            };

            match reply {
                ModelReply::Final(text) => {
                    return self.finish(context, DispatchStatus::Answered, text, cycles, None, session)
                }
                ModelReply::Invoke(requests) => {
                    if cycles >= self.max_turns {
                        tracing::warn!(
                            cycles,
                            max_turns = self.max_turns,
                            pending = requests.len(),
                            "turn budget exhausted, dropping further invocation requests"
                        );
                        let answer = budget_answer(context);
                        return self.finish(
                            context,
                            DispatchStatus::BudgetExhausted,
                            answer,
                            cycles,
                            None,
                            session,
                        );
                    }
                    cycles += 1;
                    session.send(DispatchEvent::StepUpdate {
                        cycle: cycles,
                        max_turns: self.max_turns,
                    });
                    if !self.execute_batch(context, requests, session).await {
                        return self.finish_stopped(context, cycles, session);
                    }
                }
            }
        }
    }

    /// 请求模型并解析；失败时按恢复引擎退避重试同一个请求
    async fn request_model(
        &self,
        context: &ConversationContext,
        session: &DispatchSession<'_>,
    ) -> Result<ModelReply, Halt> {
        let snapshot = context.snapshot();
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = session.cancel.cancelled() => return Err(Halt::Stopped),
                r = self.planner.request(self.executor.registry(), &snapshot) => r,
            };
            let err = match result.and_then(|text| parse_model_reply(&text)) {
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };

            match self.recovery.handle(&err, attempt) {
                RecoveryAction::RetryAfter(wait) => {
                    tracing::warn!(attempt, error = %err, wait_ms = wait.as_millis() as u64, "model request failed, retrying");
                    session.send(DispatchEvent::Recovery {
                        action: "retry".to_string(),
                        detail: err.to_string(),
                    });
                    tokio::select! {
                        biased;
                        _ = session.cancel.cancelled() => return Err(Halt::Stopped),
                        _ = tokio::time::sleep(wait) => {}
                    }
                    attempt += 1;
                }
                RecoveryAction::Abort => {
                    tracing::error!(attempt, error = %err, "model request failed, giving up");
                    return Err(Halt::Failed(err));
                }
            }
        }
    }

    /// 写入调用回合并按顺序执行；被 stop 打断时剩余请求记为 Cancelled 且不执行，返回 false
    async fn execute_batch(
        &self,
        context: &mut ConversationContext,
        requests: Vec<ToolInvocationRequest>,
        session: &DispatchSession<'_>,
    ) -> bool {
        context.append(Turn::tool_calls(requests.clone()));
        let mut stopped = false;

        for request in &requests {
            let result = if stopped || session.cancel.is_cancelled() {
                stopped = true;
                ToolResult::failure(
                    request,
                    ErrorKind::Cancelled,
                    serde_json::json!({ "error": "not executed: stopped by user" }),
                )
            } else {
                session.phase(LoopPhase::ExecutingTools, Some(&request.capability));
                session.send(DispatchEvent::ToolCall {
                    invocation_id: request.invocation_id.clone(),
                    capability: request.capability.clone(),
                    arguments: request.arguments.clone(),
                });
                let result = self.executor.execute(request, &session.cancel).await;
                if result.error_kind == Some(ErrorKind::Cancelled) {
                    stopped = true;
                }
                result
            };

            session.send(DispatchEvent::Observation {
                invocation_id: result.invocation_id.clone(),
                capability: result.capability.clone(),
                success: result.success,
                preview: preview(&result.render()),
            });
            context.append(Turn::tool_result(result));
        }
        !stopped
    }

    fn finish(
        &self,
        context: &mut ConversationContext,
        status: DispatchStatus,
        answer: String,
        cycles: usize,
        error: Option<String>,
        session: &DispatchSession<'_>,
    ) -> DispatchOutcome {
        context.append(Turn::assistant(answer.clone()));
        session.send(DispatchEvent::Answer {
            text: answer.clone(),
        });
        session.phase(LoopPhase::Done, None);
        let (prompt_tokens, completion_tokens, total_tokens) = self.planner.token_usage();
        tracing::info!(
            status = ?status,
            cycles,
            prompt_tokens,
            completion_tokens,
            total_tokens,
            "dispatch cycle done"
        );
        DispatchOutcome {
            status,
            answer,
            cycles,
            error,
        }
    }

    fn finish_stopped(
        &self,
        context: &mut ConversationContext,
        cycles: usize,
        session: &DispatchSession<'_>,
    ) -> DispatchOutcome {
        self.finish(
            context,
            DispatchStatus::Stopped,
            STOPPED_ANSWER.to_string(),
            cycles,
            None,
            session,
        )
    }

    fn finish_model_failure(
        &self,
        context: &mut ConversationContext,
        cycles: usize,
        err: LlmError,
        session: &DispatchSession<'_>,
    ) -> DispatchOutcome {
        session.send(DispatchEvent::Error {
            text: err.to_string(),
        });
        let (status, answer) = match err.kind() {
            ErrorKind::ModelProtocolError => (DispatchStatus::ModelProtocolError, MODEL_PROTOCOL_ANSWER),
            _ => (DispatchStatus::ModelUnavailable, MODEL_UNAVAILABLE_ANSWER),
        };
        self.finish(
            context,
            status,
            answer.to_string(),
            cycles,
            Some(err.to_string()),
            session,
        )
    }
}

/// 预算耗尽时的降级答案：附上最近一次成功调用的结果作为进展
fn budget_answer(context: &ConversationContext) -> String {
    let last_ok = context.turns().iter().rev().find_map(|t| match &t.content {
        TurnContent::ToolResult { result } if result.success => Some(result.render()),
        _ => None,
    });
    match last_ok {
        Some(progress) => format!("{BUDGET_EXHAUSTED_ANSWER}\n目前的进展：{}", preview(&progress)),
        None => BUDGET_EXHAUSTED_ANSWER.to_string(),
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!("{}...", text.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::recovery::RetryPolicy;
    use crate::llm::MockLlmClient;
    use crate::memory::Role;
    use crate::tools::{CapabilityDescriptor, EchoTool, ParameterSchema, ToolRegistry};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// 进入后通知 entered，然后永不返回
    fn blocking(name: &str, entered: Arc<Notify>) -> CapabilityDescriptor {
        CapabilityDescriptor::from_fn(name, "never returns", ParameterSchema::new(), move |_| {
            let entered = entered.clone();
            async move {
                entered.notify_one();
                std::future::pending::<()>().await;
                Ok(serde_json::Value::Null)
            }
        })
    }

    fn results(ctx: &ConversationContext) -> Vec<ToolResult> {
        ctx.turns()
            .iter()
            .filter_map(|t| match &t.content {
                TurnContent::ToolResult { result } => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    fn dispatcher(llm: Arc<MockLlmClient>, max_turns: usize) -> Dispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        dispatcher_for(llm, ToolExecutor::new(registry, 5), max_turns)
    }

    fn dispatcher_for(llm: Arc<MockLlmClient>, executor: ToolExecutor, max_turns: usize) -> Dispatcher {
        let executor = Arc::new(executor);
        let recovery = RecoveryEngine::new(RetryPolicy {
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
        });
        Dispatcher::new(Planner::new(llm, "test"), executor, recovery, max_turns)
    }

    #[tokio::test]
    async fn test_final_answer_without_tools() {
        let llm = Arc::new(MockLlmClient::scripted(["hello there"]));
        let d = dispatcher(llm.clone(), 6);
        let mut ctx = ConversationContext::new();
        let session = DispatchSession::new(CancellationToken::new());

        let outcome = d.run(&mut ctx, Instruction::user("hi"), &session).await;
        assert_eq!(outcome.status, DispatchStatus::Answered);
        assert_eq!(outcome.answer, "hello there");
        assert_eq!(outcome.cycles, 0);
        assert_eq!(ctx.len(), 2);
    }

    #[tokio::test]
    async fn test_tool_cycle_appends_request_then_result() {
        let llm = Arc::new(MockLlmClient::scripted([
            r#"{"tool": "echo", "args": {"text": "ping"}, "id": "c1"}"#,
            "pong",
        ]));
        let d = dispatcher(llm.clone(), 6);
        let mut ctx = ConversationContext::new();
        let outcome = d
            .run(&mut ctx, Instruction::user("say ping"), &DispatchSession::new(CancellationToken::new()))
            .await;

        assert_eq!(outcome.status, DispatchStatus::Answered);
        assert_eq!(outcome.cycles, 1);
        let roles: Vec<Role> = ctx.turns().iter().map(|t| t.role).collect();
        assert_eq!(roles, [Role::User, Role::Assistant, Role::ToolResult, Role::Assistant]);
        // 第二次请求能看到结果
        let second = &llm.requests()[1];
        assert!(second.iter().any(|m| m.content == "Tool result [c1] echo ok: ping"));
    }

    #[tokio::test]
    async fn test_model_failure_retries_then_degrades() {
        let llm = Arc::new(MockLlmClient::new());
        for _ in 0..3 {
            llm.push_error(LlmError::Transport("connection refused".into()));
        }
        let d = dispatcher(llm.clone(), 6);
        let mut ctx = ConversationContext::new();
        let outcome = d
            .run(&mut ctx, Instruction::user("hi"), &DispatchSession::new(CancellationToken::new()))
            .await;
        assert_eq!(outcome.status, DispatchStatus::ModelUnavailable);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ModelUnavailable));
        assert_eq!(llm.request_count(), 3);
    }

    #[tokio::test]
    async fn test_malformed_reply_recovers_on_retry() {
        let llm = Arc::new(MockLlmClient::scripted(["{broken", "fine"]));
        let d = dispatcher(llm.clone(), 6);
        let mut ctx = ConversationContext::new();
        let outcome = d
            .run(&mut ctx, Instruction::user("hi"), &DispatchSession::new(CancellationToken::new()))
            .await;
        assert_eq!(outcome.status, DispatchStatus::Answered);
        assert_eq!(outcome.answer, "fine");
    }

    #[tokio::test]
    async fn test_persistent_malformed_reply_is_protocol_error() {
        let llm = Arc::new(MockLlmClient::repeating("{broken"));
        let d = dispatcher(llm, 6);
        let mut ctx = ConversationContext::new();
        let outcome = d
            .run(&mut ctx, Instruction::user("hi"), &DispatchSession::new(CancellationToken::new()))
            .await;
        assert_eq!(outcome.status, DispatchStatus::ModelProtocolError);
    }

    #[tokio::test]
    async fn test_scheduled_invoke_runs_template_first() {
        let llm = Arc::new(MockLlmClient::scripted(["已提醒"]));
        let d = dispatcher(llm.clone(), 6);
        let mut ctx = ConversationContext::new();
        let template = ToolInvocationRequest::new("echo", serde_json::json!({"text": "提醒喝水"}));
        let outcome = d
            .run(
                &mut ctx,
                Instruction::Scheduled {
                    text: "到时间了".into(),
                    invoke: Some(template),
                },
                &DispatchSession::new(CancellationToken::new()),
            )
            .await;
        assert_eq!(outcome.status, DispatchStatus::Answered);
        assert_eq!(outcome.cycles, 1);
        assert_eq!(llm.request_count(), 1);
        assert!(matches!(
            &ctx.turns()[2].content,
            TurnContent::ToolResult { result } if result.success
        ));
    }

    #[tokio::test]
    async fn test_stop_while_awaiting_model() {
        let llm = Arc::new(MockLlmClient::repeating("late").with_delay(Duration::from_secs(30)));
        let d = dispatcher(llm, 6);
        let mut ctx = ConversationContext::new();
        let token = CancellationToken::new();
        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.cancel();
        });
        let outcome = d
            .run(&mut ctx, Instruction::user("hi"), &DispatchSession::new(token))
            .await;
        assert_eq!(outcome.status, DispatchStatus::Stopped);
        assert_eq!(ctx.turns().last().and_then(|t| t.text()), Some(STOPPED_ANSWER));
    }

    #[tokio::test]
    async fn test_stop_mid_batch_cancels_rest_of_batch() {
        let entered = Arc::new(Notify::new());
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        registry
            .register_descriptor(blocking("block", entered.clone()))
            .unwrap();
        let llm = Arc::new(MockLlmClient::scripted([r#"{"tool_calls": [
            {"tool": "echo", "args": {"text": "first"}, "id": "a"},
            {"tool": "block", "args": {}, "id": "b"},
            {"tool": "echo", "args": {"text": "third"}, "id": "c"}
        ]}"#]));
        let d = dispatcher_for(llm.clone(), ToolExecutor::new(registry, 30), 6);
        let mut ctx = ConversationContext::new();
        let token = CancellationToken::new();
        let session = DispatchSession::new(token.clone());

        let (outcome, _) = tokio::join!(d.run(&mut ctx, Instruction::user("go"), &session), async {
            entered.notified().await;
            token.cancel();
        });

        assert_eq!(outcome.status, DispatchStatus::Stopped);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Cancelled));
        assert_eq!(llm.request_count(), 1);

        let results = results(&ctx);
        let ids: Vec<&str> = results.iter().map(|r| r.invocation_id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(results[0].success);
        assert_eq!(results[1].error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(results[2].error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(results[2].payload["error"], "not executed: stopped by user");
        assert_eq!(ctx.turns().last().and_then(|t| t.text()), Some(STOPPED_ANSWER));
    }

    #[tokio::test]
    async fn test_capability_timeout_is_seen_by_model() {
        let entered = Arc::new(Notify::new());
        let mut registry = ToolRegistry::new();
        registry.register_descriptor(blocking("block", entered)).unwrap();
        let executor = ToolExecutor::new(registry, 30).with_override("block", Duration::from_millis(50));
        let llm = Arc::new(MockLlmClient::scripted([
            r#"{"tool": "block", "args": {}, "id": "t1"}"#,
            "它没有响应",
        ]));
        let d = dispatcher_for(llm.clone(), executor, 6);
        let mut ctx = ConversationContext::new();

        let outcome = d
            .run(&mut ctx, Instruction::user("try"), &DispatchSession::new(CancellationToken::new()))
            .await;
        assert_eq!(outcome.status, DispatchStatus::Answered);
        assert_eq!(outcome.answer, "它没有响应");

        let results = results(&ctx);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error_kind, Some(ErrorKind::Timeout));
        let second = &llm.requests()[1];
        assert!(second
            .iter()
            .any(|m| m.content.starts_with("Tool result [t1] block failed (Timeout)")));
    }

    #[tokio::test]
    async fn test_empty_reply_is_retried() {
        let llm = Arc::new(MockLlmClient::scripted(["", "真正的答案"]));
        let d = dispatcher(llm.clone(), 6);
        let mut ctx = ConversationContext::new();
        let outcome = d
            .run(&mut ctx, Instruction::user("hi"), &DispatchSession::new(CancellationToken::new()))
            .await;
        assert_eq!(outcome.status, DispatchStatus::Answered);
        assert_eq!(outcome.answer, "真正的答案");
        assert_eq!(llm.request_count(), 2);
    }

    #[tokio::test]
    async fn test_persistent_empty_reply_is_protocol_error() {
        let llm = Arc::new(MockLlmClient::repeating("   "));
        let d = dispatcher(llm, 6);
        let mut ctx = ConversationContext::new();
        let outcome = d
            .run(&mut ctx, Instruction::user("hi"), &DispatchSession::new(CancellationToken::new()))
            .await;
        assert_eq!(outcome.status, DispatchStatus::ModelProtocolError);
        assert_ne!(outcome.answer, "");
    }
}
