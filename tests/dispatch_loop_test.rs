//! 分派循环端到端：未知能力、批量调用顺序、执行周期上限

use std::sync::Arc;
use std::time::Duration;

use lumen::core::{ErrorKind, RecoveryEngine, RetryPolicy};
use lumen::dispatch::{DispatchSession, DispatchStatus, Dispatcher, Instruction, Planner};
use lumen::llm::{ChatRole, MockLlmClient};
use lumen::memory::{ConversationContext, Role, TurnContent};
use lumen::tools::{EchoTool, ToolExecutor, ToolRegistry};
use tokio_util::sync::CancellationToken;

fn dispatcher(llm: Arc<MockLlmClient>, max_turns: usize) -> Dispatcher {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool).unwrap();
    let recovery = RecoveryEngine::new(RetryPolicy {
        max_retries: 1,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(2),
    });
    Dispatcher::new(
        Planner::new(llm, "test"),
        Arc::new(ToolExecutor::new(registry, 5)),
        recovery,
        max_turns,
    )
}

fn session() -> DispatchSession<'static> {
    DispatchSession::new(CancellationToken::new())
}

#[tokio::test]
async fn unknown_capability_becomes_result_and_loop_continues() {
    let llm = Arc::new(MockLlmClient::scripted([
        r#"{"tool": "launch_rocket", "args": {}, "id": "u1"}"#,
        "没有这个能力",
    ]));
    let d = dispatcher(llm.clone(), 6);
    let mut ctx = ConversationContext::new();

    let outcome = d.run(&mut ctx, Instruction::user("发射"), &session()).await;
    assert_eq!(outcome.status, DispatchStatus::Answered);
    assert_eq!(outcome.answer, "没有这个能力");

    let result = ctx
        .turns()
        .iter()
        .find_map(|t| match &t.content {
            TurnContent::ToolResult { result } => Some(result.clone()),
            _ => None,
        })
        .expect("tool result recorded");
    assert!(!result.success);
    assert_eq!(result.error_kind, Some(ErrorKind::UnknownCapability));
    assert_eq!(result.invocation_id, "u1");

    let second = &llm.requests()[1];
    assert!(second
        .iter()
        .any(|m| m.content.starts_with("Tool result [u1] launch_rocket failed (UnknownCapability)")));
}

#[tokio::test]
async fn batch_results_follow_request_order_before_next_model_call() {
    let llm = Arc::new(MockLlmClient::scripted([
        r#"{"tool_calls": [
            {"tool": "echo", "args": {"text": "one"}, "id": "a"},
            {"tool": "echo", "args": {"text": "two"}, "id": "b"},
            {"tool": "echo", "args": {"text": "three"}, "id": "c"}
        ]}"#,
        "done",
    ]));
    let d = dispatcher(llm.clone(), 6);
    let mut ctx = ConversationContext::new();

    let outcome = d.run(&mut ctx, Instruction::user("count"), &session()).await;
    assert_eq!(outcome.status, DispatchStatus::Answered);
    assert_eq!(outcome.cycles, 1);

    let ids: Vec<String> = ctx
        .turns()
        .iter()
        .filter_map(|t| match &t.content {
            TurnContent::ToolResult { result } => Some(result.invocation_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(ids, ["a", "b", "c"]);

    // 第二次模型请求的末尾恰好是三条结果，顺序与请求一致
    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    let tail: Vec<&str> = requests[1]
        .iter()
        .rev()
        .take(3)
        .rev()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(
        tail,
        [
            "Tool result [a] echo ok: one",
            "Tool result [b] echo ok: two",
            "Tool result [c] echo ok: three"
        ]
    );
    assert!(requests[1][requests[1].len() - 4].role == ChatRole::Assistant);
}

#[tokio::test]
async fn always_invoking_model_exhausts_budget() {
    let llm = Arc::new(MockLlmClient::repeating(
        r#"{"tool": "echo", "args": {"text": "again"}}"#,
    ));
    let d = dispatcher(llm.clone(), 3);
    let mut ctx = ConversationContext::new();

    let outcome = d.run(&mut ctx, Instruction::user("loop forever"), &session()).await;
    assert_eq!(outcome.status, DispatchStatus::BudgetExhausted);
    assert_eq!(outcome.cycles, 3);
    assert_eq!(llm.request_count(), 4);

    let executed = ctx
        .turns()
        .iter()
        .filter(|t| t.role == Role::ToolResult)
        .count();
    assert_eq!(executed, 3);

    let last = ctx.turns().last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert_eq!(last.text(), Some(outcome.answer.as_str()));
}
