//! 能力执行器
//!
//! 持有 ToolRegistry 与超时配置（全局默认 + 按能力覆盖），execute 在超时与取消令牌下调用
//! registry.invoke：超时转为 Timeout，用户 stop 转为 Cancelled；每次调用输出结构化审计日志（JSON）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::ErrorKind;
use crate::tools::{ToolInvocationRequest, ToolRegistry, ToolResult};

/// 能力执行器：对每次调用施加超时与取消
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    default_timeout: Duration,
    overrides: HashMap<String, Duration>,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self::with_timeout(registry, Duration::from_secs(timeout_secs))
    }

    pub fn with_timeout(registry: ToolRegistry, default_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(registry),
            default_timeout,
            overrides: HashMap::new(),
        }
    }

    /// 为单个能力设置独立超时
    pub fn with_override(mut self, capability: &str, limit: Duration) -> Self {
        self.overrides.insert(capability.to_string(), limit);
        self
    }

    pub fn timeout_for(&self, capability: &str) -> Duration {
        self.overrides
            .get(capability)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 执行一次调用；超时返回 Timeout，被 stop 打断返回 Cancelled；输出 JSON 审计日志
    pub async fn execute(
        &self,
        request: &ToolInvocationRequest,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let start = Instant::now();
        let limit = self.timeout_for(&request.capability);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => ToolResult::failure(
                request,
                ErrorKind::Cancelled,
                serde_json::json!({ "error": "stopped by user" }),
            ),
            r = timeout(limit, self.registry.invoke(request)) => match r {
                Ok(result) => result,
                Err(_) => ToolResult::failure(
                    request,
                    ErrorKind::Timeout,
                    serde_json::json!({
                        "error": format!("timed out after {} ms", limit.as_millis()),
                    }),
                ),
            },
        };

        let outcome = match result.error_kind {
            None => "ok",
            Some(kind) => kind.as_str(),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "capability": request.capability,
            "invocation_id": request.invocation_id,
            "ok": result.success,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&request.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "capability");

        result
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{CapabilityDescriptor, ParameterSchema};
    use serde_json::{json, Value};

    fn slow_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register_descriptor(CapabilityDescriptor::from_fn(
                "slow",
                "sleeps",
                ParameterSchema::new(),
                |_| async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Value::Null)
                },
            ))
            .unwrap();
        registry
            .register_descriptor(CapabilityDescriptor::from_fn(
                "fast",
                "returns",
                ParameterSchema::new(),
                |_| async { Ok(json!("done")) },
            ))
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_timeout_becomes_tool_result() {
        let executor = ToolExecutor::with_timeout(slow_registry(), Duration::from_secs(5))
            .with_override("slow", Duration::from_millis(20));
        let token = CancellationToken::new();
        let result = executor
            .execute(&ToolInvocationRequest::new("slow", json!({})), &token)
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));

        let ok = executor
            .execute(&ToolInvocationRequest::new("fast", json!({})), &token)
            .await;
        assert!(ok.success);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocking_invocation() {
        let executor = ToolExecutor::new(slow_registry(), 60);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let result = executor
            .execute(&ToolInvocationRequest::new("slow", json!({})), &token)
            .await;
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
    }

    #[test]
    fn test_timeout_override_lookup() {
        let executor = ToolExecutor::new(ToolRegistry::new(), 30)
            .with_override("shell", Duration::from_secs(5));
        assert_eq!(executor.timeout_for("shell"), Duration::from_secs(5));
        assert_eq!(executor.timeout_for("echo"), Duration::from_secs(30));
    }
}
