//! 能力注册表
//!
//! 所有能力实现 Capability trait（name / description / parameters / invoke），注册时固化为
//! CapabilityDescriptor（Schema 之后不可变），由 ToolRegistry 按名查找与调用。
//! invoke 永远返回 ToolResult：未知能力、参数不合法、处理函数出错或 panic 都在这里就地转换，
//! 单个能力失败不会中断分派循环。

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::ErrorKind;
use crate::tools::{ParameterSchema, ResourcePool};

/// 处理函数返回的错误；未指定 kind 时注册表按 CapabilityFailure 处理
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct CapabilityError {
    pub message: String,
    pub kind: Option<ErrorKind>,
}

impl CapabilityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    /// 指定写进 ToolResult 的错误分类（如 InvalidTrigger、NotFound）
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn error_kind(&self) -> ErrorKind {
        self.kind.unwrap_or(ErrorKind::CapabilityFailure)
    }
}

impl From<String> for CapabilityError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// 注册表自身的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Duplicate capability: {0}")]
    DuplicateCapability(String),
    #[error("Capability not found: {0}")]
    NotFound(String),
}

/// 能力 trait：名称、描述（供模型理解）、参数 Schema、占用的资源、异步执行
#[async_trait]
pub trait Capability: Send + Sync {
    /// 能力名称（调用格式中的 "tool" 字段）
    fn name(&self) -> &str;

    /// 能力描述（供模型理解功能）
    fn description(&self) -> &str;

    /// 参数 Schema；默认无参数
    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new()
    }

    /// 执行期间需要独占的资源名（如 filesystem）；None 表示不占用
    fn resource(&self) -> Option<&str> {
        None
    }

    /// 执行能力；args 已通过 Schema 校验
    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, CapabilityError>;
}

type BoxedHandler = Box<
    dyn Fn(Map<String, Value>) -> futures_util::future::BoxFuture<'static, Result<Value, CapabilityError>>
        + Send
        + Sync,
>;

/// 闭包形式的能力（测试与轻量技能用）
struct FnCapability {
    name: String,
    description: String,
    handler: BoxedHandler,
}

#[async_trait]
impl Capability for FnCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, CapabilityError> {
        (self.handler)(args).await
    }
}

/// 已注册的能力：名称唯一，Schema 注册后不可变
#[derive(Clone)]
pub struct CapabilityDescriptor {
    name: String,
    description: String,
    schema: Arc<ParameterSchema>,
    resource: Option<String>,
    handler: Arc<dyn Capability>,
}

impl std::fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("name", &self.name)
            .field("resource", &self.resource)
            .finish()
    }
}

impl CapabilityDescriptor {
    pub fn from_capability(capability: impl Capability + 'static) -> Self {
        Self {
            name: capability.name().to_string(),
            description: capability.description().to_string(),
            schema: Arc::new(capability.parameters()),
            resource: capability.resource().map(String::from),
            handler: Arc::new(capability),
        }
    }

    /// 由闭包构造能力
    pub fn from_fn<F, Fut>(name: &str, description: &str, schema: ParameterSchema, f: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CapabilityError>> + Send + 'static,
    {
        let handler: BoxedHandler = Box::new(move |args| Box::pin(f(args)));
        Self {
            name: name.to_string(),
            description: description.to_string(),
            schema: Arc::new(schema),
            resource: None,
            handler: Arc::new(FnCapability {
                name: name.to_string(),
                description: description.to_string(),
                handler,
            }),
        }
    }

    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// 广播给模型的形式：{"name", "description", "parameters"}
    pub fn advertised(&self) -> Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.schema.to_json_schema(),
        })
    }
}

/// 模型请求的一次能力调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRequest {
    pub invocation_id: String,
    pub capability: String,
    pub arguments: Value,
}

impl ToolInvocationRequest {
    pub fn new(capability: impl Into<String>, arguments: Value) -> Self {
        Self {
            invocation_id: new_invocation_id(),
            capability: capability.into(),
            arguments,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.invocation_id = id.into();
        self
    }
}

/// 生成调用 ID（模型未提供时使用）
pub fn new_invocation_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

/// 一次调用的结果，通过 invocation_id 与请求对应
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub invocation_id: String,
    pub capability: String,
    pub success: bool,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ToolResult {
    pub fn success(request: &ToolInvocationRequest, payload: Value) -> Self {
        Self {
            invocation_id: request.invocation_id.clone(),
            capability: request.capability.clone(),
            success: true,
            payload,
            error_kind: None,
        }
    }

    pub fn failure(request: &ToolInvocationRequest, kind: ErrorKind, detail: Value) -> Self {
        Self {
            invocation_id: request.invocation_id.clone(),
            capability: request.capability.clone(),
            success: false,
            payload: detail,
            error_kind: Some(kind),
        }
    }

    /// 写回模型上下文时的文本形式
    pub fn render(&self) -> String {
        let payload = match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match self.error_kind {
            None => format!("[{}] {} ok: {}", self.invocation_id, self.capability, payload),
            Some(kind) => format!(
                "[{}] {} failed ({}): {}",
                self.invocation_id, self.capability, kind, payload
            ),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 能力注册表：按名称存储 CapabilityDescriptor，并持有资源池
#[derive(Default)]
pub struct ToolRegistry {
    capabilities: HashMap<String, CapabilityDescriptor>,
    resources: ResourcePool,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resources(resources: ResourcePool) -> Self {
        Self {
            capabilities: HashMap::new(),
            resources,
        }
    }

    pub fn register(&mut self, capability: impl Capability + 'static) -> Result<(), RegistryError> {
        self.register_descriptor(CapabilityDescriptor::from_capability(capability))
    }

    pub fn register_descriptor(&mut self, descriptor: CapabilityDescriptor) -> Result<(), RegistryError> {
        if self.capabilities.contains_key(descriptor.name()) {
            return Err(RegistryError::DuplicateCapability(descriptor.name().to_string()));
        }
        tracing::debug!(capability = %descriptor.name(), "capability registered");
        self.capabilities
            .insert(descriptor.name().to_string(), descriptor);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<&CapabilityDescriptor, RegistryError> {
        self.capabilities
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// 全部能力，按名称排序（保证每轮广播给模型的内容稳定）
    pub fn list_schemas(&self) -> Vec<CapabilityDescriptor> {
        let mut all: Vec<CapabilityDescriptor> = self.capabilities.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn names(&self) -> Vec<String> {
        self.list_schemas().into_iter().map(|d| d.name).collect()
    }

    pub fn resources(&self) -> &ResourcePool {
        &self.resources
    }

    /// 动态生成能力 schema JSON（与实际注册的能力一致）
    pub fn to_schema_json(&self) -> String {
        let all: Vec<Value> = self.list_schemas().iter().map(|d| d.advertised()).collect();
        serde_json::to_string_pretty(&all).unwrap_or_else(|_| "[]".to_string())
    }

    /// 校验并执行一次调用；任何失败都转为 success=false 的 ToolResult
    pub async fn invoke(&self, request: &ToolInvocationRequest) -> ToolResult {
        let Some(descriptor) = self.capabilities.get(&request.capability) else {
            return ToolResult::failure(
                request,
                ErrorKind::UnknownCapability,
                serde_json::json!({
                    "error": format!("unknown capability '{}'", request.capability),
                    "available": self.names(),
                }),
            );
        };

        let args = match descriptor.schema.validate(&request.arguments) {
            Ok(args) => args,
            Err(violations) => {
                let fields: Vec<String> = violations.iter().map(|v| v.to_string()).collect();
                return ToolResult::failure(
                    request,
                    ErrorKind::InvalidArguments,
                    serde_json::json!({
                        "error": "invalid arguments",
                        "violations": fields,
                    }),
                );
            }
        };

        // 许可绑定在本作用域：正常返回、出错、panic 或外层超时丢弃 future 时都会释放
        let _permit = match descriptor.resource() {
            Some(resource) => match self.resources.acquire(resource).await {
                Some(permit) => Some(permit),
                None => {
                    return ToolResult::failure(
                        request,
                        ErrorKind::CapabilityFailure,
                        serde_json::json!({ "error": format!("resource '{resource}' unavailable") }),
                    )
                }
            },
            None => None,
        };

        let handler = descriptor.handler.clone();
        match AssertUnwindSafe(handler.invoke(args)).catch_unwind().await {
            Ok(Ok(payload)) => ToolResult::success(request, payload),
            Ok(Err(e)) => ToolResult::failure(
                request,
                e.error_kind(),
                serde_json::json!({ "error": e.to_string() }),
            ),
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                tracing::error!(capability = %request.capability, panic = %msg, "capability panicked");
                ToolResult::failure(
                    request,
                    ErrorKind::CapabilityFailure,
                    serde_json::json!({ "error": format!("capability panicked: {msg}") }),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ParamKind;
    use serde_json::json;

    async fn buggy_handler(_args: Map<String, Value>) -> Result<Value, CapabilityError> {
        panic!("handler bug")
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register_descriptor(CapabilityDescriptor::from_fn(
                "greet",
                "Greet someone",
                ParameterSchema::new().required("name", ParamKind::String, "who"),
                |args| async move {
                    let name = args.get("name").and_then(|v| v.as_str()).unwrap_or_default();
                    Ok(json!(format!("hello {name}")))
                },
            ))
            .unwrap();
        registry
            .register_descriptor(CapabilityDescriptor::from_fn(
                "explode",
                "Always fails",
                ParameterSchema::new(),
                |_| async { Err(CapabilityError::new("disk on fire")) },
            ))
            .unwrap();
        registry
            .register_descriptor(CapabilityDescriptor::from_fn(
                "lookup",
                "Fails with a classified error",
                ParameterSchema::new(),
                |_| async { Err(CapabilityError::new("no such record").with_kind(ErrorKind::NotFound)) },
            ))
            .unwrap();
        registry
            .register_descriptor(CapabilityDescriptor::from_fn(
                "panic",
                "Panics",
                ParameterSchema::new(),
                buggy_handler,
            ))
            .unwrap();
        registry
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = registry();
        let err = registry
            .register_descriptor(CapabilityDescriptor::from_fn(
                "greet",
                "again",
                ParameterSchema::new(),
                |_| async { Ok(Value::Null) },
            ))
            .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateCapability("greet".into()));
    }

    #[test]
    fn test_resolve_and_list_sorted() {
        let registry = registry();
        assert!(registry.resolve("greet").is_ok());
        assert_eq!(
            registry.resolve("nope").unwrap_err(),
            RegistryError::NotFound("nope".into())
        );
        assert_eq!(registry.names(), vec!["explode", "greet", "lookup", "panic"]);
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let registry = registry();
        let req = ToolInvocationRequest::new("greet", json!({"name": "Ada"})).with_id("c1");
        let result = registry.invoke(&req).await;
        assert!(result.success);
        assert_eq!(result.invocation_id, "c1");
        assert_eq!(result.payload, json!("hello Ada"));
    }

    #[tokio::test]
    async fn test_unknown_capability_never_panics() {
        let registry = registry();
        for name in ["", "greet ", "GREET", "rm -rf", "set_reminder"] {
            let result = registry.invoke(&ToolInvocationRequest::new(name, json!({}))).await;
            assert!(!result.success);
            assert_eq!(result.error_kind, Some(ErrorKind::UnknownCapability));
        }
    }

    #[tokio::test]
    async fn test_invalid_arguments_enumerates_fields() {
        let registry = registry();
        let req = ToolInvocationRequest::new("greet", json!({"name": 3, "extra": true}));
        let result = registry.invoke(&req).await;
        assert_eq!(result.error_kind, Some(ErrorKind::InvalidArguments));
        let violations = result.payload["violations"].as_array().unwrap();
        assert_eq!(violations.len(), 2);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_become_capability_failure() {
        let registry = registry();
        let err = registry.invoke(&ToolInvocationRequest::new("explode", json!({}))).await;
        assert_eq!(err.error_kind, Some(ErrorKind::CapabilityFailure));
        assert!(err.payload["error"].as_str().unwrap().contains("disk on fire"));

        let panicked = registry.invoke(&ToolInvocationRequest::new("panic", json!({}))).await;
        assert_eq!(panicked.error_kind, Some(ErrorKind::CapabilityFailure));
        assert!(panicked.payload["error"].as_str().unwrap().contains("handler bug"));
    }

    #[tokio::test]
    async fn test_handler_error_kind_is_kept() {
        let registry = registry();
        let result = registry.invoke(&ToolInvocationRequest::new("lookup", json!({}))).await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::NotFound));
        assert_eq!(result.payload["error"], "no such record");
    }

    #[tokio::test]
    async fn test_resource_released_after_panic() {
        let mut registry = ToolRegistry::new();
        registry
            .register_descriptor(
                CapabilityDescriptor::from_fn("fs_panic", "panics", ParameterSchema::new(), buggy_handler)
                    .with_resource("filesystem"),
            )
            .unwrap();
        let _ = registry.invoke(&ToolInvocationRequest::new("fs_panic", json!({}))).await;
        assert_eq!(registry.resources().available("filesystem"), 1);
    }

    #[test]
    fn test_render_failure_mentions_kind() {
        let req = ToolInvocationRequest::new("greet", json!({})).with_id("x");
        let result = ToolResult::failure(&req, ErrorKind::Timeout, json!("too slow"));
        assert_eq!(result.render(), "[x] greet failed (Timeout): too slow");
    }
}
