//! Echo 能力（测试用）

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::tools::{Capability, CapabilityError, ParamKind, ParameterSchema};

/// Echo 能力：回显文本
pub struct EchoTool;

#[async_trait]
impl Capability for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (for testing)."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new().required("text", ParamKind::String, "message to echo")
    }

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, CapabilityError> {
        let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("(empty)");
        Ok(Value::String(text.to_string()))
    }
}
