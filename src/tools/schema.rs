//! 能力参数 Schema 与调用格式 Schema
//!
//! ParameterSchema 描述一个能力接受的参数（名称、类型、是否必填），注册后不可变；
//! validate 一次性列出所有不合法字段，而不是遇到第一个就返回。
//! tool_call_schema_json 用 schemars 生成「合法调用」的 JSON 结构，拼入 system prompt。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde::Serialize;
use serde_json::{Map, Value};

/// 参数类型（与 JSON Schema 的 type 一一对应）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            ParamKind::Number => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Object => value.is_object(),
            ParamKind::Array => value.is_array(),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Object => "object",
            ParamKind::Array => "array",
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// 单个参数的描述
#[derive(Clone, Debug, Serialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub description: String,
}

/// 参数校验失败的具体原因
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum Violation {
    Missing { field: String },
    WrongType { field: String, expected: String, found: String },
    Unexpected { field: String },
    /// 参数整体不是 JSON 对象
    NotAnObject { found: String },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::Missing { field } => write!(f, "{field}: required field is missing"),
            Violation::WrongType { field, expected, found } => {
                write!(f, "{field}: expected {expected}, found {found}")
            }
            Violation::Unexpected { field } => write!(f, "{field}: unexpected field"),
            Violation::NotAnObject { found } => {
                write!(f, "arguments must be an object, found {found}")
            }
        }
    }
}

/// 能力参数 Schema（有序，生成的 JSON Schema 与声明顺序一致）
#[derive(Clone, Debug, Default, Serialize)]
pub struct ParameterSchema {
    params: Vec<ParamSpec>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: &str, kind: ParamKind, description: &str) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            kind,
            required: true,
            description: description.to_string(),
        });
        self
    }

    pub fn optional(mut self, name: &str, kind: ParamKind, description: &str) -> Self {
        self.params.push(ParamSpec {
            name: name.to_string(),
            kind,
            required: false,
            description: description.to_string(),
        });
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    /// 校验参数：null 视为空对象；返回规范化后的参数对象，或全部不合法字段
    pub fn validate(&self, args: &Value) -> Result<Map<String, Value>, Vec<Violation>> {
        let obj = match args {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(vec![Violation::NotAnObject {
                    found: json_type_name(other).to_string(),
                }])
            }
        };

        let mut violations = Vec::new();
        for spec in &self.params {
            match obj.get(&spec.name) {
                None | Some(Value::Null) if spec.required => violations.push(Violation::Missing {
                    field: spec.name.clone(),
                }),
                None | Some(Value::Null) => {}
                Some(v) if !spec.kind.matches(v) => violations.push(Violation::WrongType {
                    field: spec.name.clone(),
                    expected: spec.kind.as_str().to_string(),
                    found: json_type_name(v).to_string(),
                }),
                Some(_) => {}
            }
        }
        let mut unexpected: Vec<&String> = obj
            .keys()
            .filter(|k| !self.params.iter().any(|p| &p.name == *k))
            .collect();
        unexpected.sort();
        violations.extend(unexpected.into_iter().map(|k| Violation::Unexpected { field: k.clone() }));

        if violations.is_empty() {
            Ok(obj)
        } else {
            Err(violations)
        }
    }

    /// 生成 JSON Schema（object + properties + required），供模型理解参数格式
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        for p in &self.params {
            properties.insert(
                p.name.clone(),
                serde_json::json!({
                    "type": p.kind.as_str(),
                    "description": p.description,
                }),
            );
        }
        let required: Vec<&str> = self
            .params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}

/// 单次调用格式：{"tool": "...", "args": {...}, "id": "..."}（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 能力名，必须是已注册能力之一
    pub tool: String,
    /// 能力参数，需满足该能力的参数 Schema
    pub args: HashMap<String, serde_json::Value>,
    /// 可选的调用 ID，结果会携带同一 ID
    pub id: Option<String>,
}

/// 多个调用按顺序执行：{"tool_calls": [...]}（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallBatchFormat {
    /// 按给出的顺序依次执行
    pub tool_calls: Vec<ToolCallFormat>,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallBatchFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reminder_schema() -> ParameterSchema {
        ParameterSchema::new()
            .required("content", ParamKind::String, "what to remind")
            .required("target_time", ParamKind::String, "when")
            .optional("repeat", ParamKind::Integer, "times")
    }

    #[test]
    fn test_validate_accepts_well_formed_args() {
        let args = json!({"content": "drink water", "target_time": "2030-01-01 08:00:00"});
        let obj = reminder_schema().validate(&args).unwrap();
        assert_eq!(obj.len(), 2);
    }

    #[test]
    fn test_validate_enumerates_every_offending_field() {
        let args = json!({"target_time": 5, "repeat": "x", "colour": "red"});
        let violations = reminder_schema().validate(&args).unwrap_err();
        assert_eq!(violations.len(), 4);
        assert!(violations.contains(&Violation::Missing { field: "content".into() }));
        assert!(violations.contains(&Violation::WrongType {
            field: "target_time".into(),
            expected: "string".into(),
            found: "integer".into(),
        }));
        assert!(violations.contains(&Violation::Unexpected { field: "colour".into() }));
    }

    #[test]
    fn test_validate_null_is_empty_object() {
        let schema = ParameterSchema::new().optional("path", ParamKind::String, "dir");
        assert!(schema.validate(&Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_validate_rejects_non_object() {
        let violations = reminder_schema().validate(&json!([1, 2])).unwrap_err();
        assert_eq!(violations, vec![Violation::NotAnObject { found: "array".into() }]);
    }

    #[test]
    fn test_json_schema_lists_required() {
        let schema = reminder_schema().to_json_schema();
        assert_eq!(schema["required"], json!(["content", "target_time"]));
        assert_eq!(schema["properties"]["repeat"]["type"], "integer");
    }

    #[test]
    fn test_tool_call_schema_mentions_tool_calls() {
        let s = tool_call_schema_json();
        assert!(s.contains("tool_calls"));
        assert!(s.contains("args"));
    }
}
