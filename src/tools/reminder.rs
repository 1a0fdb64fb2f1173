//! 提醒能力：set_reminder / cancel_reminder / list_reminders
//!
//! 模型通过这三个能力操作持久化调度器。target_time 接受本地时间 `YYYY-MM-DD HH:MM:SS`
//! 或 RFC 3339；带 auto_action 时到期会直接执行该调用，否则只让模型转告提醒内容。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::core::ErrorKind;
use crate::scheduler::{
    EntryStatus, PersistentScheduler, ScheduleEntry, ScheduledAction, SchedulerError,
};
use crate::tools::{Capability, CapabilityError, ParamKind, ParameterSchema};

/// 本地时间格式
pub const LOCAL_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// 解析触发时间：本地 `YYYY-MM-DD HH:MM:SS` 或 RFC 3339
pub fn parse_target_time(input: &str) -> Result<DateTime<Utc>, CapabilityError> {
    let input = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(input, LOCAL_TIME_FORMAT).map_err(|e| {
        invalid(format!(
            "invalid target_time '{input}' (expected YYYY-MM-DD HH:MM:SS): {e}"
        ))
    })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| invalid(format!("target_time '{input}' does not exist locally")))
}

fn invalid(message: impl Into<String>) -> CapabilityError {
    CapabilityError::new(message).with_kind(ErrorKind::InvalidArguments)
}

/// 调度器的 InvalidTrigger / NotFound 原样带进 ToolResult
impl From<SchedulerError> for CapabilityError {
    fn from(e: SchedulerError) -> Self {
        let err = CapabilityError::new(e.to_string());
        match e.kind() {
            Some(kind) => err.with_kind(kind),
            None => err,
        }
    }
}

fn entry_view(entry: &ScheduleEntry) -> Value {
    json!({
        "id": entry.id.to_string(),
        "trigger_time": entry.local_trigger(),
        "status": entry.status.as_str(),
        "summary": entry.action.summary(),
        "outcome": entry.outcome,
    })
}

fn parse_auto_action(content: &str, raw: &Value) -> Result<ScheduledAction, CapabilityError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| invalid("auto_action must be an object"))?;
    let capability = obj
        .get("capability")
        .or_else(|| obj.get("tool_name"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("auto_action.capability is required"))?;
    let arguments = match obj.get("arguments") {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(v @ Value::Object(_)) => v.clone(),
        Some(_) => return Err(invalid("auto_action.arguments must be an object")),
    };
    Ok(ScheduledAction::Invoke {
        capability: capability.to_string(),
        arguments,
        note: Some(content.to_string()),
    })
}

/// 新建提醒
pub struct SetReminderTool {
    scheduler: Arc<PersistentScheduler>,
}

impl SetReminderTool {
    pub fn new(scheduler: Arc<PersistentScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Capability for SetReminderTool {
    fn name(&self) -> &str {
        "set_reminder"
    }

    fn description(&self) -> &str {
        "Schedule a reminder. target_time is local 'YYYY-MM-DD HH:MM:SS' (call current_time first for relative times). \
         Optional auto_action {capability, arguments} runs that capability when the reminder fires."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new()
            .required("content", ParamKind::String, "what to remind the user about")
            .required("target_time", ParamKind::String, "YYYY-MM-DD HH:MM:SS (local) or RFC 3339")
            .optional("auto_action", ParamKind::Object, "{capability, arguments} to run at trigger time")
    }

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, CapabilityError> {
        let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("").trim();
        if content.is_empty() {
            return Err(invalid("content must not be empty"));
        }
        let target = args.get("target_time").and_then(|v| v.as_str()).unwrap_or("");
        let trigger = parse_target_time(target)?;
        let action = match args.get("auto_action") {
            Some(raw) if !raw.is_null() => parse_auto_action(content, raw)?,
            _ => ScheduledAction::notify(content),
        };

        let entry = self.scheduler.schedule(trigger, action)?;
        tracing::info!(entry = %entry.id, trigger = %entry.trigger_time, "reminder set");
        Ok(entry_view(&entry))
    }
}

/// 取消提醒
pub struct CancelReminderTool {
    scheduler: Arc<PersistentScheduler>,
}

impl CancelReminderTool {
    pub fn new(scheduler: Arc<PersistentScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Capability for CancelReminderTool {
    fn name(&self) -> &str {
        "cancel_reminder"
    }

    fn description(&self) -> &str {
        "Cancel a pending reminder by id (see list_reminders)."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new().required("id", ParamKind::String, "reminder id")
    }

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, CapabilityError> {
        let raw = args.get("id").and_then(|v| v.as_str()).unwrap_or("");
        let id = Uuid::parse_str(raw.trim())
            .map_err(|_| invalid(format!("invalid reminder id '{raw}'")))?;
        let entry = self.scheduler.cancel(id)?;
        Ok(entry_view(&entry))
    }
}

/// 列出提醒
pub struct ListRemindersTool {
    scheduler: Arc<PersistentScheduler>,
}

impl ListRemindersTool {
    pub fn new(scheduler: Arc<PersistentScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl Capability for ListRemindersTool {
    fn name(&self) -> &str {
        "list_reminders"
    }

    fn description(&self) -> &str {
        "List reminders, optionally filtered by status (pending, completed, missed, cancelled)."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new().optional("status", ParamKind::String, "status filter, default all")
    }

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, CapabilityError> {
        let filter = match args.get("status").and_then(|v| v.as_str()) {
            None | Some("") | Some("all") => None,
            Some(s) => Some(
                EntryStatus::parse(s)
                    .ok_or_else(|| invalid(format!("unknown status '{s}'")))?,
            ),
        };
        let entries: Vec<Value> = self.scheduler.list(filter).iter().map(entry_view).collect();
        Ok(Value::Array(entries))
    }
}
