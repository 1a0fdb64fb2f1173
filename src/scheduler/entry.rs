//! 调度条目：触发时间 + 动作 + 状态机 pending -> completed | missed | cancelled

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dispatch::Instruction;
use crate::tools::ToolInvocationRequest;

/// 到期时要做的事
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduledAction {
    /// 让模型把提醒转告用户
    Notify { message: String },
    /// 到期时先执行一次调用模板，再让模型汇报结果
    Invoke {
        capability: String,
        arguments: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
}

impl ScheduledAction {
    pub fn notify(message: impl Into<String>) -> Self {
        ScheduledAction::Notify {
            message: message.into(),
        }
    }

    /// 列表展示用的一行摘要
    pub fn summary(&self) -> String {
        match self {
            ScheduledAction::Notify { message } => message.clone(),
            ScheduledAction::Invoke {
                capability, note, ..
            } => match note {
                Some(note) => format!("{note} (-> {capability})"),
                None => format!("-> {capability}"),
            },
        }
    }
}

/// 条目状态；除 Pending 外都是终态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Completed,
    Missed,
    Cancelled,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EntryStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Completed => "completed",
            EntryStatus::Missed => "missed",
            EntryStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(EntryStatus::Pending),
            "completed" => Some(EntryStatus::Completed),
            "missed" => Some(EntryStatus::Missed),
            "cancelled" | "canceled" => Some(EntryStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一条持久化的调度记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: Uuid,
    pub trigger_time: DateTime<Utc>,
    pub action: ScheduledAction,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 终态说明（完成时的答复摘要、错过的原因等）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
}

impl ScheduleEntry {
    pub fn new(trigger_time: DateTime<Utc>, action: ScheduledAction, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger_time,
            action,
            status: EntryStatus::Pending,
            created_at: now,
            updated_at: now,
            outcome: None,
        }
    }

    /// 进入终态（只在 Pending 上调用）
    pub(crate) fn transition(&mut self, status: EntryStatus, outcome: impl Into<String>, now: DateTime<Utc>) {
        self.status = status;
        self.outcome = Some(outcome.into());
        self.updated_at = now;
    }

    /// 触发时间的本地时间表示
    pub fn local_trigger(&self) -> String {
        self.trigger_time
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    /// 到期时送入分派循环的合成指令
    pub fn to_instruction(&self) -> Instruction {
        match &self.action {
            ScheduledAction::Notify { message } => Instruction::Scheduled {
                text: format!(
                    "提醒时间到（计划于 {}）：{}。请把这条提醒转告用户。",
                    self.local_trigger(),
                    message
                ),
                invoke: None,
            },
            ScheduledAction::Invoke {
                capability,
                arguments,
                note,
            } => Instruction::Scheduled {
                text: format!(
                    "定时任务到期（计划于 {}）：执行 {}{}。请向用户汇报执行结果。",
                    self.local_trigger(),
                    capability,
                    note.as_deref().map(|n| format!("，备注：{n}")).unwrap_or_default()
                ),
                invoke: Some(
                    ToolInvocationRequest::new(capability.clone(), arguments.clone())
                        .with_id(format!("sched_{}", self.id.simple())),
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_invoke_instruction_carries_template() {
        let now = Utc::now();
        let entry = ScheduleEntry::new(
            now,
            ScheduledAction::Invoke {
                capability: "echo".into(),
                arguments: json!({"text": "hi"}),
                note: Some("测试".into()),
            },
            now,
        );
        let Instruction::Scheduled { text, invoke } = entry.to_instruction() else {
            panic!("expected scheduled instruction");
        };
        assert!(text.contains("echo"));
        let req = invoke.unwrap();
        assert_eq!(req.capability, "echo");
        assert_eq!(req.invocation_id, format!("sched_{}", entry.id.simple()));
    }

    #[test]
    fn test_status_parse_and_terminal() {
        assert_eq!(EntryStatus::parse("Pending"), Some(EntryStatus::Pending));
        assert_eq!(EntryStatus::parse("canceled"), Some(EntryStatus::Cancelled));
        assert_eq!(EntryStatus::parse("bogus"), None);
        assert!(!EntryStatus::Pending.is_terminal());
        assert!(EntryStatus::Missed.is_terminal());
    }

    #[test]
    fn test_entry_json_shape() {
        let now = Utc::now();
        let entry = ScheduleEntry::new(now, ScheduledAction::notify("喝水"), now);
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["status"], "pending");
        assert_eq!(value["action"]["kind"], "notify");
        let back: ScheduleEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, entry);
    }
}
