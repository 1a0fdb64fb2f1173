//! 调度器跨重启行为：宽限期、错过批次幂等、增删查往返、损坏存储恢复

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use lumen::core::{spawn_runtime, InputGuard, RecoveryEngine, RuntimeOptions};
use lumen::dispatch::{Dispatcher, Planner};
use lumen::llm::MockLlmClient;
use lumen::memory::{TurnContent, TurnOrigin};
use lumen::scheduler::{
    ActionSink, EntryStatus, JsonFileStore, ManualClock, PersistentScheduler, ScheduleStore,
    ScheduledAction, SchedulerConfig, SchedulerError, SqliteStore,
};
use lumen::tools::{EchoTool, ToolExecutor, ToolRegistry};
use serde_json::json;
use tempfile::TempDir;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 3, 1, 9, 0, 0).unwrap()
}

fn json_store(dir: &TempDir) -> Box<dyn ScheduleStore> {
    Box::new(JsonFileStore::new(dir.path().join("schedule.json")))
}

fn sqlite_store(dir: &TempDir) -> Box<dyn ScheduleStore> {
    Box::new(SqliteStore::open(dir.path().join("schedule.db")).unwrap())
}

fn open(store: Box<dyn ScheduleStore>, clock: &Arc<ManualClock>) -> Arc<PersistentScheduler> {
    let cfg = SchedulerConfig {
        grace_window: Duration::from_secs(300),
        max_sleep: Duration::from_secs(60),
    };
    Arc::new(PersistentScheduler::open(store, clock.clone(), cfg).unwrap())
}

/// 真实运行时作为投递口：Mock 模型按脚本回复
fn runtime_sink(replies: &[&str]) -> (lumen::core::AgentHandle, Arc<dyn ActionSink>) {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool).unwrap();
    let dispatcher = Dispatcher::new(
        Planner::new(Arc::new(MockLlmClient::scripted(replies.to_vec())), "test"),
        Arc::new(ToolExecutor::new(registry, 5)),
        RecoveryEngine::default(),
        6,
    );
    let (handle, _events, _task) =
        spawn_runtime(dispatcher, Arc::new(InputGuard::new()), RuntimeOptions::default());
    let sink: Arc<dyn ActionSink> = Arc::new(handle.clone());
    (handle, sink)
}

#[tokio::test]
async fn restart_within_grace_fires_and_completes() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let id = {
        let scheduler = open(json_store(&dir), &clock);
        scheduler
            .schedule(t0() + chrono::Duration::seconds(60), ScheduledAction::notify("喝水"))
            .unwrap()
            .id
    };

    // 进程在触发时间前退出，到期后 2 分钟重启（在 300 秒宽限期内）
    clock.advance(chrono::Duration::seconds(180));
    let scheduler = open(json_store(&dir), &clock);
    assert!(scheduler.missed_at_startup().is_empty());
    assert_eq!(scheduler.get(id).unwrap().status, EntryStatus::Pending);

    let (handle, sink) = runtime_sink(&["别忘了喝水"]);
    for task in scheduler.fire_due(&sink) {
        task.await.unwrap();
    }

    let entry = scheduler.get(id).unwrap();
    assert_eq!(entry.status, EntryStatus::Completed);
    assert!(entry.outcome.unwrap().contains("别忘了喝水"));

    let history = handle.history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].origin, TurnOrigin::Scheduler);
    assert!(history[0].text().unwrap().contains("喝水"));
    assert_eq!(history[1].text(), Some("别忘了喝水"));

    // 完成状态已落盘
    let reopened = open(json_store(&dir), &clock);
    assert_eq!(reopened.get(id).unwrap().status, EntryStatus::Completed);
}

#[tokio::test]
async fn restart_within_grace_runs_invoke_template() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let id = open(sqlite_store(&dir), &clock)
        .schedule(
            t0() + chrono::Duration::seconds(30),
            ScheduledAction::Invoke {
                capability: "echo".into(),
                arguments: json!({"text": "站会开始"}),
                note: Some("站会".into()),
            },
        )
        .unwrap()
        .id;

    clock.advance(chrono::Duration::seconds(60));
    let scheduler = open(sqlite_store(&dir), &clock);
    let (handle, sink) = runtime_sink(&["已执行：站会开始"]);
    for task in scheduler.fire_due(&sink) {
        task.await.unwrap();
    }

    assert_eq!(scheduler.get(id).unwrap().status, EntryStatus::Completed);
    let history = handle.history().await.unwrap();
    let result = history
        .iter()
        .find_map(|t| match &t.content {
            TurnContent::ToolResult { result } => Some(result.clone()),
            _ => None,
        })
        .unwrap();
    assert!(result.success);
    assert_eq!(result.capability, "echo");
    assert_eq!(result.payload, json!("站会开始"));
}

#[tokio::test]
async fn restart_beyond_grace_marks_missed_once() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let id = open(json_store(&dir), &clock)
        .schedule(t0() + chrono::Duration::seconds(60), ScheduledAction::notify("交报告"))
        .unwrap()
        .id;

    // 到期后 1 小时才重启
    clock.advance(chrono::Duration::seconds(3600));
    let first = open(json_store(&dir), &clock);
    assert_eq!(first.missed_at_startup().len(), 1);
    assert_eq!(first.missed_at_startup()[0].id, id);
    let missed = first.get(id).unwrap();
    assert_eq!(missed.status, EntryStatus::Missed);
    drop(first);

    // 之后的重启不再触发也不再报告，条目保持原样
    for _ in 0..3 {
        clock.advance(chrono::Duration::seconds(600));
        let again = open(json_store(&dir), &clock);
        assert!(again.missed_at_startup().is_empty());
        assert_eq!(again.get(id).unwrap(), missed);

        let (_handle, sink) = runtime_sink(&[]);
        assert!(again.fire_due(&sink).is_empty());
    }
}

#[test]
fn schedule_list_cancel_round_trip_survives_restart() {
    for backend in ["json", "sqlite"] {
        let dir = TempDir::new().unwrap();
        let store = |dir: &TempDir| match backend {
            "json" => json_store(dir),
            _ => sqlite_store(dir),
        };
        let clock = Arc::new(ManualClock::new(t0()));

        let scheduler = open(store(&dir), &clock);
        let keep = scheduler
            .schedule(t0() + chrono::Duration::hours(1), ScheduledAction::notify("a"))
            .unwrap();
        let drop_me = scheduler
            .schedule(t0() + chrono::Duration::hours(2), ScheduledAction::notify("b"))
            .unwrap();
        let pending = scheduler.list(Some(EntryStatus::Pending));
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().any(|e| e.trigger_time == t0() + chrono::Duration::hours(1)
            && e.action == ScheduledAction::notify("a")));

        let cancelled = scheduler.cancel(drop_me.id).unwrap();
        assert_eq!(cancelled.status, EntryStatus::Cancelled);
        assert!(scheduler
            .list(Some(EntryStatus::Pending))
            .iter()
            .all(|e| e.id != drop_me.id));
        assert!(matches!(
            scheduler.cancel(drop_me.id),
            Err(SchedulerError::NotFound(_))
        ));
        drop(scheduler);

        let reopened = open(store(&dir), &clock);
        let all = reopened.list(None);
        assert_eq!(all.len(), 2, "backend {backend}");
        assert_eq!(all[0].id, keep.id);
        assert_eq!(all[0].status, EntryStatus::Pending);
        assert_eq!(all[1].status, EntryStatus::Cancelled);
        assert_eq!(reopened.list(Some(EntryStatus::Cancelled)).len(), 1);
    }
}

#[test]
fn corrupt_json_store_is_quarantined_and_scheduler_starts_empty() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("schedule.json"), "{ not valid json").unwrap();
    let clock = Arc::new(ManualClock::new(t0()));

    let scheduler = open(json_store(&dir), &clock);
    assert!(scheduler.list(None).is_empty());

    let quarantined: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("schedule.json.corrupt-"))
        .collect();
    assert_eq!(quarantined.len(), 1);

    // 新条目写入新的存储文件，重启可读回
    let entry = scheduler
        .schedule(t0() + chrono::Duration::minutes(5), ScheduledAction::notify("重新开始"))
        .unwrap();
    drop(scheduler);
    let reopened = open(json_store(&dir), &clock);
    assert_eq!(reopened.get(entry.id).unwrap().status, EntryStatus::Pending);
}

fn quarantined_names(dir: &TempDir, prefix: &str) -> Vec<String> {
    std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(prefix))
        .collect()
}

#[test]
fn non_utf8_json_store_does_not_block_startup() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("schedule.json"), [0xffu8, 0xfe, 0x00, 0x7b]).unwrap();
    let clock = Arc::new(ManualClock::new(t0()));

    let scheduler = open(json_store(&dir), &clock);
    assert!(scheduler.list(None).is_empty());
    assert_eq!(quarantined_names(&dir, "schedule.json.corrupt-").len(), 1);

    scheduler
        .schedule(t0() + chrono::Duration::minutes(1), ScheduledAction::notify("ok"))
        .unwrap();
    assert_eq!(open(json_store(&dir), &clock).list(None).len(), 1);
}

#[test]
fn unreadable_store_path_is_moved_aside() {
    let dir = TempDir::new().unwrap();
    // 读目录会得到 I/O 错误而不是解析错误
    std::fs::create_dir(dir.path().join("schedule.json")).unwrap();
    let clock = Arc::new(ManualClock::new(t0()));

    let scheduler = open(json_store(&dir), &clock);
    assert!(scheduler.list(None).is_empty());
    assert_eq!(quarantined_names(&dir, "schedule.json.corrupt-").len(), 1);

    let entry = scheduler
        .schedule(t0() + chrono::Duration::minutes(1), ScheduledAction::notify("ok"))
        .unwrap();
    assert_eq!(
        open(json_store(&dir), &clock).get(entry.id).unwrap().status,
        EntryStatus::Pending
    );
}

#[test]
fn sqlite_row_with_bad_timestamp_is_skipped_at_startup() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(t0()));
    let keep = open(sqlite_store(&dir), &clock)
        .schedule(t0() + chrono::Duration::minutes(10), ScheduledAction::notify("保留"))
        .unwrap();

    let conn = rusqlite::Connection::open(dir.path().join("schedule.db")).unwrap();
    conn.execute(
        "INSERT INTO schedule_entries
         (id, trigger_time, action, status, created_at, updated_at, outcome)
         VALUES (?1, 'garbage', '{\"kind\":\"notify\",\"message\":\"坏行\"}', 'pending', ?2, ?2, NULL)",
        rusqlite::params![uuid::Uuid::new_v4().to_string(), t0().to_rfc3339()],
    )
    .unwrap();
    drop(conn);

    let scheduler = open(sqlite_store(&dir), &clock);
    let all = scheduler.list(None);
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, keep.id);
}
