//! 持久化调度器
//!
//! 保存未来要执行的动作，启动时恢复并对账，到期时通过 ActionSink 把合成指令送入分派循环。
//!
//! - 启动：宽限期内的到期条目照常触发；超出宽限期的整批标记为 missed 并广播一次；
//! - 常驻：睡到最早的待触发时间或 max_sleep（取较小者），schedule / cancel 会立即唤醒重算；
//! - 触发与完成分两步：触发只登记 in-flight，不写盘；分派循环返回后才写 completed。
//!   进程在两步之间崩溃，条目在磁盘上仍是 pending，重启后会再次触发。

pub mod clock;
pub mod entry;
pub mod sqlite;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{EntryStatus, ScheduleEntry, ScheduledAction};
pub use sqlite::SqliteStore;
pub use store::{JsonFileStore, ScheduleStore, StoreError};

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::{AgentError, ErrorKind};
use crate::dispatch::{DispatchOutcome, Instruction};

/// 完成说明里保留的答复字符数
const OUTCOME_PREVIEW_CHARS: usize = 160;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid trigger: {trigger} is not after {now}")]
    InvalidTrigger {
        trigger: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    #[error("Schedule entry not found or already finished: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SchedulerError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SchedulerError::InvalidTrigger { .. } => Some(ErrorKind::InvalidTrigger),
            SchedulerError::NotFound(_) => Some(ErrorKind::NotFound),
            SchedulerError::Store(_) => None,
        }
    }
}

/// 调度器生命周期事件（广播给界面层）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Scheduled { entry: ScheduleEntry },
    Fired { id: Uuid },
    Completed { id: Uuid, outcome: String },
    /// 一批错过的条目（启动对账或常驻时超出宽限期）
    Missed { entries: Vec<ScheduleEntry> },
    Cancelled { id: Uuid },
}

/// 合成指令的投递口：由运行时句柄实现，排在命令队列里等当前循环结束
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn submit(&self, instruction: Instruction) -> Result<DispatchOutcome, AgentError>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 到期后仍允许补触发的时长
    pub grace_window: Duration,
    /// 两次检查之间的最长睡眠
    pub max_sleep: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            grace_window: Duration::from_secs(300),
            max_sleep: Duration::from_secs(60),
        }
    }
}

/// 持久化调度器；条目表与存储只归它所有
pub struct PersistentScheduler {
    store: Box<dyn ScheduleStore>,
    clock: Arc<dyn Clock>,
    cfg: SchedulerConfig,
    entries: Mutex<BTreeMap<Uuid, ScheduleEntry>>,
    in_flight: Mutex<HashSet<Uuid>>,
    startup_missed: Vec<ScheduleEntry>,
    wake: Notify,
    events: broadcast::Sender<SchedulerEvent>,
}

impl PersistentScheduler {
    /// 加载存储并做启动对账；存储读不出来时（损坏、编码错误、I/O 失败）记录错误、隔离文件并从空表开始
    pub fn open(
        store: Box<dyn ScheduleStore>,
        clock: Arc<dyn Clock>,
        cfg: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        let loaded = match store.load() {
            Ok(entries) => entries,
            Err(StoreError::Corrupt { reason, quarantined }) => {
                tracing::error!(
                    store = %store.describe(),
                    reason = %reason,
                    quarantined = %quarantined.display(),
                    "schedule store corrupt, starting empty"
                );
                Vec::new()
            }
            Err(e) => {
                tracing::error!(store = %store.describe(), error = %e, "schedule store unreadable");
                match store.reset() {
                    Ok(Some(quarantined)) => tracing::error!(
                        quarantined = %quarantined.display(),
                        "unreadable schedule store moved aside, starting empty"
                    ),
                    Ok(None) => tracing::warn!("schedule store starting empty"),
                    Err(reset_err) => tracing::error!(
                        error = %reset_err,
                        "could not move unreadable schedule store aside, starting empty"
                    ),
                }
                Vec::new()
            }
        };

        let (events, _) = broadcast::channel(64);
        let mut scheduler = Self {
            store,
            clock,
            cfg,
            entries: Mutex::new(loaded.into_iter().map(|e| (e.id, e)).collect()),
            in_flight: Mutex::new(HashSet::new()),
            startup_missed: Vec::new(),
            wake: Notify::new(),
            events,
        };

        let missed = scheduler.reconcile_missed()?;
        if !missed.is_empty() {
            tracing::warn!(count = missed.len(), "schedule entries missed while offline");
        }
        let pending = scheduler.list(Some(EntryStatus::Pending)).len();
        tracing::info!(
            store = %scheduler.store.describe(),
            pending,
            missed = missed.len(),
            "scheduler restored"
        );
        scheduler.startup_missed = missed;
        Ok(scheduler)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// 启动对账时被标记为 missed 的那一批
    pub fn missed_at_startup(&self) -> &[ScheduleEntry] {
        &self.startup_missed
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn grace(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.cfg.grace_window)
            .unwrap_or_else(|_| chrono::Duration::days(365))
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<Uuid, ScheduleEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<Uuid>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    /// 在已加锁的表上做终态转换并落盘；落盘失败时内存保持原状
    fn persist_transition(
        &self,
        entries: &mut BTreeMap<Uuid, ScheduleEntry>,
        id: Uuid,
        status: EntryStatus,
        outcome: String,
        now: DateTime<Utc>,
    ) -> Result<ScheduleEntry, SchedulerError> {
        let mut updated = entries
            .get(&id)
            .cloned()
            .ok_or(SchedulerError::NotFound(id))?;
        updated.transition(status, outcome, now);
        self.store.put(&updated)?;
        entries.insert(id, updated.clone());
        tracing::info!(entry = %id, status = %status, "schedule entry finished");
        Ok(updated)
    }

    /// 超出宽限期的 pending（且不在执行中）全部转为 missed，返回这一批
    fn reconcile_missed(&self) -> Result<Vec<ScheduleEntry>, SchedulerError> {
        let now = self.clock.now();
        let cutoff = now - self.grace();
        let in_flight = self.lock_in_flight().clone();
        let mut entries = self.lock_entries();
        let overdue: Vec<(Uuid, DateTime<Utc>)> = entries
            .values()
            .filter(|e| e.status == EntryStatus::Pending && e.trigger_time < cutoff)
            .filter(|e| !in_flight.contains(&e.id))
            .map(|e| (e.id, e.trigger_time))
            .collect();

        let mut missed = Vec::with_capacity(overdue.len());
        for (id, trigger) in overdue {
            let outcome = format!(
                "missed: due at {} but not fired within the grace window",
                trigger.to_rfc3339()
            );
            missed.push(self.persist_transition(&mut entries, id, EntryStatus::Missed, outcome, now)?);
        }
        drop(entries);

        if !missed.is_empty() {
            self.emit(SchedulerEvent::Missed {
                entries: missed.clone(),
            });
        }
        Ok(missed)
    }

    /// 新建条目；触发时间必须晚于当前时间。创建即落盘
    pub fn schedule(
        &self,
        trigger_time: DateTime<Utc>,
        action: ScheduledAction,
    ) -> Result<ScheduleEntry, SchedulerError> {
        let now = self.clock.now();
        if trigger_time <= now {
            return Err(SchedulerError::InvalidTrigger {
                trigger: trigger_time,
                now,
            });
        }
        let entry = ScheduleEntry::new(trigger_time, action, now);
        self.store.put(&entry)?;
        self.lock_entries().insert(entry.id, entry.clone());
        tracing::info!(entry = %entry.id, trigger = %entry.trigger_time, "schedule entry created");

        self.emit(SchedulerEvent::Scheduled {
            entry: entry.clone(),
        });
        self.wake.notify_one();
        Ok(entry)
    }

    /// 取消 pending 条目；不存在或已是终态返回 NotFound
    pub fn cancel(&self, id: Uuid) -> Result<ScheduleEntry, SchedulerError> {
        let now = self.clock.now();
        let mut entries = self.lock_entries();
        match entries.get(&id) {
            Some(e) if e.status == EntryStatus::Pending => {}
            _ => return Err(SchedulerError::NotFound(id)),
        }
        let cancelled = self.persist_transition(
            &mut entries,
            id,
            EntryStatus::Cancelled,
            "cancelled".to_string(),
            now,
        )?;
        drop(entries);

        self.emit(SchedulerEvent::Cancelled { id });
        self.wake.notify_one();
        Ok(cancelled)
    }

    /// 按状态过滤（None 为全部），按触发时间排序
    pub fn list(&self, filter: Option<EntryStatus>) -> Vec<ScheduleEntry> {
        let mut all: Vec<ScheduleEntry> = self
            .lock_entries()
            .values()
            .filter(|e| filter.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        all.sort_by_key(|e| (e.trigger_time, e.created_at));
        all
    }

    pub fn get(&self, id: Uuid) -> Option<ScheduleEntry> {
        self.lock_entries().get(&id).cloned()
    }

    /// 触发所有到期条目：超出宽限期的转 missed，其余登记 in-flight 后各自投递。
    /// 返回投递任务句柄，测试里可等待它们完成
    pub fn fire_due(self: &Arc<Self>, sink: &Arc<dyn ActionSink>) -> Vec<JoinHandle<()>> {
        if let Err(e) = self.reconcile_missed() {
            tracing::error!(error = %e, "failed to persist missed entries");
        }

        let now = self.clock.now();
        let due: Vec<ScheduleEntry> = {
            let entries = self.lock_entries();
            let mut in_flight = self.lock_in_flight();
            entries
                .values()
                .filter(|e| e.status == EntryStatus::Pending && e.trigger_time <= now)
                .filter(|e| in_flight.insert(e.id))
                .cloned()
                .collect()
        };

        due.into_iter()
            .map(|entry| {
                tracing::info!(entry = %entry.id, trigger = %entry.trigger_time, "schedule entry fired");
                self.emit(SchedulerEvent::Fired { id: entry.id });
                let this = Arc::clone(self);
                let sink = Arc::clone(sink);
                tokio::spawn(async move { this.deliver(entry, sink).await })
            })
            .collect()
    }

    async fn deliver(self: Arc<Self>, entry: ScheduleEntry, sink: Arc<dyn ActionSink>) {
        match sink.submit(entry.to_instruction()).await {
            Ok(outcome) => {
                // 终态写盘是同步 I/O（fsync / SQLite 事务），放到阻塞线程池
                let id = entry.id;
                let this = Arc::clone(&self);
                if let Err(e) =
                    tokio::task::spawn_blocking(move || this.mark_completed(id, &outcome)).await
                {
                    tracing::error!(entry = %id, error = %e, "completion task failed");
                    self.lock_in_flight().remove(&id);
                }
            }
            Err(e) => {
                // 保持 pending，下次唤醒再投递
                tracing::warn!(entry = %entry.id, error = %e, "scheduled submit failed, will retry");
                self.lock_in_flight().remove(&entry.id);
            }
        }
    }

    /// 分派循环报告完成后写 completed；期间被取消的条目保持 cancelled
    fn mark_completed(&self, id: Uuid, outcome: &DispatchOutcome) {
        let now = self.clock.now();
        let summary = format!("{}: {}", outcome.status.as_str(), preview(&outcome.answer));
        let mut entries = self.lock_entries();
        self.lock_in_flight().remove(&id);

        let still_pending = entries
            .get(&id)
            .map_or(false, |e| e.status == EntryStatus::Pending);
        if !still_pending {
            tracing::debug!(entry = %id, "entry left pending state while in flight, keeping it");
            return;
        }
        let result =
            self.persist_transition(&mut entries, id, EntryStatus::Completed, summary.clone(), now);
        drop(entries);
        match result {
            Ok(_) => self.emit(SchedulerEvent::Completed { id, outcome: summary }),
            Err(e) => tracing::error!(entry = %id, error = %e, "failed to persist completion"),
        }
    }

    /// 距下一个未来触发时间的睡眠时长，不超过 max_sleep
    fn next_delay(&self) -> Duration {
        let now = self.clock.now();
        let earliest = self
            .lock_entries()
            .values()
            .filter(|e| e.status == EntryStatus::Pending && e.trigger_time > now)
            .map(|e| e.trigger_time)
            .min();
        match earliest {
            Some(t) => (t - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.cfg.max_sleep),
            None => self.cfg.max_sleep,
        }
    }

    /// 唤醒常驻循环重新计算（时钟被外部拨动后也可调用）
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// 常驻循环：触发到期条目，然后睡到下一个触发时间 / max_sleep / 被唤醒 / 关闭
    pub async fn run(self: Arc<Self>, sink: Arc<dyn ActionSink>, shutdown: CancellationToken) {
        tracing::info!("scheduler loop started");
        loop {
            self.fire_due(&sink);
            let delay = self.next_delay();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::info!("scheduler loop stopped");
    }

    pub fn spawn(
        self: &Arc<Self>,
        sink: Arc<dyn ActionSink>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(sink, shutdown))
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > OUTCOME_PREVIEW_CHARS {
        format!("{}...", text.chars().take(OUTCOME_PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}
