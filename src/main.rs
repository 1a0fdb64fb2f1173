//! Lumen 控制台入口
//!
//! 初始化日志与配置，构建 Agent，然后逐行读取标准输入：`/` 开头的是控制命令，其余发给 Agent。
//! 分派过程事件与调度器事件由后台任务打印。

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use uuid::Uuid;

use lumen::core::{
    create_agent_builder, AgentError, AgentHandle, HistoryCleanup, InputGuard, SchedulerCleanup,
    ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
use lumen::dispatch::DispatchEvent;
use lumen::scheduler::{PersistentScheduler, ScheduleEntry, ScheduledAction, SchedulerEvent};
use lumen::tools::reminder::parse_target_time;

const HELP: &str = "命令: /remind <YYYY-MM-DD HH:MM:SS> <内容> | /list | /cancel <id> | /stop | /lock | /unlock | /reset | /quit";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    lumen::observability::init("info");

    let builder = create_agent_builder(None).context("Failed to prepare agent")?;
    tracing::info!(workspace = %builder.workspace().display(), "lumen starting");

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let guard = Arc::new(InputGuard::new());
    let agent = builder
        .build(guard.clone(), shutdown.token())
        .context("Failed to build agent")?;
    let handle = agent.handle.clone();
    let scheduler = agent.scheduler.clone();

    if !scheduler.missed_at_startup().is_empty() {
        println!("离线期间错过的提醒：");
        print_entries(scheduler.missed_at_startup());
    }

    tokio::spawn(print_dispatch_events(agent.events));
    tokio::spawn(print_scheduler_events(scheduler.subscribe()));

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => line.context("read stdin")?,
        };
        let Some(line) = line else {
            shutdown.shutdown(ShutdownReason::InputClosed);
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('/') {
            if !handle_command(line, &handle, &guard, &scheduler).await {
                shutdown.shutdown(ShutdownReason::UserInitiated);
                break;
            }
            continue;
        }

        // 后台提交，保证分派进行中仍能输入 /stop
        let handle = handle.clone();
        let text = line.to_string();
        tokio::spawn(async move {
            match handle.submit(text).await {
                Ok(_) => {}
                Err(AgentError::Locked) => println!("[已锁定] 输入被拒绝，使用 /unlock 解锁"),
                Err(e) => println!("[错误] {e}"),
            }
        });
    }

    let mut coordinator = ShutdownCoordinator::new();
    coordinator.register(SchedulerCleanup::new(agent.scheduler_task));
    if let Some(persistence) = agent.persistence {
        coordinator.register(HistoryCleanup::new(handle, persistence));
    }
    coordinator.run_cleanup().await;
    tracing::info!(reason = ?shutdown.reason(), "lumen stopped");
    Ok(())
}

/// 处理一条控制命令；返回 false 表示退出
async fn handle_command(
    line: &str,
    handle: &AgentHandle,
    guard: &InputGuard,
    scheduler: &Arc<PersistentScheduler>,
) -> bool {
    let mut parts = line.splitn(2, char::is_whitespace);
    let cmd = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default().trim();

    match cmd {
        "/quit" | "/exit" => return false,
        "/stop" => handle.stop(),
        "/lock" => {
            guard.lock();
            println!("已锁定：普通输入将被拒绝，定时提醒照常执行");
        }
        "/unlock" => {
            guard.unlock();
            println!("已解锁");
        }
        "/reset" => match handle.reset().await {
            Ok(()) => println!("对话已清空"),
            Err(e) => println!("[错误] {e}"),
        },
        "/list" => {
            let entries = scheduler.list(None);
            if entries.is_empty() {
                println!("没有提醒");
            } else {
                print_entries(&entries);
            }
        }
        "/cancel" => match Uuid::parse_str(rest) {
            Ok(id) => match scheduler.cancel(id) {
                Ok(entry) => println!("已取消 {}", entry.id),
                Err(e) => println!("[错误] {e}"),
            },
            Err(_) => println!("用法: /cancel <id>"),
        },
        "/remind" => remind(rest, scheduler),
        _ => println!("{HELP}"),
    }
    true
}

/// `/remind 2031-06-01 09:30:00 开会`：时间占前两段
fn remind(args: &str, scheduler: &PersistentScheduler) {
    let fields: Vec<&str> = args.splitn(3, ' ').collect();
    let [date, time, text] = fields.as_slice() else {
        println!("用法: /remind <YYYY-MM-DD HH:MM:SS> <内容>");
        return;
    };
    let trigger = match parse_target_time(&format!("{date} {time}")) {
        Ok(t) => t,
        Err(e) => {
            println!("[错误] {e}");
            return;
        }
    };
    match scheduler.schedule(trigger, ScheduledAction::notify(text.trim())) {
        Ok(entry) => println!("已设置提醒 {} @ {}", entry.id, entry.local_trigger()),
        Err(e) => println!("[错误] {e}"),
    }
}

fn print_entries(entries: &[ScheduleEntry]) {
    for e in entries {
        println!(
            "  {}  {}  [{}]  {}",
            e.id,
            e.local_trigger(),
            e.status,
            e.action.summary()
        );
    }
}

async fn print_dispatch_events(mut events: tokio::sync::mpsc::UnboundedReceiver<DispatchEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            DispatchEvent::StepUpdate { cycle, max_turns } => {
                tracing::debug!(cycle, max_turns, "step")
            }
            DispatchEvent::Thinking => {}
            DispatchEvent::ToolCall {
                capability,
                arguments,
                ..
            } => println!("  -> {capability} {arguments}"),
            DispatchEvent::Observation {
                capability,
                success,
                preview,
                ..
            } => {
                let mark = if success { "ok" } else { "fail" };
                println!("  <- {capability} [{mark}] {preview}");
            }
            DispatchEvent::Recovery { action, detail } => println!("  (重试: {action} {detail})"),
            DispatchEvent::Answer { text } => println!("Lumen: {text}"),
            DispatchEvent::Error { text } => println!("[错误] {text}"),
        }
    }
}

async fn print_scheduler_events(mut events: broadcast::Receiver<SchedulerEvent>) {
    loop {
        match events.recv().await {
            Ok(SchedulerEvent::Fired { id }) => println!("[提醒触发] {id}"),
            Ok(SchedulerEvent::Missed { entries }) => {
                println!("错过的提醒：");
                print_entries(&entries);
            }
            Ok(SchedulerEvent::Cancelled { id }) => tracing::debug!(%id, "reminder cancelled"),
            Ok(SchedulerEvent::Scheduled { entry }) => {
                tracing::debug!(id = %entry.id, "reminder scheduled")
            }
            Ok(SchedulerEvent::Completed { id, .. }) => tracing::debug!(%id, "reminder completed"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "scheduler events lagged")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
