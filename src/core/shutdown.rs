//! 优雅关闭
//!
//! ShutdownManager 持有全局关闭令牌：Ctrl+C / SIGTERM / `/quit` 都只是取消它。
//! 调度器常驻循环监听同一个令牌；ShutdownCoordinator 随后按注册顺序执行清理任务，每个任务有超时。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::AgentHandle;
use crate::memory::ConversationPersistence;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 用户发起（Ctrl+C 或 /quit）
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 输入流结束（stdin 关闭）
    InputClosed,
}

/// 关闭信号管理器
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 关闭令牌（交给调度器等常驻任务）
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；只记录第一次的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        let mut slot = self.reason.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            tracing::info!(?reason, "shutdown requested");
            *slot = Some(reason);
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务
pub struct ShutdownCoordinator {
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Box::new(task));
    }

    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.tasks.len());
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!("Cleanup task '{}' completed", name),
                Ok(Err(e)) => tracing::warn!("Cleanup task '{}' failed: {}", name, e),
                Err(_) => tracing::warn!(
                    "Cleanup task '{}' timed out after {}s",
                    name,
                    self.timeout.as_secs()
                ),
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// 退出时把对话写盘（app.history_path 配置后注册）
pub struct HistoryCleanup {
    handle: AgentHandle,
    persistence: ConversationPersistence,
}

impl HistoryCleanup {
    pub fn new(handle: AgentHandle, persistence: ConversationPersistence) -> Self {
        Self {
            handle,
            persistence,
        }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for HistoryCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let turns = self.handle.history().await?;
        self.persistence.save(&turns)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "History"
    }
}

/// 等待调度器常驻循环退出（关闭令牌取消之后）
pub struct SchedulerCleanup {
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerCleanup {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self {
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SchedulerCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        if let Some(task) = self.task.lock().await.take() {
            task.await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Scheduler"
    }
}
