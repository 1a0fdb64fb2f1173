//! Agent 编排器：运行时任务与用户侧句柄
//!
//! 一个后台任务独占对话上下文与分派器，按 FIFO 消费命令队列（用户输入与调度器合成指令共用），
//! 因此同一时刻只有一个分派循环在跑，调度器触发的回合只会排在当前循环结束之后。
//! stop 不经过队列，直接取消当前循环的令牌。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::{AgentError, InputGuard, LoopPhase, RuntimeState, SessionSupervisor};
use crate::dispatch::{DispatchEvent, DispatchOutcome, DispatchSession, Dispatcher, Instruction};
use crate::llm::{create_deepseek_client, deepseek_api_key, LlmClient, MockLlmClient, OpenAiClient};
use crate::memory::{ConversationContext, ConversationPersistence, Turn};
use crate::scheduler::ActionSink;

/// 发往运行时任务的命令
#[derive(Debug)]
pub enum Command {
    /// 运行一次分派循环，完成后回传结果
    Submit {
        instruction: Instruction,
        reply: oneshot::Sender<DispatchOutcome>,
    },
    /// 取对话快照
    History { reply: oneshot::Sender<Vec<Turn>> },
    /// 清空对话（含持久化副本）
    Reset { reply: oneshot::Sender<()> },
}

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let base = cfg.llm.base_url.as_deref();

    match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM (configured)");
            Arc::new(MockLlmClient::new())
        }
        "openai" => match std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()) {
            Some(key) => {
                tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
                Arc::new(OpenAiClient::new(base, &cfg.llm.model, &key))
            }
            None => {
                tracing::warn!("OPENAI_API_KEY not set, using Mock LLM");
                Arc::new(MockLlmClient::new())
            }
        },
        _ => match deepseek_api_key() {
            Some(key) => {
                tracing::info!("Using DeepSeek LLM ({})", cfg.llm.model);
                Arc::new(create_deepseek_client(base, Some(&cfg.llm.model), &key))
            }
            None => {
                tracing::warn!("No API key set or provider unknown, using Mock LLM");
                Arc::new(MockLlmClient::new())
            }
        },
    }
}

/// 运行时选项
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// 每轮结束后剪枝到的对话轮数
    pub max_context_turns: usize,
    pub persistence: Option<ConversationPersistence>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_context_turns: 20,
            persistence: None,
        }
    }
}

/// 用户侧句柄：唯一入口。可克隆，克隆之间共享同一个运行时
#[derive(Clone)]
pub struct AgentHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    supervisor: Arc<SessionSupervisor>,
    guard: Arc<InputGuard>,
    state_rx: watch::Receiver<RuntimeState>,
    queued: Arc<AtomicUsize>,
}

impl AgentHandle {
    /// 提交用户输入；锁定时直接拒绝
    pub async fn submit(&self, text: impl Into<String>) -> Result<DispatchOutcome, AgentError> {
        if self.guard.is_locked() {
            tracing::warn!("user input rejected: agent is locked");
            return Err(AgentError::Locked);
        }
        self.enqueue(Instruction::User(text.into())).await
    }

    /// 提交调度器合成指令；创建时已获授权，不受锁定影响
    pub async fn submit_scheduled(&self, instruction: Instruction) -> Result<DispatchOutcome, AgentError> {
        self.enqueue(instruction).await
    }

    async fn enqueue(&self, instruction: Instruction) -> Result<DispatchOutcome, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self
            .cmd_tx
            .send(Command::Submit { instruction, reply })
            .is_err()
        {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(AgentError::RuntimeClosed);
        }
        rx.await.map_err(|_| AgentError::RuntimeClosed)
    }

    /// 中断当前循环（模型等待或阻塞中的调用）
    pub fn stop(&self) {
        tracing::info!("stop requested");
        self.supervisor.stop();
    }

    pub async fn history(&self) -> Result<Vec<Turn>, AgentError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::History { reply })
            .map_err(|_| AgentError::RuntimeClosed)?;
        rx.await.map_err(|_| AgentError::RuntimeClosed)
    }

    pub async fn reset(&self) -> Result<(), AgentError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Reset { reply })
            .map_err(|_| AgentError::RuntimeClosed)?;
        rx.await.map_err(|_| AgentError::RuntimeClosed)
    }

    pub fn state(&self) -> watch::Receiver<RuntimeState> {
        self.state_rx.clone()
    }

    pub fn guard(&self) -> &Arc<InputGuard> {
        &self.guard
    }
}

#[async_trait]
impl ActionSink for AgentHandle {
    async fn submit(&self, instruction: Instruction) -> Result<DispatchOutcome, AgentError> {
        self.submit_scheduled(instruction).await
    }
}

/// 启动运行时任务：返回句柄、过程事件接收端与任务句柄。
/// 所有 AgentHandle 被丢弃后命令通道关闭，任务随之退出
pub fn spawn_runtime(
    dispatcher: Dispatcher,
    guard: Arc<InputGuard>,
    options: RuntimeOptions,
) -> (
    AgentHandle,
    mpsc::UnboundedReceiver<DispatchEvent>,
    JoinHandle<()>,
) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (state_tx, state_rx) = watch::channel(RuntimeState::default());
    let (event_tx, event_rx) = mpsc::unbounded_channel::<DispatchEvent>();
    let supervisor = Arc::new(SessionSupervisor::new());
    let queued = Arc::new(AtomicUsize::new(0));

    let restored = match &options.persistence {
        Some(p) => p.load().unwrap_or_else(|e| {
            tracing::warn!("History load failed ({}), starting empty", e);
            Vec::new()
        }),
        None => Vec::new(),
    };
    if !restored.is_empty() {
        tracing::info!(turns = restored.len(), "conversation restored");
    }

    let handle = AgentHandle {
        cmd_tx,
        supervisor: supervisor.clone(),
        guard,
        state_rx,
        queued: queued.clone(),
    };

    let task = tokio::spawn(async move {
        let mut context = ConversationContext::from_turns(restored);

        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Submit { instruction, reply } => {
                    let waiting = queued.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                    state_tx.send_modify(|s| {
                        s.queued = waiting;
                        s.last_error = None;
                    });

                    let cancel = supervisor.begin_cycle();
                    let session = DispatchSession::new(cancel)
                        .with_events(&event_tx)
                        .with_state(&state_tx);
                    let outcome = dispatcher.run(&mut context, instruction, &session).await;

                    // 每个循环到达 Done 就是一次会话边界，裁剪只发生在这里
                    let dropped = context.trim_at_boundary(options.max_context_turns);
                    if dropped > 0 {
                        tracing::debug!(dropped, "conversation trimmed");
                    }
                    if let Some(p) = &options.persistence {
                        if let Err(e) = p.save(context.turns()) {
                            tracing::warn!("History save failed: {}", e);
                        }
                    }

                    state_tx.send_modify(|s| {
                        s.phase = LoopPhase::Idle;
                        s.active_capability = None;
                        s.last_error = outcome.error.clone();
                    });
                    let _ = reply.send(outcome);
                }
                Command::History { reply } => {
                    let _ = reply.send(context.snapshot());
                }
                Command::Reset { reply } => {
                    context.reset();
                    if let Some(p) = &options.persistence {
                        if let Err(e) = p.clear() {
                            tracing::warn!("History clear failed: {}", e);
                        }
                    }
                    tracing::info!("conversation reset");
                    let _ = reply.send(());
                }
            }
        }
        tracing::info!("agent runtime stopped");
    });

    (handle, event_rx, task)
}
