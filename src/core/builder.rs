//! Agent 构建器：统一的初始化逻辑
//!
//! 顺序固定：先打开调度器（提醒能力要持有它），再建注册表、执行器与分派器，
//! 启动运行时任务，最后把运行时句柄作为 ActionSink 交给调度器常驻循环。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, StoreBackend};
use crate::core::{
    create_llm_from_config, spawn_runtime, AgentHandle, InputGuard, RecoveryEngine, RetryPolicy,
    RuntimeOptions,
};
use crate::dispatch::{DispatchEvent, Dispatcher, Planner, DEFAULT_SYSTEM_PROMPT};
use crate::llm::{LlmClient, SamplingParams};
use crate::memory::ConversationPersistence;
use crate::scheduler::{
    Clock, JsonFileStore, PersistentScheduler, ScheduleStore, SchedulerConfig, SqliteStore,
    SystemClock,
};
use crate::tools::{
    CancelReminderTool, CurrentTimeTool, EchoTool, ListDirTool, ListRemindersTool, ReadFileTool,
    ResourcePool, SetReminderTool, ToolExecutor, ToolRegistry, FILESYSTEM_RESOURCE,
};

/// 文件系统能力的并发上限
const FILESYSTEM_PERMITS: usize = 2;

/// 构建完成、已在运行的 Agent
pub struct Agent {
    pub handle: AgentHandle,
    pub events: mpsc::UnboundedReceiver<DispatchEvent>,
    pub scheduler: Arc<PersistentScheduler>,
    pub persistence: Option<ConversationPersistence>,
    pub runtime_task: JoinHandle<()>,
    pub scheduler_task: JoinHandle<()>,
}

/// Agent 构建器：配置 + 工作目录，LLM 与时钟可替换（测试用）
pub struct AgentBuilder {
    config: AppConfig,
    workspace: PathBuf,
    system_prompt: String,
    llm: Option<Arc<dyn LlmClient>>,
    clock: Arc<dyn Clock>,
}

impl AgentBuilder {
    pub fn new(config: AppConfig, workspace: PathBuf) -> Self {
        Self {
            config,
            workspace,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            llm: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_system_prompt(mut self, prompt: &str) -> Self {
        self.system_prompt = prompt.to_string();
        self
    }

    /// 从 config/prompts/system.md 加载系统提示词，找不到时保留内置提示词
    pub fn with_system_prompt_from_file(mut self) -> Self {
        if let Some(prompt) = ["config/prompts/system.md", "../config/prompts/system.md"]
            .into_iter()
            .find_map(|p| std::fs::read_to_string(p).ok())
            .filter(|p| !p.trim().is_empty())
        {
            self.system_prompt = prompt;
        }
        self
    }

    /// 替换 LLM 后端（默认按配置选择）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// 按配置打开 JSON 或 SQLite 存储并完成启动对账
    pub fn open_scheduler(&self) -> anyhow::Result<Arc<PersistentScheduler>> {
        let section = &self.config.scheduler;
        let path = section.store_path_in(&self.workspace);
        let store: Box<dyn ScheduleStore> = match section.backend {
            StoreBackend::Json => Box::new(JsonFileStore::new(&path)),
            StoreBackend::Sqlite => Box::new(
                SqliteStore::open(&path)
                    .with_context(|| format!("open schedule database {}", path.display()))?,
            ),
        };
        let cfg = SchedulerConfig {
            grace_window: section.grace_window(),
            max_sleep: section.max_sleep(),
        };
        let scheduler = PersistentScheduler::open(store, self.clock.clone(), cfg)
            .context("restore schedule store")?;
        Ok(Arc::new(scheduler))
    }

    /// 内置能力：echo、current_time、read_file、list_dir 与三个提醒能力
    pub fn build_tool_registry(
        &self,
        scheduler: &Arc<PersistentScheduler>,
    ) -> anyhow::Result<ToolRegistry> {
        let pool = ResourcePool::new().with_limit(FILESYSTEM_RESOURCE, FILESYSTEM_PERMITS);
        let mut tools = ToolRegistry::with_resources(pool);

        tools.register(EchoTool)?;
        tools.register(CurrentTimeTool)?;
        tools.register(ReadFileTool::new(&self.workspace))?;
        tools.register(ListDirTool::new(&self.workspace))?;
        tools.register(SetReminderTool::new(scheduler.clone()))?;
        tools.register(CancelReminderTool::new(scheduler.clone()))?;
        tools.register(ListRemindersTool::new(scheduler.clone()))?;

        Ok(tools)
    }

    pub fn build_executor(&self, registry: ToolRegistry) -> ToolExecutor {
        let tools = &self.config.tools;
        tools.timeouts.iter().fold(
            ToolExecutor::new(registry, tools.tool_timeout_secs),
            |executor, (name, secs)| executor.with_override(name, Duration::from_secs(*secs)),
        )
    }

    pub fn build_llm(&self) -> Arc<dyn LlmClient> {
        self.llm
            .clone()
            .unwrap_or_else(|| create_llm_from_config(&self.config))
    }

    pub fn build_dispatcher(&self, executor: ToolExecutor) -> Dispatcher {
        let llm_cfg = &self.config.llm;
        let planner = Planner::new(self.build_llm(), self.system_prompt.clone())
            .with_sampling(SamplingParams {
                temperature: llm_cfg.temperature,
                max_tokens: llm_cfg.max_tokens,
            })
            .with_request_timeout(Duration::from_secs(llm_cfg.timeouts.request));

        let dispatch = &self.config.dispatch;
        let recovery = RecoveryEngine::new(RetryPolicy {
            max_retries: dispatch.model_retries,
            backoff_base: Duration::from_millis(dispatch.backoff_base_ms),
            backoff_max: Duration::from_millis(dispatch.backoff_max_ms),
        });

        Dispatcher::new(planner, Arc::new(executor), recovery, dispatch.max_turns)
    }

    /// 组装并启动：运行时任务 + 调度器常驻循环（监听 shutdown 令牌）
    pub fn build(self, guard: Arc<InputGuard>, shutdown: CancellationToken) -> anyhow::Result<Agent> {
        std::fs::create_dir_all(&self.workspace)
            .with_context(|| format!("create workspace {}", self.workspace.display()))?;

        let scheduler = self.open_scheduler()?;
        let registry = self.build_tool_registry(&scheduler)?;
        tracing::info!(capabilities = ?registry.names(), "capability registry ready");
        let dispatcher = self.build_dispatcher(self.build_executor(registry));

        let persistence = self
            .config
            .app
            .history_path
            .as_ref()
            .map(ConversationPersistence::new);
        let options = RuntimeOptions {
            max_context_turns: self.config.app.max_context_turns,
            persistence: persistence.clone(),
        };
        let (handle, events, runtime_task) = spawn_runtime(dispatcher, guard, options);
        let scheduler_task = scheduler.spawn(Arc::new(handle.clone()), shutdown);

        Ok(Agent {
            handle,
            events,
            scheduler,
            persistence,
            runtime_task,
            scheduler_task,
        })
    }
}

/// 解析工作目录：配置值或 ./workspace，存在时取规范路径
pub fn resolve_workspace(config: &AppConfig) -> anyhow::Result<PathBuf> {
    let workspace = match &config.app.workspace_root {
        Some(root) => root.clone(),
        None => std::env::current_dir()
            .context("resolve current directory")?
            .join("workspace"),
    };
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("create workspace {}", workspace.display()))?;
    Ok(workspace.canonicalize().unwrap_or(workspace))
}

/// 便捷函数：加载配置（失败时退回默认值）并创建 AgentBuilder
pub fn create_agent_builder(config_path: Option<PathBuf>) -> anyhow::Result<AgentBuilder> {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let workspace = resolve_workspace(&config)?;
    Ok(AgentBuilder::new(config, workspace).with_system_prompt_from_file())
}
