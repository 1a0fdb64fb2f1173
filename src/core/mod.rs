//! 核心层：错误与恢复、状态投影、会话监管、输入锁、运行时与构建器、优雅关闭

pub mod builder;
pub mod error;
pub mod guard;
pub mod orchestrator;
pub mod recovery;
pub mod session_supervisor;
pub mod shutdown;
pub mod state;

pub use builder::{create_agent_builder, resolve_workspace, Agent, AgentBuilder};
pub use error::{AgentError, ErrorKind, RecoveryAction};
pub use guard::InputGuard;
pub use orchestrator::{create_llm_from_config, spawn_runtime, AgentHandle, Command, RuntimeOptions};
pub use recovery::{RecoveryEngine, RetryPolicy};
pub use session_supervisor::SessionSupervisor;
pub use shutdown::{
    HistoryCleanup, SchedulerCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
pub use state::{LoopPhase, RuntimeState};
