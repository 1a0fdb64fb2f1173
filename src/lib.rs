//! Lumen - 个人智能体编排核心
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与恢复、运行时句柄、输入锁、构建器、优雅关闭
//! - **dispatch**: 有界的「模型 -> 能力调用 -> 观察」分派循环
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 对话上下文与持久化
//! - **observability**: 日志初始化
//! - **scheduler**: 持久化提醒调度器（JSON / SQLite 存储）
//! - **tools**: 能力注册表、参数 Schema、资源许可、执行器与内置能力

pub mod config;
pub mod core;
pub mod dispatch;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod scheduler;
pub mod tools;

pub use crate::core::{Agent, AgentBuilder, AgentError, AgentHandle};
