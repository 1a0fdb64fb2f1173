//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `LUMEN__*` 覆盖（双下划线表示嵌套，如 `LUMEN__DISPATCH__MAX_TURNS=3`）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub dispatch: DispatchSection,
    pub tools: ToolsSection,
    pub scheduler: SchedulerSection,
}

/// [app] 段：工作目录、对话轮数上限、对话持久化
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 沙箱根目录，未设置时用 ./workspace
    pub workspace_root: Option<PathBuf>,
    /// 每轮结束后保留的对话轮数（约 2 倍条数）
    pub max_context_turns: usize,
    /// 设置后每轮结束与退出时把对话写入该 JSON 文件
    pub history_path: Option<PathBuf>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            workspace_root: None,
            max_context_turns: 20,
            history_path: None,
        }
    }
}

/// [llm] 段：后端选择、采样与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
            temperature: 0.8,
            max_tokens: 4096,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次模型请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [dispatch] 段：执行周期上限与模型重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub max_turns: usize,
    pub model_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_turns: 6,
            model_retries: 2,
            backoff_base_ms: 500,
            backoff_max_ms: 8000,
        }
    }
}

/// [tools] 段：调用超时（全局 + 按能力覆盖）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次能力调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 按能力名覆盖的超时（秒），如 [tools.timeouts] read_file = 5
    pub timeouts: HashMap<String, u64>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            timeouts: HashMap::new(),
        }
    }
}

/// 调度存储后端
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Json,
    Sqlite,
}

/// [scheduler] 段：存储、宽限期、最长睡眠
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub backend: StoreBackend,
    /// 未设置时为 <workspace>/schedule.json（sqlite 为 schedule.db）
    pub store_path: Option<PathBuf>,
    pub grace_window_secs: u64,
    pub max_sleep_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Json,
            store_path: None,
            grace_window_secs: 300,
            max_sleep_secs: 60,
        }
    }
}

impl SchedulerSection {
    pub fn store_path_in(&self, workspace: &Path) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| match self.backend {
            StoreBackend::Json => workspace.join("schedule.json"),
            StoreBackend::Sqlite => workspace.join("schedule.db"),
        })
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_window_secs)
    }

    pub fn max_sleep(&self) -> Duration {
        Duration::from_secs(self.max_sleep_secs.max(1))
    }
}

/// 从 config 目录加载配置，环境变量 LUMEN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 LUMEN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("LUMEN")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.max_context_turns, 20);
        assert_eq!(cfg.dispatch.max_turns, 6);
        assert_eq!(cfg.scheduler.grace_window(), Duration::from_secs(300));
        assert_eq!(cfg.scheduler.backend, StoreBackend::Json);
        assert_eq!(
            cfg.scheduler.store_path_in(Path::new("/tmp/ws")),
            PathBuf::from("/tmp/ws/schedule.json")
        );
    }

    #[test]
    fn test_explicit_file_overrides() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            "[dispatch]\nmax_turns = 3\n\n[scheduler]\nbackend = \"sqlite\"\ngrace_window_secs = 10\n\n[tools.timeouts]\nread_file = 5"
        )
        .unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.dispatch.max_turns, 3);
        assert_eq!(cfg.dispatch.model_retries, 2);
        assert_eq!(cfg.scheduler.backend, StoreBackend::Sqlite);
        assert_eq!(cfg.scheduler.grace_window_secs, 10);
        assert_eq!(cfg.tools.timeouts.get("read_file"), Some(&5));
    }
}
