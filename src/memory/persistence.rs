//! 对话持久化
//!
//! 将对话上下文写入/从 JSON 文件加载，用于跨进程恢复（app.history_path 配置后启用）。

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::memory::Turn;

/// 单文件 JSON 持久化
#[derive(Debug, Clone)]
pub struct ConversationPersistence {
    path: PathBuf,
}

impl ConversationPersistence {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 从 JSON 文件加载对话历史；文件不存在时返回空 Vec
    pub fn load(&self) -> anyhow::Result<Vec<Turn>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read history {}", self.path.display()))?;
        let turns: Vec<Turn> = serde_json::from_str(&data)
            .with_context(|| format!("parse history {}", self.path.display()))?;
        Ok(turns)
    }

    /// 将对话历史写入 JSON 文件；父目录不存在时自动创建
    pub fn save(&self, turns: &[Turn]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(turns)?)
            .with_context(|| format!("write history {}", self.path.display()))?;
        Ok(())
    }

    /// 删除持久化副本（reset 时调用）
    pub fn clear(&self) -> anyhow::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
