//! 沙箱文件系统能力
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! ReadFileTool / ListDirTool 基于 SafeFs 提供读文件与列目录，执行时占用 filesystem 资源。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::AgentError;
use crate::tools::{Capability, CapabilityError, ParamKind, ParameterSchema};

/// 文件类能力共用的资源名
pub const FILESYSTEM_RESOURCE: &str = "filesystem";

/// 单次读取的最大字符数，超出部分截断
const MAX_READ_CHARS: usize = 20_000;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    /// 检查路径是否在沙箱内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let path = path.trim_start_matches("./");
        let full = self.root_dir.join(path);
        let canonical = full
            .canonicalize()
            .map_err(|_| AgentError::PathEscape(format!("path not found: {path}")))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(AgentError::PathEscape(path.to_string())) // 如 ../../etc/passwd
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<String, CapabilityError> {
        let resolved = self.resolve(path).map_err(|e| CapabilityError::new(e.to_string()))?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| CapabilityError::new(format!("read failed: {e}")))?;
        if content.chars().count() > MAX_READ_CHARS {
            let head: String = content.chars().take(MAX_READ_CHARS).collect();
            Ok(format!("{head}\n...(truncated)"))
        } else {
            Ok(content)
        }
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>, CapabilityError> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path).map_err(|e| CapabilityError::new(e.to_string()))?
        };
        let mut dir = tokio::fs::read_dir(&base)
            .await
            .map_err(|e| CapabilityError::new(format!("list failed: {e}")))?;
        let mut entries = Vec::new();
        while let Some(e) = dir
            .next_entry()
            .await
            .map_err(|e| CapabilityError::new(e.to_string()))?
        {
            let name = e.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = e.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();
        Ok(entries)
    }
}

/// 读取文件内容
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Capability for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file inside the workspace."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new().required("path", ParamKind::String, "file path relative to workspace")
    }

    fn resource(&self) -> Option<&str> {
        Some(FILESYSTEM_RESOURCE)
    }

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, CapabilityError> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
        tracing::info!(path = %path, "read_file");
        self.fs.read_file(path).await.map(Value::String)
    }
}

/// 列出目录
pub struct ListDirTool {
    fs: SafeFs,
}

impl ListDirTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Capability for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List a directory inside the workspace (default '.')."
    }

    fn parameters(&self) -> ParameterSchema {
        ParameterSchema::new().optional("path", ParamKind::String, "directory path, default '.'")
    }

    fn resource(&self) -> Option<&str> {
        Some(FILESYSTEM_RESOURCE)
    }

    async fn invoke(&self, args: Map<String, Value>) -> Result<Value, CapabilityError> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        tracing::info!(path = %path, "list_dir");
        let entries = self.fs.list_dir(path).await?;
        Ok(Value::String(entries.join("\n")))
    }
}
