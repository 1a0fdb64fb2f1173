//! 调度存储
//!
//! ScheduleStore 只有两个操作：启动时 load 全部条目，创建与终态转换时 put 单条。
//! JsonFileStore 在内存中保留整份条目表，每次 put 都整体重写：先写临时文件并 fsync，再 rename 覆盖，
//! 崩溃时磁盘上只会是旧文件或新文件。解析失败的文件被挪到 `<name>.corrupt-<时间戳>`，不删除。

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::ScheduleEntry;

const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Schedule store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// 文件无法解析；原文件已挪到 quarantined
    #[error("Schedule store corrupt ({reason}), moved aside to {}", quarantined.display())]
    Corrupt { reason: String, quarantined: PathBuf },

    #[error("Schedule store SQLite error: {0}")]
    Sqlite(String),

    #[error("Schedule store encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// 持久化后端
pub trait ScheduleStore: Send + Sync {
    /// 读取全部条目；存储损坏时隔离原文件并返回 Corrupt，之后的 put 从空表开始
    fn load(&self) -> Result<Vec<ScheduleEntry>, StoreError>;

    /// 插入或覆盖单条（按 id）
    fn put(&self, entry: &ScheduleEntry) -> Result<(), StoreError>;

    /// load 失败后调用：把现有文件挪到旁边并从空表开始，返回隔离后的路径（没有文件时为 None）
    fn reset(&self) -> Result<Option<PathBuf>, StoreError>;

    fn describe(&self) -> String;
}

/// 把损坏的文件挪到旁边：`<file>.corrupt-<YYYYmmddHHMMSS>`
pub(crate) fn quarantine(path: &Path) -> Result<PathBuf, StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "schedule".to_string());
    let target = path.with_file_name(format!(
        "{}.corrupt-{}",
        file_name,
        Utc::now().format("%Y%m%d%H%M%S")
    ));
    std::fs::rename(path, &target)?;
    Ok(target)
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: Vec<ScheduleEntry>,
}

/// JSON 文件存储（默认后端）
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    cache: Mutex<BTreeMap<Uuid, ScheduleEntry>>,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_atomically(&self, entries: &BTreeMap<Uuid, ScheduleEntry>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = StoreFile {
            version: STORE_VERSION,
            entries: entries.values().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&file)?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&data)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ScheduleStore for JsonFileStore {
    fn load(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.clear();
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read(&self.path)?;
        match serde_json::from_slice::<StoreFile>(&data) {
            Ok(file) => {
                for entry in file.entries {
                    cache.insert(entry.id, entry);
                }
                Ok(cache.values().cloned().collect())
            }
            Err(e) => {
                let quarantined = quarantine(&self.path)?;
                Err(StoreError::Corrupt {
                    reason: e.to_string(),
                    quarantined,
                })
            }
        }
    }

    fn put(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let previous = cache.insert(entry.id, entry.clone());
        if let Err(e) = self.write_atomically(&cache) {
            // 写盘失败时内存表回到写之前的样子
            match previous {
                Some(prev) => cache.insert(entry.id, prev),
                None => cache.remove(&entry.id),
            };
            return Err(e);
        }
        Ok(())
    }

    fn reset(&self) -> Result<Option<PathBuf>, StoreError> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
        if !self.path.exists() {
            return Ok(None);
        }
        quarantine(&self.path).map(Some)
    }

    fn describe(&self) -> String {
        format!("json:{}", self.path.display())
    }
}
