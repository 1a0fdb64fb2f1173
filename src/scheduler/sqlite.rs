//! SQLite 调度存储（可选后端，scheduler.backend = "sqlite"）
//!
//! 每条记录一行，put 在单个事务内 upsert。打不开的数据库文件按损坏处理：隔离后重建空库。

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode};
use uuid::Uuid;

use crate::scheduler::store::{quarantine, ScheduleStore, StoreError};
use crate::scheduler::{EntryStatus, ScheduleEntry, ScheduledAction};

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    CREATE TABLE IF NOT EXISTS schedule_entries (
        id           TEXT PRIMARY KEY,
        trigger_time TEXT NOT NULL,
        action       TEXT NOT NULL,
        status       TEXT NOT NULL,
        created_at   TEXT NOT NULL,
        updated_at   TEXT NOT NULL,
        outcome      TEXT
    );
"#;

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e.to_string())
    }
}

fn is_corruption(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt)
    )
}

pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// 打开连接（建表推迟到 load，以便在那里统一处理损坏文件）
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// 逐行解码；单行坏数据（时间戳、id、动作或状态无法解析）只跳过该行并记录错误
    fn read_all(conn: &Connection) -> Result<Vec<ScheduleEntry>, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        let mut stmt = conn.prepare(
            "SELECT id, trigger_time, action, status, created_at, updated_at, outcome
             FROM schedule_entries ORDER BY trigger_time",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(RawRow {
                id: row.get(0)?,
                trigger_time: row.get(1)?,
                action: row.get(2)?,
                status: row.get(3)?,
                created_at: row.get(4)?,
                updated_at: row.get(5)?,
                outcome: row.get(6)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let raw = match row {
                Ok(raw) => raw,
                Err(e) if is_corruption(&e) => return Err(e),
                Err(e) => {
                    tracing::error!(error = %e, "skipping unreadable schedule row");
                    continue;
                }
            };
            match raw.decode() {
                Some(entry) => entries.push(entry),
                None => tracing::error!(row_id = %raw.id, "skipping undecodable schedule row"),
            }
        }
        Ok(entries)
    }

    /// 先换成内存连接释放文件句柄，再隔离原文件并建空库
    fn recreate(&self, conn: &mut Connection) -> Result<Option<PathBuf>, StoreError> {
        *conn = Connection::open_in_memory()?;
        let quarantined = if self.path.exists() {
            Some(quarantine(&self.path)?)
        } else {
            None
        };
        let fresh = Connection::open(&self.path)?;
        fresh.execute_batch(SCHEMA)?;
        *conn = fresh;
        Ok(quarantined)
    }
}

/// 数据库里的一行，列都按文本读出
struct RawRow {
    id: String,
    trigger_time: String,
    action: String,
    status: String,
    created_at: String,
    updated_at: String,
    outcome: Option<String>,
}

impl RawRow {
    fn decode(&self) -> Option<ScheduleEntry> {
        Some(ScheduleEntry {
            id: Uuid::parse_str(&self.id).ok()?,
            trigger_time: parse_time(&self.trigger_time)?,
            action: serde_json::from_str::<ScheduledAction>(&self.action).ok()?,
            status: EntryStatus::parse(&self.status)?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            outcome: self.outcome.clone(),
        })
    }
}

/// RFC 3339；也接受 `2030-03-01 09:00:00+00:00` 这种空格分隔的写法
fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

impl ScheduleStore for SqliteStore {
    fn load(&self) -> Result<Vec<ScheduleEntry>, StoreError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        match Self::read_all(&conn) {
            Ok(entries) => Ok(entries),
            Err(e) if is_corruption(&e) => match self.recreate(&mut conn)? {
                Some(quarantined) => Err(StoreError::Corrupt {
                    reason: e.to_string(),
                    quarantined,
                }),
                None => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, entry: &ScheduleEntry) -> Result<(), StoreError> {
        let action = serde_json::to_string(&entry.action)?;
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        tx.execute(
            r#"INSERT INTO schedule_entries
               (id, trigger_time, action, status, created_at, updated_at, outcome)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
               ON CONFLICT(id) DO UPDATE SET
                 trigger_time=excluded.trigger_time,
                 action=excluded.action,
                 status=excluded.status,
                 updated_at=excluded.updated_at,
                 outcome=excluded.outcome"#,
            params![
                entry.id.to_string(),
                entry.trigger_time.to_rfc3339(),
                action,
                entry.status.as_str(),
                entry.created_at.to_rfc3339(),
                entry.updated_at.to_rfc3339(),
                entry.outcome,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn reset(&self) -> Result<Option<PathBuf>, StoreError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        self.recreate(&mut conn)
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}
