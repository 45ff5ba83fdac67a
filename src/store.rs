//! SQLite-backed store for backup history, source profiles and task
//! definitions

use crate::runner::{BackupTask, TaskConfig, TaskType};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use std::path::Path;
use tracing::warn;

const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub id: i64,
    pub file_name: String,
    pub backup_path: String,
    pub source_paths: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    pub paths: Vec<String>,
}

/// Single-connection store. Callers serialize access (the controller keeps
/// it behind a mutex).
pub struct Store {
    conn: Connection,
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_record(row: &Row) -> rusqlite::Result<BackupRecord> {
    let source_paths: String = row.get("source_paths")?;
    let created_at: String = row.get("created_at")?;
    Ok(BackupRecord {
        id: row.get("id")?,
        file_name: row.get("file_name")?,
        backup_path: row.get("backup_path")?,
        source_paths: source_paths
            .split('\n')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        created_at: parse_timestamp(&created_at),
    })
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self { conn })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS backups (
                id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
                file_name TEXT,
                backup_path TEXT,
                source_paths TEXT,
                created_at DATETIME
            );
            CREATE TABLE IF NOT EXISTS profiles (
                id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                paths TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 0,
                config_json TEXT NOT NULL,
                created_at DATETIME,
                updated_at DATETIME
            );",
        )?;
        Ok(())
    }

    // ── history ──

    pub fn add_backup_record(
        &self,
        file_name: &str,
        backup_path: &str,
        source_paths: &[String],
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO backups(file_name, backup_path, source_paths, created_at)
             VALUES(?1, ?2, ?3, ?4)",
            params![
                file_name,
                backup_path,
                source_paths.join("\n"),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Recent history, newest first. Rows whose backup file no longer
    /// exists on disk are deleted instead of returned.
    pub fn backup_history(&self) -> Result<Vec<BackupRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, file_name, backup_path, source_paths, created_at
             FROM backups ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![HISTORY_LIMIT as i64], row_to_record)?;

        let mut valid = Vec::new();
        let mut stale: Vec<i64> = Vec::new();
        for record in rows {
            let record = record?;
            if Path::new(&record.backup_path).exists() {
                valid.push(record);
            } else {
                stale.push(record.id);
            }
        }
        drop(stmt);

        for id in stale {
            if let Err(err) = self
                .conn
                .execute("DELETE FROM backups WHERE id = ?1", params![id])
            {
                warn!(id, "could not prune stale backup record: {err}");
            }
        }
        Ok(valid)
    }

    // ── profiles ──

    pub fn save_profile(&self, name: &str, paths: &[String]) -> Result<i64> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput {
                reason: "profile name cannot be empty".into(),
            });
        }
        self.conn.execute(
            "INSERT INTO profiles(name, paths) VALUES(?1, ?2)
             ON CONFLICT(name) DO UPDATE SET paths = excluded.paths",
            params![name, paths.join("\n")],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM profiles WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn list_profiles(&self) -> Result<Vec<Profile>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, paths FROM profiles ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            let paths: String = row.get("paths")?;
            Ok(Profile {
                id: row.get("id")?,
                name: row.get("name")?,
                paths: paths
                    .split('\n')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })?;
        let mut profiles = Vec::new();
        for profile in rows {
            profiles.push(profile?);
        }
        Ok(profiles)
    }

    pub fn delete_profile(&self, id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM profiles WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ── tasks ──

    pub fn create_task(
        &self,
        name: &str,
        task_type: TaskType,
        enabled: bool,
        mut config: TaskConfig,
    ) -> Result<BackupTask> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput {
                reason: "task name cannot be empty".into(),
            });
        }
        let now = Utc::now();
        config.created_at = Some(now);
        config.updated_at = Some(now);

        let type_str = serde_json::to_value(task_type)?
            .as_str()
            .unwrap_or("schedule")
            .to_string();
        self.conn.execute(
            "INSERT INTO tasks(name, type, enabled, config_json, created_at, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                name,
                type_str,
                enabled as i64,
                serde_json::to_string(&config)?,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;

        Ok(BackupTask {
            id: self.conn.last_insert_rowid().to_string(),
            name: name.to_string(),
            task_type,
            enabled,
            config,
        })
    }

    pub fn update_task(&self, task: &BackupTask) -> Result<()> {
        let id = parse_task_id(&task.id)?;
        let mut config = task.config.clone();
        config.updated_at = Some(Utc::now());

        let type_str = serde_json::to_value(task.task_type)?
            .as_str()
            .unwrap_or("schedule")
            .to_string();
        self.conn.execute(
            "UPDATE tasks SET name = ?1, type = ?2, enabled = ?3, config_json = ?4,
             updated_at = ?5 WHERE id = ?6",
            params![
                task.name,
                type_str,
                task.enabled as i64,
                serde_json::to_string(&config)?,
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;
        Ok(())
    }

    /// Persist only a task's config (used to record `last_backup_path`
    /// after an execution).
    pub fn update_task_config(&self, task_id: &str, config: &TaskConfig) -> Result<()> {
        let id = parse_task_id(task_id)?;
        self.conn.execute(
            "UPDATE tasks SET config_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(config)?,
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;
        Ok(())
    }

    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        let id = parse_task_id(task_id)?;
        self.conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn load_tasks(&self) -> Result<Vec<BackupTask>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, type, enabled, config_json FROM tasks ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get("id")?;
            let name: String = row.get("name")?;
            let type_str: String = row.get("type")?;
            let enabled: i64 = row.get("enabled")?;
            let config_json: String = row.get("config_json")?;
            Ok((id, name, type_str, enabled, config_json))
        })?;

        let mut tasks = Vec::new();
        for row in rows {
            let (id, name, type_str, enabled, config_json) = row?;
            let task_type: TaskType = serde_json::from_value(serde_json::Value::String(
                type_str.clone(),
            ))
            .map_err(|_| Error::InvalidInput {
                reason: format!("task {id} has invalid type '{type_str}'"),
            })?;
            let config: TaskConfig =
                serde_json::from_str(&config_json).map_err(|err| Error::InvalidInput {
                    reason: format!("task {id} has invalid config: {err}"),
                })?;
            tasks.push(BackupTask {
                id: id.to_string(),
                name,
                task_type,
                enabled: enabled != 0,
                config,
            });
        }
        Ok(tasks)
    }
}

fn parse_task_id(task_id: &str) -> Result<i64> {
    task_id.parse().map_err(|_| Error::InvalidInput {
        reason: format!("invalid task id: {task_id}"),
    })
}
