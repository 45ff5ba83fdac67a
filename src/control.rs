//! Control surface for the UI layer: start/stop operations, conflict
//! resolution, task CRUD, and the default task executor

use crate::backup::{BackupManager, Encryption, PipelineOptions};
use crate::cancel::CancelToken;
use crate::crypto::Algorithm;
use crate::events::EventSink;
use crate::filters::FilterConfig;
use crate::restore::{ConflictAction, ConflictHandler};
use crate::runner::{BackupTask, TaskConfig, TaskExecutor, TaskRunner, TaskType};
use crate::store::{BackupRecord, Store};
use crate::{Error, Result};
use chrono::Local;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{info, warn};

/// Backup command sent by the UI.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackupRequest {
    pub source_paths: Vec<String>,
    pub destination_dir: String,
    pub filters: FilterConfig,
    pub use_compression: bool,
    pub use_encryption: bool,
    pub encryption_algorithm: String,
    pub encryption_password: String,
}

/// Restore command sent by the UI.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestoreRequest {
    pub backup_file: String,
    pub restore_dir: String,
    pub password: String,
}

fn parse_algorithm(name: &str) -> Result<Algorithm> {
    match name {
        "AES-256" => Ok(Algorithm::Aes256Ctr),
        "ChaCha20" => Ok(Algorithm::ChaCha20),
        other => Err(Error::InvalidInput {
            reason: format!("unsupported algorithm: {other}"),
        }),
    }
}

fn timestamped_file_name(base: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let safe: String = base
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | '.' => '_',
            other => other,
        })
        .collect();
    format!("{timestamp}_{safe}.qbak")
}

/// Pending conflict prompts keyed by request id. Entries are inserted by
/// restore workers and removed by the resolver or at operation end.
struct ConflictRegistry {
    pending: Mutex<HashMap<u64, Sender<ConflictAction>>>,
    next_id: AtomicU64,
}

impl ConflictRegistry {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn register(&self) -> (u64, Receiver<ConflictAction>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = bounded(1);
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(id, tx);
        }
        (id, rx)
    }

    fn resolve(&self, request_id: u64, action: ConflictAction) -> Result<()> {
        let sender = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&request_id),
            Err(_) => None,
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(action);
                Ok(())
            }
            None => Err(Error::InvalidInput {
                reason: format!("no pending conflict request with id {request_id}"),
            }),
        }
    }

    fn remove(&self, request_id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&request_id);
        }
    }

    /// Dropping the reply senders releases every waiting worker with a
    /// cancellation-shaped failure.
    fn clear(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

/// Single entry point the UI talks to. Owns the store, the task runner and
/// the in-flight operation's cancellation token.
pub struct Controller {
    store: Mutex<Store>,
    events: Arc<dyn EventSink>,
    current: Mutex<Option<CancelToken>>,
    conflicts: Arc<ConflictRegistry>,
    runner: Mutex<Option<TaskRunner>>,
}

impl Controller {
    pub fn new(store: Store, events: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(store),
            events,
            current: Mutex::new(None),
            conflicts: Arc::new(ConflictRegistry::new()),
            runner: Mutex::new(None),
        })
    }

    fn store(&self) -> std::sync::MutexGuard<'_, Store> {
        match self.store.lock() {
            Ok(store) => store,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_current(&self, token: Option<CancelToken>) {
        if let Ok(mut current) = self.current.lock() {
            *current = token;
        }
    }

    /// Cancel whatever backup or restore is currently running.
    pub fn stop_operation(&self) {
        if let Ok(current) = self.current.lock() {
            if let Some(token) = current.as_ref() {
                info!("stop requested for running operation");
                token.cancel();
            }
        }
    }

    /// Resolve a pending restore conflict. `action` is one of `skip`,
    /// `overwrite` or `keep_both`.
    pub fn resolve_conflict(&self, request_id: u64, action: &str) -> Result<()> {
        let action = match action {
            "skip" => ConflictAction::Skip,
            "overwrite" => ConflictAction::Overwrite,
            "keep_both" => ConflictAction::KeepBoth,
            other => {
                return Err(Error::InvalidInput {
                    reason: format!("invalid resolution: {other}"),
                })
            }
        };
        self.conflicts.resolve(request_id, action)
    }

    fn pipeline_options(request: &BackupRequest) -> Result<PipelineOptions> {
        let encryption = if request.use_encryption {
            Some(Encryption {
                algorithm: parse_algorithm(&request.encryption_algorithm)?,
                password: request.encryption_password.clone(),
            })
        } else {
            None
        };
        Ok(PipelineOptions {
            compression: request.use_compression,
            encryption,
        })
    }

    /// Run a backup for the UI. Returns the path of the archive written.
    pub fn start_backup(&self, request: &BackupRequest) -> Result<PathBuf> {
        if request.destination_dir.trim().is_empty() {
            return Err(Error::InvalidInput {
                reason: "destination directory is required".into(),
            });
        }
        if request.source_paths.is_empty() {
            return Err(Error::InvalidInput {
                reason: "no source paths provided".into(),
            });
        }

        let base = request
            .source_paths
            .first()
            .map(|p| {
                Path::new(p)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "backup".to_string())
            })
            .unwrap_or_else(|| "backup".to_string());
        let dest = Path::new(&request.destination_dir).join(timestamped_file_name(&base));

        self.events
            .log_message(&format!("backup file will be: {}", dest.display()));

        let options = Self::pipeline_options(request)?;
        let sources: Vec<PathBuf> = request.source_paths.iter().map(PathBuf::from).collect();

        let token = CancelToken::new();
        self.set_current(Some(token.clone()));
        let manager = BackupManager::with_events(token, self.events.clone());
        let result = manager.backup(&sources, &dest, &request.filters, &options);
        self.set_current(None);
        result?;

        if let Err(err) = self.store().add_backup_record(
            &dest
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            &dest.to_string_lossy(),
            &request.source_paths,
        ) {
            warn!("could not save backup record: {err}");
        }
        Ok(dest)
    }

    /// Run a restore for the UI. Conflicts publish `conflict_detected`
    /// events and block the worker until [`Controller::resolve_conflict`]
    /// or cancellation.
    pub fn start_restore(&self, request: &RestoreRequest) -> Result<()> {
        if request.backup_file.trim().is_empty() || request.restore_dir.trim().is_empty() {
            return Err(Error::InvalidInput {
                reason: "backup file and restore directory are required".into(),
            });
        }

        let token = CancelToken::new();
        self.set_current(Some(token.clone()));

        let mut manager = BackupManager::with_events(token.clone(), self.events.clone());
        manager.set_conflict_handler(self.conflict_handler(token));

        let result = manager.restore(
            Path::new(&request.backup_file),
            Path::new(&request.restore_dir),
            &request.password,
        );

        self.conflicts.clear();
        self.set_current(None);
        result
    }

    fn conflict_handler(&self, token: CancelToken) -> ConflictHandler {
        let conflicts = self.conflicts.clone();
        let events = self.events.clone();
        Arc::new(move |path: &Path| {
            let (id, reply) = conflicts.register();
            events.conflict_detected(path, id);

            let cancelled = token.cancelled();
            select! {
                recv(reply) -> action => match action {
                    Ok(action) => Ok(action),
                    Err(_) => Err(Error::ConflictUnresolved {
                        path: path.display().to_string(),
                    }),
                },
                recv(cancelled) -> _ => {
                    conflicts.remove(id);
                    Err(Error::Cancelled)
                }
            }
        })
    }

    // ── history & profiles ──

    pub fn backup_history(&self) -> Result<Vec<BackupRecord>> {
        self.store().backup_history()
    }

    pub fn save_profile(&self, name: &str, paths: &[String]) -> Result<i64> {
        self.store().save_profile(name, paths)
    }

    pub fn list_profiles(&self) -> Result<Vec<crate::store::Profile>> {
        self.store().list_profiles()
    }

    pub fn delete_profile(&self, id: i64) -> Result<()> {
        self.store().delete_profile(id)
    }

    // ── tasks ──

    /// Load persisted tasks, register them and start the runner.
    pub fn init_task_runner(self: &Arc<Self>) -> Result<()> {
        let runner = TaskRunner::new(self.task_executor());
        match self.store().load_tasks() {
            Ok(tasks) => {
                for task in tasks {
                    if let Err(err) = runner.upsert(task) {
                        warn!("could not register task: {err}");
                    }
                }
            }
            Err(err) => warn!("could not load tasks: {err}"),
        }
        runner.start();
        if let Ok(mut slot) = self.runner.lock() {
            *slot = Some(runner);
        }
        Ok(())
    }

    pub fn shutdown_task_runner(&self) {
        let runner = match self.runner.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(runner) = runner {
            runner.stop();
        }
    }

    pub fn create_task(
        &self,
        name: &str,
        task_type: TaskType,
        enabled: bool,
        config: TaskConfig,
    ) -> Result<BackupTask> {
        let task = self.store().create_task(name, task_type, enabled, config)?;
        if let Ok(runner) = self.runner.lock() {
            if let Some(runner) = runner.as_ref() {
                if let Err(err) = runner.upsert(task.clone()) {
                    let _ = self.store().delete_task(&task.id);
                    return Err(err);
                }
            }
        }
        Ok(task)
    }

    pub fn update_task(&self, task: &BackupTask) -> Result<()> {
        self.store().update_task(task)?;
        if let Ok(runner) = self.runner.lock() {
            if let Some(runner) = runner.as_ref() {
                runner.upsert(task.clone())?;
            }
        }
        Ok(())
    }

    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        self.store().delete_task(task_id)?;
        if let Ok(runner) = self.runner.lock() {
            if let Some(runner) = runner.as_ref() {
                runner.remove(task_id);
            }
        }
        Ok(())
    }

    pub fn run_task_now(&self, task_id: &str) -> Result<()> {
        let runner = self.runner.lock().map_err(|_| Error::InvalidInput {
            reason: "task runner unavailable".into(),
        })?;
        match runner.as_ref() {
            Some(runner) => {
                runner.run_now(task_id);
                Ok(())
            }
            None => Err(Error::InvalidInput {
                reason: "task runner not initialized".into(),
            }),
        }
    }

    pub fn tasks(&self) -> Result<Vec<BackupTask>> {
        self.store().load_tasks()
    }

    fn task_executor(self: &Arc<Self>) -> TaskExecutor {
        let controller: Weak<Controller> = Arc::downgrade(self);
        Arc::new(move |task| {
            let controller = controller.upgrade().ok_or_else(|| Error::InvalidInput {
                reason: "controller has shut down".into(),
            })?;
            controller.execute_task(task)
        })
    }

    /// Default executor contract: derive a timestamped archive name, run a
    /// full or incremental backup, then record history and advance the
    /// task's parent pointer. `NoChanges` is a successful empty result.
    pub fn execute_task(&self, task: &BackupTask) -> Result<Option<PathBuf>> {
        let config = &task.config;
        if config.destination_dir.trim().is_empty() {
            return Err(Error::InvalidInput {
                reason: "destinationDir is required".into(),
            });
        }
        if config.source_paths.is_empty() {
            return Err(Error::InvalidInput {
                reason: "sourcePaths is required".into(),
            });
        }

        fs::create_dir_all(&config.destination_dir)?;
        let file_name = timestamped_file_name(&task.name);
        let dest = Path::new(&config.destination_dir).join(&file_name);

        let encryption = if config.use_encryption {
            Some(Encryption {
                algorithm: Algorithm::from_id(config.algorithm)?,
                password: config.password.clone(),
            })
        } else {
            None
        };
        let options = PipelineOptions {
            compression: config.use_compression,
            encryption,
        };
        let sources: Vec<PathBuf> = config.source_paths.iter().map(PathBuf::from).collect();

        let manager = BackupManager::new(CancelToken::new());
        let run = if config.incremental && !config.last_backup_path.is_empty() {
            manager.backup_incremental(
                &sources,
                &dest,
                Path::new(&config.last_backup_path),
                &config.filters,
                &options,
            )
        } else {
            manager.backup(&sources, &dest, &config.filters, &options)
        };

        match run {
            Err(Error::NoChanges) => return Ok(None),
            Err(err) => return Err(err),
            Ok(()) => {}
        }

        if let Err(err) =
            self.store()
                .add_backup_record(&file_name, &dest.to_string_lossy(), &config.source_paths)
        {
            warn!(task = %task.id, "could not save backup record: {err}");
        }

        let mut updated = config.clone();
        updated.last_backup_path = dest.to_string_lossy().into_owned();
        if let Err(err) = self.store().update_task_config(&task.id, &updated) {
            warn!(task = %task.id, "could not persist last backup path: {err}");
        }

        Ok(Some(dest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullEvents, ProgressUpdate};
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    struct CapturingEvents {
        conflicts: Mutex<Vec<u64>>,
    }

    impl EventSink for CapturingEvents {
        fn log_message(&self, _message: &str) {}
        fn progress_update(&self, _update: &ProgressUpdate) {}
        fn conflict_detected(&self, _path: &Path, request_id: u64) {
            if let Ok(mut conflicts) = self.conflicts.lock() {
                conflicts.push(request_id);
            }
        }
    }

    fn controller() -> Arc<Controller> {
        Controller::new(Store::open_in_memory().unwrap(), Arc::new(NullEvents))
    }

    #[test]
    fn test_start_backup_writes_archive_and_history() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), b"hello").unwrap();
        let dest_dir = tmp.path().join("backups");
        fs::create_dir_all(&dest_dir).unwrap();

        let controller = controller();
        let request = BackupRequest {
            source_paths: vec![src.to_string_lossy().into_owned()],
            destination_dir: dest_dir.to_string_lossy().into_owned(),
            use_compression: true,
            ..BackupRequest::default()
        };

        let path = controller.start_backup(&request).unwrap();
        assert!(path.exists());
        assert!(path.extension().is_some_and(|e| e == "qbak"));

        let history = controller.backup_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].backup_path, path.to_string_lossy());
    }

    #[test]
    fn test_resolve_conflict_requires_pending_request() {
        let controller = controller();
        assert!(matches!(
            controller.resolve_conflict(42, "overwrite"),
            Err(Error::InvalidInput { .. })
        ));
        assert!(matches!(
            controller.resolve_conflict(1, "sideways"),
            Err(Error::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_restore_conflict_roundtrip_through_controller() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), b"from backup").unwrap();
        let dest_dir = tmp.path().join("backups");
        fs::create_dir_all(&dest_dir).unwrap();

        let events = Arc::new(CapturingEvents {
            conflicts: Mutex::new(Vec::new()),
        });
        let controller = Controller::new(Store::open_in_memory().unwrap(), events.clone());

        let backup_path = controller
            .start_backup(&BackupRequest {
                source_paths: vec![src.to_string_lossy().into_owned()],
                destination_dir: dest_dir.to_string_lossy().into_owned(),
                ..BackupRequest::default()
            })
            .unwrap();

        let restore_dir = tmp.path().join("restore");
        fs::create_dir_all(&restore_dir).unwrap();
        fs::write(restore_dir.join("a.txt"), b"existing").unwrap();

        // Resolve the conflict from a second thread, the way the UI would.
        let resolver = {
            let controller = controller.clone();
            let events = events.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let id = events.conflicts.lock().unwrap().first().copied();
                    if let Some(id) = id {
                        controller.resolve_conflict(id, "overwrite").unwrap();
                        return;
                    }
                    thread::sleep(Duration::from_millis(20));
                }
                panic!("no conflict event arrived");
            })
        };

        controller
            .start_restore(&RestoreRequest {
                backup_file: backup_path.to_string_lossy().into_owned(),
                restore_dir: restore_dir.to_string_lossy().into_owned(),
                password: String::new(),
            })
            .unwrap();
        resolver.join().unwrap();

        assert_eq!(
            fs::read(restore_dir.join("a.txt")).unwrap(),
            b"from backup"
        );
    }

    #[test]
    fn test_execute_task_runs_full_then_incremental() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), b"v1").unwrap();

        let controller = controller();
        let task = controller
            .create_task(
                "docs backup",
                TaskType::Schedule,
                true,
                TaskConfig {
                    source_paths: vec![src.to_string_lossy().into_owned()],
                    destination_dir: tmp
                        .path()
                        .join("backups")
                        .to_string_lossy()
                        .into_owned(),
                    incremental: true,
                    cron_expr: "0 0 3 * * *".into(),
                    ..TaskConfig::default()
                },
            )
            .unwrap();

        let first = controller.execute_task(&task).unwrap();
        let first_path = first.expect("full backup should produce a file");
        assert!(first_path.exists());

        // The stored task now carries the parent pointer; an unchanged
        // source yields no new archive.
        let stored = controller.tasks().unwrap().pop().unwrap();
        assert_eq!(
            stored.config.last_backup_path,
            first_path.to_string_lossy()
        );
        let second = controller.execute_task(&stored).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_execute_task_validates_config() {
        let controller = controller();
        let task = BackupTask {
            id: "1".into(),
            name: "broken".into(),
            task_type: TaskType::Schedule,
            enabled: true,
            config: TaskConfig::default(),
        };
        assert!(matches!(
            controller.execute_task(&task),
            Err(Error::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_timestamped_file_name_is_safe() {
        let name = timestamped_file_name("my docs/2024");
        assert!(name.ends_with(".qbak"));
        assert!(!name.contains(' '));
        assert!(!name.contains('/'));
    }
}
