//! Task runner: drives scheduled (cron) and filesystem-watch-triggered
//! backups, collapsing bursts and overlapping triggers into single runs

use crate::filters::FilterConfig;
use crate::{Error, Result};
use chrono::{DateTime, Local, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use cron::Schedule;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_WATCH_DEBOUNCE_MS: u64 = 500;
const SCHEDULER_TICK: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Schedule,
    Watch,
}

/// Per-task configuration, persisted as JSON in the task store.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskConfig {
    pub source_paths: Vec<String>,
    pub destination_dir: String,
    pub filters: FilterConfig,
    pub use_compression: bool,
    pub use_encryption: bool,
    pub algorithm: u8,
    pub password: String,
    pub incremental: bool,
    pub watch_debounce_ms: u64,
    pub cron_expr: String,
    pub watch_paths: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Parent used for incremental chaining; updated after each success.
    pub last_backup_path: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BackupTask {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub enabled: bool,
    pub config: TaskConfig,
}

/// Executes one task run. Returns the path of the new backup file, or
/// `None` when the run produced nothing (for example an incremental run
/// with no changes).
pub type TaskExecutor = Arc<dyn Fn(&BackupTask) -> Result<Option<PathBuf>> + Send + Sync>;

struct WatchHandle {
    // Dropping the watcher disconnects the event channel, which stops the
    // watch thread.
    _watcher: RecommendedWatcher,
}

struct TaskState {
    task: BackupTask,
    schedule: Option<Schedule>,
    next_run: Option<DateTime<Local>>,
    watch: Option<WatchHandle>,
    running: bool,
    pending: bool,
}

impl TaskState {
    fn disarm(&mut self) {
        self.schedule = None;
        self.next_run = None;
        self.watch = None;
        self.pending = false;
    }
}

struct RunnerInner {
    tasks: Mutex<HashMap<String, TaskState>>,
    executor: TaskExecutor,
    started: AtomicBool,
    active: Mutex<usize>,
    idle: Condvar,
}

/// Owns every task's runtime state. The application holds exactly one.
pub struct TaskRunner {
    inner: Arc<RunnerInner>,
}

impl TaskRunner {
    pub fn new(executor: TaskExecutor) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                tasks: Mutex::new(HashMap::new()),
                executor,
                started: AtomicBool::new(false),
                active: Mutex::new(0),
                idle: Condvar::new(),
            }),
        }
    }

    /// Arm every enabled task and start the scheduler thread.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("task runner starting");

        {
            let mut tasks = lock_tasks(&self.inner);
            let ids: Vec<String> = tasks.keys().cloned().collect();
            for id in ids {
                if let Err(err) = arm_task(&self.inner, &mut tasks, &id) {
                    warn!(task = %id, "could not arm task: {err}");
                }
            }
        }

        let inner = self.inner.clone();
        thread::spawn(move || scheduler_loop(inner));
    }

    /// Tear down cron entries, watchers and debounces, then wait until no
    /// task is mid-execution.
    pub fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("task runner stopping");

        {
            let mut tasks = lock_tasks(&self.inner);
            for state in tasks.values_mut() {
                state.disarm();
            }
        }

        let mut active = match self.inner.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        while *active > 0 {
            active = match self.inner.idle.wait(active) {
                Ok(active) => active,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Insert or replace a task. Armed immediately when the runner is
    /// started.
    pub fn upsert(&self, task: BackupTask) -> Result<()> {
        let id = task.id.clone();
        let mut tasks = lock_tasks(&self.inner);
        match tasks.get_mut(&id) {
            Some(state) => state.task = task,
            None => {
                tasks.insert(
                    id.clone(),
                    TaskState {
                        task,
                        schedule: None,
                        next_run: None,
                        watch: None,
                        running: false,
                        pending: false,
                    },
                );
            }
        }

        if self.inner.started.load(Ordering::SeqCst) {
            arm_task(&self.inner, &mut tasks, &id)?;
        }
        Ok(())
    }

    pub fn remove(&self, task_id: &str) {
        let mut tasks = lock_tasks(&self.inner);
        if let Some(mut state) = tasks.remove(task_id) {
            state.disarm();
        }
    }

    /// Trigger a task immediately, subject to the same run coalescing as
    /// scheduled triggers.
    pub fn run_now(&self, task_id: &str) {
        run_task(&self.inner, task_id);
    }

    pub fn list(&self) -> Vec<BackupTask> {
        lock_tasks(&self.inner)
            .values()
            .map(|state| state.task.clone())
            .collect()
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock_tasks(inner: &RunnerInner) -> std::sync::MutexGuard<'_, HashMap<String, TaskState>> {
    match inner.tasks.lock() {
        Ok(tasks) => tasks,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// (Re)arm one task according to its type. Clears any previous state first.
fn arm_task(
    inner: &Arc<RunnerInner>,
    tasks: &mut HashMap<String, TaskState>,
    task_id: &str,
) -> Result<()> {
    let state = match tasks.get_mut(task_id) {
        Some(state) => state,
        None => return Ok(()),
    };
    state.disarm();
    if !state.task.enabled {
        return Ok(());
    }

    match state.task.task_type {
        TaskType::Schedule => {
            let schedule =
                Schedule::from_str(&state.task.config.cron_expr).map_err(|err| Error::Schedule {
                    reason: format!(
                        "invalid cron expression '{}': {err}",
                        state.task.config.cron_expr
                    ),
                })?;
            state.next_run = schedule.upcoming(Local).next();
            state.schedule = Some(schedule);
        }
        TaskType::Watch => {
            state.watch = Some(start_watch(inner, task_id, &state.task.config)?);
        }
    }
    Ok(())
}

fn scheduler_loop(inner: Arc<RunnerInner>) {
    while inner.started.load(Ordering::SeqCst) {
        thread::sleep(SCHEDULER_TICK);

        let due: Vec<String> = {
            let mut tasks = lock_tasks(&inner);
            let now = Local::now();
            let mut due = Vec::new();
            for (id, state) in tasks.iter_mut() {
                let schedule = match &state.schedule {
                    Some(schedule) if state.task.enabled => schedule,
                    _ => continue,
                };
                match state.next_run {
                    Some(next) if next <= now => {
                        due.push(id.clone());
                        state.next_run = schedule.upcoming(Local).next();
                    }
                    Some(_) => {}
                    None => state.next_run = schedule.upcoming(Local).next(),
                }
            }
            due
        };

        for id in due {
            let inner = inner.clone();
            thread::spawn(move || run_task(&inner, &id));
        }
    }
}

fn start_watch(inner: &Arc<RunnerInner>, task_id: &str, config: &TaskConfig) -> Result<WatchHandle> {
    let (tx, rx) = unbounded::<notify::Result<notify::Event>>();
    let mut watcher = notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    })?;

    for watch_path in &config.watch_paths {
        let path = Path::new(watch_path);
        let meta = fs::metadata(path)?;
        if meta.is_dir() {
            watcher.watch(path, RecursiveMode::Recursive)?;
        } else {
            // Watch the parent directory for changes to a single file.
            watcher.watch(path.parent().unwrap_or(Path::new(".")), RecursiveMode::NonRecursive)?;
        }
    }

    let debounce = if config.watch_debounce_ms > 0 {
        Duration::from_millis(config.watch_debounce_ms)
    } else {
        Duration::from_millis(DEFAULT_WATCH_DEBOUNCE_MS)
    };

    let inner = inner.clone();
    let id = task_id.to_string();
    thread::spawn(move || watch_loop(inner, id, rx, debounce));

    Ok(WatchHandle { _watcher: watcher })
}

/// Trailing-edge debounce: the first event opens a window that every
/// further event extends; the task runs once the window stays quiet.
fn watch_loop(
    inner: Arc<RunnerInner>,
    task_id: String,
    events: Receiver<notify::Result<notify::Event>>,
    debounce: Duration,
) {
    loop {
        match events.recv() {
            Err(_) => return,
            Ok(Err(err)) => {
                // Watcher errors are not fatal; the task can still run.
                debug!(task = %task_id, "watcher error: {err}");
                continue;
            }
            Ok(Ok(_)) => loop {
                match events.recv_timeout(debounce) {
                    Ok(_) => continue,
                    Err(RecvTimeoutError::Timeout) => {
                        run_task(&inner, &task_id);
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            },
        }
    }
}

/// Execute one task. A trigger that lands while the task is running sets
/// `pending`, and at most one rerun follows regardless of trigger count.
fn run_task(inner: &Arc<RunnerInner>, task_id: &str) {
    let task = {
        let mut tasks = lock_tasks(inner);
        let state = match tasks.get_mut(task_id) {
            Some(state) => state,
            None => return,
        };
        if !state.task.enabled {
            return;
        }
        if state.running {
            state.pending = true;
            return;
        }
        state.running = true;
        // Counted while the map lock is held so stop() cannot observe the
        // task as idle between the flag and the count.
        let mut active = match inner.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        *active += 1;
        state.task.clone()
    };

    debug!(task = %task_id, name = %task.name, "running task");
    let result = (inner.executor)(&task);

    let rerun = {
        let mut tasks = lock_tasks(inner);
        match tasks.get_mut(task_id) {
            Some(state) => {
                state.running = false;
                if let Ok(Some(path)) = &result {
                    state.task.config.last_backup_path = path.display().to_string();
                }
                if state.pending {
                    state.pending = false;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    };

    match &result {
        Ok(Some(path)) => info!(task = %task_id, path = %path.display(), "task produced backup"),
        Ok(None) => debug!(task = %task_id, "task run produced no backup"),
        Err(err) => warn!(task = %task_id, "task execution failed: {err}"),
    }

    {
        let mut active = match inner.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        *active -= 1;
        inner.idle.notify_all();
    }

    if rerun {
        let inner = inner.clone();
        let id = task_id.to_string();
        thread::spawn(move || run_task(&inner, &id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn schedule_task(id: &str, cron_expr: &str) -> BackupTask {
        BackupTask {
            id: id.into(),
            name: id.into(),
            task_type: TaskType::Schedule,
            enabled: true,
            config: TaskConfig {
                cron_expr: cron_expr.into(),
                ..TaskConfig::default()
            },
        }
    }

    #[test]
    fn test_run_now_updates_last_backup_path() {
        let runner = TaskRunner::new(Arc::new(|_task| {
            Ok(Some(PathBuf::from("/tmp/new-backup.qbak")))
        }));
        runner
            .upsert(schedule_task("t1", "0 0 3 * * *"))
            .unwrap();

        runner.run_now("t1");

        let task = runner
            .list()
            .into_iter()
            .find(|t| t.id == "t1")
            .unwrap();
        assert_eq!(task.config.last_backup_path, "/tmp/new-backup.qbak");
    }

    #[test]
    fn test_watch_triggers_executor_once_per_burst() {
        let tmp = TempDir::new().unwrap();
        let (calls_tx, calls_rx) = bounded::<()>(16);

        let runner = TaskRunner::new(Arc::new(move |_task| {
            let _ = calls_tx.send(());
            Ok(None)
        }));
        runner.start();

        let task = BackupTask {
            id: "w1".into(),
            name: "watch".into(),
            task_type: TaskType::Watch,
            enabled: true,
            config: TaskConfig {
                watch_paths: vec![tmp.path().to_string_lossy().into_owned()],
                watch_debounce_ms: 50,
                ..TaskConfig::default()
            },
        };
        runner.upsert(task).unwrap();

        fs::write(tmp.path().join("a.txt"), b"x").unwrap();

        assert!(
            calls_rx.recv_timeout(Duration::from_secs(3)).is_ok(),
            "expected watcher to trigger the executor"
        );
        // The burst of create/write events collapses into one run.
        assert!(calls_rx.recv_timeout(Duration::from_millis(500)).is_err());

        runner.stop();
    }

    #[test]
    fn test_schedule_triggers_executor() {
        let (calls_tx, calls_rx) = bounded::<()>(16);
        let runner = TaskRunner::new(Arc::new(move |_task| {
            let _ = calls_tx.send(());
            Ok(None)
        }));
        runner.start();
        runner.upsert(schedule_task("s1", "* * * * * *")).unwrap();

        assert!(
            calls_rx.recv_timeout(Duration::from_secs(4)).is_ok(),
            "expected the scheduler to trigger the executor"
        );
        runner.stop();
    }

    #[test]
    fn test_overlapping_triggers_coalesce_to_one_rerun() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let runner = Arc::new(TaskRunner::new(Arc::new(move |_task| {
            counted.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
            Ok(None)
        })));
        runner.upsert(schedule_task("c1", "0 0 3 * * *")).unwrap();

        let background = {
            let runner = runner.clone();
            thread::spawn(move || runner.run_now("c1"))
        };
        thread::sleep(Duration::from_millis(50));
        // These land while the first run is in flight; they collapse into a
        // single queued rerun.
        runner.run_now("c1");
        runner.run_now("c1");
        runner.run_now("c1");
        background.join().unwrap();

        thread::sleep(Duration::from_millis(600));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalid_cron_expression_fails_on_arm() {
        let runner = TaskRunner::new(Arc::new(|_task| Ok(None)));
        runner.start();
        let err = runner
            .upsert(schedule_task("bad", "not a cron expr"))
            .unwrap_err();
        assert!(matches!(err, Error::Schedule { .. }));
        runner.stop();
    }

    #[test]
    fn test_disabled_task_never_runs() {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let runner = TaskRunner::new(Arc::new(move |_task| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }));
        let mut task = schedule_task("d1", "* * * * * *");
        task.enabled = false;
        runner.upsert(task).unwrap();
        runner.run_now("d1");
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_drops_task() {
        let runner = TaskRunner::new(Arc::new(|_task| Ok(None)));
        runner.upsert(schedule_task("r1", "0 0 3 * * *")).unwrap();
        assert_eq!(runner.list().len(), 1);
        runner.remove("r1");
        assert!(runner.list().is_empty());
    }
}
