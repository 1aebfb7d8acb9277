use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{TaskError, TaskManagerError, panic_message};

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskManagerConfig {
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub thread_name: String,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            thread_name: String::from("pcp-runtime"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ManagerPhase {
    Uninitialized,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
    Panicked,
}

impl TaskOutcome {
    fn of<T>(result: &Result<T, TaskError>) -> Self {
        match result {
            Ok(_) => Self::Completed,
            Err(TaskError::Cancelled) => Self::Cancelled,
            Err(TaskError::Failed(_)) => Self::Failed,
            Err(TaskError::Panicked(_)) => Self::Panicked,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    pub submitted_at: DateTime<Local>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskStats {
    pub total: usize,
    pub running: usize,
    pub pruned: usize,
    pub tasks: Vec<TaskSnapshot>,
}

/// Owns one background thread running a current-thread tokio runtime and
/// tracks every task submitted to it until the task settles.
pub struct TaskManager {
    config: TaskManagerConfig,
    inner: Mutex<ManagerInner>,
    tasks: Arc<Mutex<HashMap<TaskId, TrackedTask>>>,
    next_task_id: AtomicU64,
}

struct ManagerInner {
    phase: ManagerPhase,
    terminal: bool,
    background: Option<BackgroundLoop>,
}

struct BackgroundLoop {
    handle: Handle,
    root_token: CancellationToken,
    stop_tx: Option<oneshot::Sender<Duration>>,
    exit_rx: mpsc::Receiver<()>,
    thread: thread::JoinHandle<()>,
    thread_id: ThreadId,
}

impl BackgroundLoop {
    fn is_alive(&self) -> bool {
        !self.thread.is_finished()
    }
}

struct TrackedTask {
    name: Arc<str>,
    submitted_at: DateTime<Local>,
    token: CancellationToken,
    completion: Arc<Completion>,
}

impl TaskManager {
    pub fn new(config: TaskManagerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(ManagerInner {
                phase: ManagerPhase::Uninitialized,
                terminal: false,
                background: None,
            }),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_task_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &TaskManagerConfig {
        &self.config
    }

    pub fn phase(&self) -> ManagerPhase {
        let inner = lock(&self.inner);
        match (&inner.background, inner.phase) {
            (Some(background), ManagerPhase::Running) if !background.is_alive() => {
                ManagerPhase::Stopped
            }
            (_, phase) => phase,
        }
    }

    /// Starts the background loop if it is not already running.
    pub fn start(&self) -> Result<(), TaskManagerError> {
        self.ensure_running().map(|_| ())
    }

    /// Handle of the running loop, if any. Never starts the loop.
    pub fn loop_handle(&self) -> Option<Handle> {
        let inner = lock(&self.inner);
        if inner.phase != ManagerPhase::Running {
            return None;
        }
        inner
            .background
            .as_ref()
            .filter(|background| background.is_alive())
            .map(|background| background.handle.clone())
    }

    pub fn submit<F, T>(&self, name: Option<&str>, future: F) -> Result<TaskHandle, TaskManagerError>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit_with_callback(name, future, |_| {})
    }

    /// Schedules `future` on the background loop. `on_complete` runs on the
    /// loop thread once the task settles, after it has left the tracked set.
    pub fn submit_with_callback<F, T, C>(
        &self,
        name: Option<&str>,
        future: F,
        on_complete: C,
    ) -> Result<TaskHandle, TaskManagerError>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(Result<T, TaskError>) + Send + 'static,
    {
        let (handle, root_token) = self.ensure_running().map_err(|error| match error {
            TaskManagerError::Startup(message) => TaskManagerError::Scheduling(message),
            other => other,
        })?;

        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed));
        let name: Arc<str> = match name {
            Some(name) => Arc::from(name),
            None => Arc::from(format!("task-{id}")),
        };
        let token = root_token.child_token();
        let completion = Arc::new(Completion::new());

        lock(&self.tasks).insert(
            id,
            TrackedTask {
                name: Arc::clone(&name),
                submitted_at: Local::now(),
                token: token.clone(),
                completion: Arc::clone(&completion),
            },
        );

        let slot = TaskSlot {
            id,
            name: Arc::clone(&name),
            tasks: Arc::clone(&self.tasks),
            completion: Arc::clone(&completion),
            settled: false,
        };
        let running = handle.spawn(run_task(id, Arc::clone(&name), token.clone(), future));
        handle.spawn(watch_task(running, slot, on_complete));
        tracing::debug!(task = %name, task_id = %id, "task submitted");

        Ok(TaskHandle {
            id,
            name,
            token,
            completion,
        })
    }

    /// Cancels every unfinished tracked task and waits up to `timeout` for
    /// them to settle. Stragglers are logged and forgotten. Must not be
    /// called from the loop thread.
    pub fn cancel_all(&self, timeout: Duration) {
        let pending: Vec<CancellationToken> = lock(&self.tasks)
            .values()
            .filter(|task| !task.completion.is_finished())
            .map(|task| task.token.clone())
            .collect();
        if pending.is_empty() {
            lock(&self.tasks).clear();
            return;
        }

        tracing::debug!(count = pending.len(), "cancelling tracked tasks");
        for token in &pending {
            token.cancel();
        }

        let deadline = Instant::now() + timeout;
        loop {
            self.prune();
            if lock(&self.tasks).is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(CANCEL_POLL_INTERVAL.min(deadline - now));
        }

        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            let mut stragglers: Vec<&str> = tasks.values().map(|task| &*task.name).collect();
            stragglers.sort_unstable();
            tracing::warn!(
                count = stragglers.len(),
                timeout_ms = timeout.as_millis(),
                "tasks did not finish after cancellation: {}",
                stragglers.join(", ")
            );
        }
        tasks.clear();
    }

    pub fn task_count(&self) -> usize {
        self.prune();
        lock(&self.tasks).len()
    }

    pub fn task_stats(&self) -> TaskStats {
        let mut tasks = lock(&self.tasks);
        let total = tasks.len();
        tasks.retain(|_, task| !task.completion.is_finished());
        let mut snapshots: Vec<TaskSnapshot> = tasks
            .iter()
            .map(|(id, task)| TaskSnapshot {
                id: *id,
                name: task.name.to_string(),
                submitted_at: task.submitted_at,
            })
            .collect();
        snapshots.sort_by_key(|snapshot| snapshot.id);
        TaskStats {
            total,
            running: snapshots.len(),
            pruned: total - snapshots.len(),
            tasks: snapshots,
        }
    }

    /// Cancels tracked tasks, stops the loop and joins its thread. Terminal:
    /// every later submission fails with [`TaskManagerError::Shutdown`].
    pub fn shutdown(&self, timeout: Duration) {
        {
            let mut inner = lock(&self.inner);
            if inner.terminal {
                return;
            }
            inner.terminal = true;
        }
        self.wind_down(timeout);
    }

    /// Same sequence as [`TaskManager::shutdown`], but the next submission
    /// starts a fresh loop.
    pub fn stop(&self, timeout: Duration) {
        if lock(&self.inner).terminal {
            return;
        }
        self.wind_down(timeout);
    }

    fn wind_down(&self, timeout: Duration) {
        let background = {
            let mut inner = lock(&self.inner);
            if inner.background.is_none() {
                inner.phase = ManagerPhase::Stopped;
                return;
            }
            inner.phase = ManagerPhase::ShuttingDown;
            inner.background.take()
        };
        let started = Instant::now();

        self.cancel_all(timeout / 2);
        if let Some(background) = background {
            stop_background(background, timeout);
        }

        lock(&self.inner).phase = ManagerPhase::Stopped;
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis(),
            "background loop stopped"
        );
    }

    fn prune(&self) {
        lock(&self.tasks).retain(|_, task| !task.completion.is_finished());
    }

    fn ensure_running(&self) -> Result<(Handle, CancellationToken), TaskManagerError> {
        let mut inner = lock(&self.inner);
        if inner.terminal {
            return Err(TaskManagerError::Shutdown);
        }
        if inner.phase == ManagerPhase::ShuttingDown {
            return Err(TaskManagerError::Scheduling(String::from(
                "background loop is stopping",
            )));
        }
        if let Some(background) = &inner.background {
            if background.is_alive() {
                return Ok((background.handle.clone(), background.root_token.clone()));
            }
            tracing::warn!("background loop thread exited unexpectedly; restarting");
        }

        if let Some(dead) = inner.background.take() {
            let _ = dead.thread.join();
        }
        let background = spawn_background(&self.config)?;
        let running = (background.handle.clone(), background.root_token.clone());
        inner.background = Some(background);
        inner.phase = ManagerPhase::Running;
        Ok(running)
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        let background = self
            .inner
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .background
            .take();
        if let Some(background) = background {
            background.root_token.cancel();
            stop_background(background, self.config.shutdown_timeout);
        }
    }
}

fn spawn_background(config: &TaskManagerConfig) -> Result<BackgroundLoop, TaskManagerError> {
    let (ready_tx, ready_rx) = mpsc::sync_channel(1);
    let (stop_tx, stop_rx) = oneshot::channel::<Duration>();
    let (exit_tx, exit_rx) = mpsc::channel();

    let thread = thread::Builder::new()
        .name(config.thread_name.clone())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(error) => {
                    let _ = ready_tx.send(Err(error.to_string()));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(runtime.handle().clone()));
            let drain = runtime
                .block_on(stop_rx)
                .unwrap_or(Duration::ZERO);
            runtime.shutdown_timeout(drain);
            let _ = exit_tx.send(());
        })
        .map_err(|error| {
            TaskManagerError::Startup(format!("failed to spawn loop thread: {error}"))
        })?;

    match ready_rx.recv_timeout(config.startup_timeout) {
        Ok(Ok(handle)) => {
            tracing::debug!(thread = %config.thread_name, "background loop ready");
            Ok(BackgroundLoop {
                handle,
                root_token: CancellationToken::new(),
                stop_tx: Some(stop_tx),
                exit_rx,
                thread_id: thread.thread().id(),
                thread,
            })
        }
        Ok(Err(message)) => Err(TaskManagerError::Startup(message)),
        Err(RecvTimeoutError::Timeout) => {
            let _ = stop_tx.send(Duration::ZERO);
            Err(TaskManagerError::startup_timeout(config.startup_timeout))
        }
        Err(RecvTimeoutError::Disconnected) => Err(TaskManagerError::Startup(String::from(
            "loop thread exited before reporting ready",
        ))),
    }
}

fn stop_background(mut background: BackgroundLoop, timeout: Duration) {
    background.root_token.cancel();
    if let Some(stop_tx) = background.stop_tx.take() {
        let _ = stop_tx.send(timeout / 2);
    }
    if thread::current().id() == background.thread_id {
        return;
    }

    match background.exit_rx.recv_timeout(timeout) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
            if background.thread.join().is_err() {
                tracing::error!("background loop thread panicked");
            }
        }
        Err(RecvTimeoutError::Timeout) => {
            tracing::warn!(
                timeout_ms = timeout.as_millis(),
                "background loop thread did not exit in time; detaching"
            );
        }
    }
}

async fn run_task<F, T>(
    id: TaskId,
    name: Arc<str>,
    token: CancellationToken,
    future: F,
) -> Option<anyhow::Result<T>>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let started = Instant::now();
    let result = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = future => Some(result),
    };
    let elapsed_ms = started.elapsed().as_millis();
    match &result {
        None => tracing::info!(task = %name, task_id = %id, elapsed_ms, "task cancelled"),
        Some(Err(error)) => {
            tracing::error!(task = %name, task_id = %id, elapsed_ms, "task failed: {error:#}");
        }
        Some(Ok(_)) => tracing::debug!(task = %name, task_id = %id, elapsed_ms, "task finished"),
    }
    result
}

async fn watch_task<T, C>(
    running: JoinHandle<Option<anyhow::Result<T>>>,
    mut slot: TaskSlot,
    on_complete: C,
) where
    C: FnOnce(Result<T, TaskError>),
{
    let result = match running.await {
        Ok(Some(Ok(value))) => Ok(value),
        Ok(Some(Err(error))) => Err(TaskError::Failed(error)),
        Ok(None) => Err(TaskError::Cancelled),
        Err(error) if error.is_panic() => {
            let message = panic_message(&*error.into_panic());
            tracing::error!(task = %slot.name, task_id = %slot.id, "task panicked: {message}");
            Err(TaskError::Panicked(message))
        }
        Err(_) => Err(TaskError::Cancelled),
    };
    let outcome = TaskOutcome::of(&result);

    slot.untrack();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || on_complete(result))) {
        tracing::error!(
            task = %slot.name,
            task_id = %slot.id,
            "completion callback panicked: {}",
            panic_message(&*payload)
        );
    }
    slot.settle(outcome);
}

/// Keeps the tracked set and the handle's completion consistent even when
/// the watcher is dropped by a runtime shutdown before it could run.
struct TaskSlot {
    id: TaskId,
    name: Arc<str>,
    tasks: Arc<Mutex<HashMap<TaskId, TrackedTask>>>,
    completion: Arc<Completion>,
    settled: bool,
}

impl TaskSlot {
    fn untrack(&self) {
        lock(&self.tasks).remove(&self.id);
    }

    fn settle(&mut self, outcome: TaskOutcome) {
        self.settled = true;
        self.completion.finish(outcome);
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        if !self.settled {
            self.untrack();
            self.completion.finish(TaskOutcome::Cancelled);
        }
    }
}

struct Completion {
    outcome: Mutex<Option<TaskOutcome>>,
    ready: Condvar,
    watch: watch::Sender<Option<TaskOutcome>>,
}

impl Completion {
    fn new() -> Self {
        let (watch, _) = watch::channel(None);
        Self {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
            watch,
        }
    }

    fn finish(&self, outcome: TaskOutcome) {
        let mut slot = lock(&self.outcome);
        if slot.is_none() {
            *slot = Some(outcome);
            self.ready.notify_all();
            self.watch.send_replace(Some(outcome));
        }
    }

    fn outcome(&self) -> Option<TaskOutcome> {
        *lock(&self.outcome)
    }

    fn is_finished(&self) -> bool {
        self.outcome().is_some()
    }
}

/// Caller-side view of one submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    name: Arc<str>,
    token: CancellationToken,
    completion: Arc<Completion>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("outcome", &self.completion.outcome())
            .finish()
    }
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.completion.is_finished()
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.completion.outcome()
    }

    /// Resolves once the task has settled and its callback has returned.
    pub async fn wait(&self) -> TaskOutcome {
        let mut outcome_rx = self.completion.watch.subscribe();
        match outcome_rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(TaskOutcome::Cancelled),
            Err(_) => self.outcome().unwrap_or(TaskOutcome::Cancelled),
        }
    }

    /// Blocks the calling thread; `None` when the task is still running
    /// after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        let guard = lock(&self.completion.outcome);
        let (guard, _) = self
            .completion
            .ready
            .wait_timeout_while(guard, timeout, |outcome| outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
