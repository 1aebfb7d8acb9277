use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::error::ExecutorError;

pub const EXECUTOR_WORKERS: usize = 4;

static EXECUTOR_PERMITS: Semaphore = Semaphore::const_new(EXECUTOR_WORKERS);

/// Runs a blocking callable on the shared worker pool and awaits its value.
///
/// Must be polled from inside a runtime; otherwise it fails with
/// [`ExecutorError::NoEventLoop`] without running the callable. A panic in
/// the callable resumes on the awaiting task.
pub async fn run_in_executor<F, R>(callable: F) -> Result<R, ExecutorError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let handle = Handle::try_current().map_err(|_| ExecutorError::NoEventLoop)?;
    let permit = EXECUTOR_PERMITS
        .acquire()
        .await
        .map_err(|_| ExecutorError::Interrupted(String::from("worker pool closed")))?;

    let joined = handle
        .spawn_blocking(move || {
            let _permit = permit;
            callable()
        })
        .await;

    match joined {
        Ok(value) => Ok(value),
        Err(error) if error.is_panic() => panic::resume_unwind(error.into_panic()),
        Err(error) => Err(ExecutorError::Interrupted(error.to_string())),
    }
}

/// Like [`run_in_executor`], but the callable receives a flag that is raised
/// as soon as the awaiting future is dropped, so long-running work such as a
/// child process can stop early.
pub async fn run_cancellable_in_executor<F, R>(callable: F) -> Result<R, ExecutorError>
where
    F: FnOnce(Arc<AtomicBool>) -> R + Send + 'static,
    R: Send + 'static,
{
    let flag = Arc::new(AtomicBool::new(false));
    let mut guard = CancelOnDrop {
        flag: Arc::clone(&flag),
        armed: true,
    };
    let result = run_in_executor(move || callable(flag)).await;
    guard.armed = false;
    result
}

struct CancelOnDrop {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::Relaxed);
        }
    }
}
