use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TaskManagerError {
    #[error("background loop failed to start: {0}")]
    Startup(String),
    #[error("task manager has been shut down")]
    Shutdown,
    #[error("could not schedule task on the background loop: {0}")]
    Scheduling(String),
}

impl TaskManagerError {
    pub(crate) fn startup_timeout(timeout: Duration) -> Self {
        Self::Startup(format!(
            "loop did not report ready within {} ms",
            timeout.as_millis()
        ))
    }
}

/// Why a submitted task did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task was cancelled")]
    Cancelled,
    #[error("task failed: {0:#}")]
    Failed(#[from] anyhow::Error),
    #[error("task panicked: {0}")]
    Panicked(String),
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ExecutorError {
    #[error("no background event loop is running on this thread")]
    NoEventLoop,
    #[error("executor job interrupted: {0}")]
    Interrupted(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write settings file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: {message}")]
    Parse {
        path: String,
        line: usize,
        message: String,
    },
    #[error("invalid setting {key}: {message}")]
    Invalid { key: String, message: String },
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    String::from("non-string panic payload")
}
