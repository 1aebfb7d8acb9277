use std::fmt;
use std::sync::Arc;

use crate::gui_bridge::GuiSender;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressLevel {
    Info,
    Warning,
    Success,
    Error,
}

impl ProgressLevel {
    pub fn label(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

type ProgressSink = dyn Fn(&str, ProgressLevel) + Send + Sync;

/// Progress callback handed to commands and services. Called from the
/// background loop and from executor threads.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<ProgressSink>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("ProgressReporter")
    }
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(&str, ProgressLevel) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn silent() -> Self {
        Self::new(|_, _| {})
    }

    /// Forwards every report to the UI thread as a `GuiEvent::Progress`.
    pub fn to_gui(sender: GuiSender, task: impl Into<String>) -> Self {
        let task = task.into();
        Self::new(move |message, level| {
            sender.progress(&task, message, level);
        })
    }

    pub fn report(&self, message: &str, level: ProgressLevel) {
        (self.sink)(message, level);
    }

    pub fn info(&self, message: &str) {
        self.report(message, ProgressLevel::Info);
    }

    pub fn warning(&self, message: &str) {
        self.report(message, ProgressLevel::Warning);
    }

    pub fn success(&self, message: &str) {
        self.report(message, ProgressLevel::Success);
    }

    pub fn error(&self, message: &str) {
        self.report(message, ProgressLevel::Error);
    }

    /// Streams child-process output line by line at info level.
    pub fn output(&self, chunk: &str) {
        for line in chunk.lines() {
            let line = line.trim_end();
            if !line.is_empty() {
                self.info(line);
            }
        }
    }
}
