#![forbid(unsafe_code)]

pub mod commands;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod fanout;
pub mod gui_bridge;
pub mod progress;
pub mod project;
pub mod services;
pub mod settings;
pub mod settings_io;
pub mod task_manager;

pub use commands::{Command, CommandCallbacks, Operation, submit_command};
pub use envelope::{ErrorKind, Metadata, OperationError, ResultEnvelope, Status};
pub use error::{ExecutorError, SettingsError, TaskError, TaskManagerError};
pub use executor::{EXECUTOR_WORKERS, run_cancellable_in_executor, run_in_executor};
pub use fanout::{FanOutSummary, TargetOutcome};
pub use gui_bridge::{GuiBridge, GuiEvent, GuiReceiver, GuiSender, SyncEvent, gui_channel};
pub use progress::{ProgressLevel, ProgressReporter};
pub use project::{Project, ProjectCatalog, ProjectGroup};
pub use settings::{FolderAliases, Settings};
pub use settings_io::{default_settings_path, load_settings, save_settings};
pub use task_manager::{
    ManagerPhase, TaskHandle, TaskId, TaskManager, TaskManagerConfig, TaskOutcome, TaskSnapshot,
    TaskStats,
};
