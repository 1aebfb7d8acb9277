//! Commands bundle a domain entity with the services that act on it and the
//! callbacks that report back to the UI. Building one performs no I/O; the
//! work starts once it is submitted to the [`TaskManager`].

mod add_project;
mod archive;
mod build_docker_files;
mod cleanup;
mod docker;
mod edit_run_tests;
mod git;
mod sync;
mod validate;

use std::fmt;
use std::time::Instant;

use async_trait::async_trait;

use crate::envelope::{ResultEnvelope, Status};
use crate::error::TaskManagerError;
use crate::gui_bridge::GuiSender;
use crate::progress::{ProgressLevel, ProgressReporter};
use crate::task_manager::{TaskHandle, TaskManager};

pub use add_project::{AddProjectCommand, project_name_from_url};
pub use archive::ArchiveCommand;
pub use build_docker_files::BuildDockerFilesCommand;
pub use cleanup::CleanupCommand;
pub use docker::DockerBuildCommand;
pub use edit_run_tests::{EditRunTestsCommand, EditRunTestsReport, discover_test_files};
pub use git::{GitCheckoutAllCommand, GitView, GitViewCommand};
pub use sync::SyncCommand;
pub use validate::ValidateCommand;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Operation {
    Cleanup,
    Archive,
    DockerBuild,
    GitView,
    GitCheckoutAll,
    Sync,
    Validate,
    BuildDockerFiles,
    EditRunTests,
    AddProject,
}

impl Operation {
    pub fn task_prefix(self) -> &'static str {
        match self {
            Self::Cleanup => "cleanup",
            Self::Archive => "archive",
            Self::DockerBuild => "docker",
            Self::GitView => "git",
            Self::GitCheckoutAll => "git-checkout-all",
            Self::Sync => "sync",
            Self::Validate => "validate",
            Self::BuildDockerFiles => "build-docker",
            Self::EditRunTests => "edit-run-tests",
            Self::AddProject => "add-project",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Cleanup => "cleanup",
            Self::Archive => "archive",
            Self::DockerBuild => "docker build",
            Self::GitView => "git view",
            Self::GitCheckoutAll => "git checkout all",
            Self::Sync => "sync",
            Self::Validate => "validate",
            Self::BuildDockerFiles => "build docker files",
            Self::EditRunTests => "edit run_tests.sh",
            Self::AddProject => "add project",
        }
    }

    pub fn error_code(self) -> &'static str {
        match self {
            Self::Cleanup => "CLEANUP_ERROR",
            Self::Archive => "ARCHIVE_ERROR",
            Self::DockerBuild => "DOCKER_ERROR",
            Self::GitView => "GIT_ERROR",
            Self::GitCheckoutAll => "GIT_CHECKOUT_ALL_ERROR",
            Self::Sync => "SYNC_ERROR",
            Self::Validate => "VALIDATION_ERROR",
            Self::BuildDockerFiles => "DOCKER_FILES_ERROR",
            Self::EditRunTests => "EDIT_RUN_TESTS_ERROR",
            Self::AddProject => "ADD_PROJECT_ERROR",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.label())
    }
}

pub type CompletionCallback<T> = Box<dyn FnOnce(&ResultEnvelope<T>) + Send>;

/// Progress and completion hooks handed to a command at construction.
pub struct CommandCallbacks<T> {
    pub progress: ProgressReporter,
    pub completion: Option<CompletionCallback<T>>,
}

impl<T> fmt::Debug for CommandCallbacks<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CommandCallbacks")
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

impl<T> Default for CommandCallbacks<T> {
    fn default() -> Self {
        Self::new(ProgressReporter::silent())
    }
}

impl<T> CommandCallbacks<T> {
    pub fn new(progress: ProgressReporter) -> Self {
        Self {
            progress,
            completion: None,
        }
    }

    pub fn on_complete(mut self, completion: impl FnOnce(&ResultEnvelope<T>) + Send + 'static) -> Self {
        self.completion = Some(Box::new(completion));
        self
    }

    /// Routes progress and the final summary to the UI queue under `task`.
    pub fn to_gui(sender: GuiSender, task: impl Into<String>) -> Self {
        let task = task.into();
        let finished = sender.clone();
        let finished_task = task.clone();
        Self::new(ProgressReporter::to_gui(sender, task)).on_complete(move |envelope| {
            finished.finished(&finished_task, envelope.status(), envelope.summary());
        })
    }
}

#[async_trait]
pub trait Command: Send + 'static {
    type Output: Send + 'static;

    fn operation(&self) -> Operation;

    /// Identity of the entity the command acts on, used in the task name.
    fn subject(&self) -> String;

    fn callbacks(&mut self) -> &mut CommandCallbacks<Self::Output>;

    async fn execute(&mut self) -> ResultEnvelope<Self::Output>;

    fn task_name(&self) -> String {
        format!("{}-{}", self.operation().task_prefix(), self.subject())
    }

    /// Reports the start, runs [`Command::execute`], reports the outcome and
    /// hands the envelope to the completion callback before returning it.
    async fn run_with_progress(mut self) -> ResultEnvelope<Self::Output>
    where
        Self: Sized,
    {
        let started = Instant::now();
        let operation = self.operation();
        let subject = self.subject();
        self.callbacks().progress.info("Starting operation...");

        let envelope = self.execute().await;

        tracing::info!(
            operation = operation.label(),
            subject = %subject,
            status = %envelope.status(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "command finished"
        );
        let level = match envelope.status() {
            Status::Success => ProgressLevel::Success,
            Status::Partial => ProgressLevel::Warning,
            Status::Error => ProgressLevel::Error,
        };
        let callbacks = self.callbacks();
        callbacks.progress.report(&envelope.summary(), level);
        if let Some(completion) = callbacks.completion.take() {
            completion(&envelope);
        }
        envelope
    }
}

/// Submits `command` to the background loop as `<prefix>-<subject>`.
pub fn submit_command<C: Command>(
    manager: &TaskManager,
    command: C,
) -> Result<TaskHandle, TaskManagerError> {
    let name = command.task_name();
    manager.submit(Some(name.as_str()), async move {
        Ok(command.run_with_progress().await)
    })
}
