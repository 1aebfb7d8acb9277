use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::ResultEnvelope;
use crate::project::Project;
use crate::services::{CleanupReport, FileService};

use super::{Command, CommandCallbacks, Operation};

/// Removes cache and build directories from one project version.
pub struct CleanupCommand {
    project: Project,
    files: Arc<dyn FileService>,
    callbacks: CommandCallbacks<CleanupReport>,
}

impl CleanupCommand {
    pub fn new(
        project: Project,
        files: Arc<dyn FileService>,
        callbacks: CommandCallbacks<CleanupReport>,
    ) -> Self {
        Self {
            project,
            files,
            callbacks,
        }
    }
}

#[async_trait]
impl Command for CleanupCommand {
    type Output = CleanupReport;

    fn operation(&self) -> Operation {
        Operation::Cleanup
    }

    fn subject(&self) -> String {
        self.project.name.clone()
    }

    fn callbacks(&mut self) -> &mut CommandCallbacks<CleanupReport> {
        &mut self.callbacks
    }

    async fn execute(&mut self) -> ResultEnvelope<CleanupReport> {
        self.files
            .cleanup(&self.project, &self.callbacks.progress)
            .await
            .with_metadata("project", self.project.relative_path.clone())
    }
}
