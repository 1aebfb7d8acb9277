use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::ResultEnvelope;
use crate::project::Project;
use crate::services::{ArchiveReport, FileService};

use super::{Command, CommandCallbacks, Operation};

pub struct ArchiveCommand {
    project: Project,
    archive_name: String,
    files: Arc<dyn FileService>,
    callbacks: CommandCallbacks<ArchiveReport>,
}

impl ArchiveCommand {
    /// `archive_name` is usually [`crate::project::ProjectCatalog::archive_name`].
    pub fn new(
        project: Project,
        archive_name: impl Into<String>,
        files: Arc<dyn FileService>,
        callbacks: CommandCallbacks<ArchiveReport>,
    ) -> Self {
        Self {
            project,
            archive_name: archive_name.into(),
            files,
            callbacks,
        }
    }
}

#[async_trait]
impl Command for ArchiveCommand {
    type Output = ArchiveReport;

    fn operation(&self) -> Operation {
        Operation::Archive
    }

    fn subject(&self) -> String {
        self.project.name.clone()
    }

    fn callbacks(&mut self) -> &mut CommandCallbacks<ArchiveReport> {
        &mut self.callbacks
    }

    async fn execute(&mut self) -> ResultEnvelope<ArchiveReport> {
        self.files
            .create_archive(&self.project, &self.archive_name, &self.callbacks.progress)
            .await
            .with_metadata("archive_name", self.archive_name.clone())
    }
}
