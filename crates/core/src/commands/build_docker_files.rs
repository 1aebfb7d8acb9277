use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::ResultEnvelope;
use crate::project::ProjectGroup;
use crate::services::{DockerFilesReport, DockerFilesService};

use super::{Command, CommandCallbacks, Operation};

pub struct BuildDockerFilesCommand {
    group: ProjectGroup,
    force: bool,
    service: Arc<dyn DockerFilesService>,
    callbacks: CommandCallbacks<DockerFilesReport>,
}

impl BuildDockerFilesCommand {
    pub fn new(
        group: ProjectGroup,
        force: bool,
        service: Arc<dyn DockerFilesService>,
        callbacks: CommandCallbacks<DockerFilesReport>,
    ) -> Self {
        Self {
            group,
            force,
            service,
            callbacks,
        }
    }
}

#[async_trait]
impl Command for BuildDockerFilesCommand {
    type Output = DockerFilesReport;

    fn operation(&self) -> Operation {
        Operation::BuildDockerFiles
    }

    fn subject(&self) -> String {
        self.group.name.clone()
    }

    fn callbacks(&mut self) -> &mut CommandCallbacks<DockerFilesReport> {
        &mut self.callbacks
    }

    async fn execute(&mut self) -> ResultEnvelope<DockerFilesReport> {
        if self.force {
            self.callbacks
                .progress
                .warning("Existing Docker files will be overwritten");
        }
        self.service
            .build_docker_files(&self.group, self.force, &self.callbacks.progress)
            .await
    }
}
