use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::ResultEnvelope;
use crate::project::Project;
use crate::services::{DockerReport, DockerService};

use super::{Command, CommandCallbacks, Operation};

pub struct DockerBuildCommand {
    project: Project,
    tag: String,
    docker: Arc<dyn DockerService>,
    callbacks: CommandCallbacks<DockerReport>,
}

impl DockerBuildCommand {
    pub fn new(
        project: Project,
        tag: impl Into<String>,
        docker: Arc<dyn DockerService>,
        callbacks: CommandCallbacks<DockerReport>,
    ) -> Self {
        Self {
            project,
            tag: tag.into(),
            docker,
            callbacks,
        }
    }
}

#[async_trait]
impl Command for DockerBuildCommand {
    type Output = DockerReport;

    fn operation(&self) -> Operation {
        Operation::DockerBuild
    }

    fn subject(&self) -> String {
        self.project.name.clone()
    }

    fn callbacks(&mut self) -> &mut CommandCallbacks<DockerReport> {
        &mut self.callbacks
    }

    async fn execute(&mut self) -> ResultEnvelope<DockerReport> {
        self.docker
            .build_and_test(&self.project, &self.tag, &self.callbacks.progress)
            .await
            .with_metadata("tag", self.tag.clone())
    }
}
