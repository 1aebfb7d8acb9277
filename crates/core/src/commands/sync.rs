use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::ResultEnvelope;
use crate::project::ProjectGroup;
use crate::services::{SyncReport, SyncService};

use super::{Command, CommandCallbacks, Operation};

/// Copies one file from the pre-edit version to every other version.
pub struct SyncCommand {
    group: ProjectGroup,
    file_name: String,
    sync: Arc<dyn SyncService>,
    callbacks: CommandCallbacks<SyncReport>,
}

impl SyncCommand {
    pub fn new(
        group: ProjectGroup,
        file_name: impl Into<String>,
        sync: Arc<dyn SyncService>,
        callbacks: CommandCallbacks<SyncReport>,
    ) -> Self {
        Self {
            group,
            file_name: file_name.into(),
            sync,
            callbacks,
        }
    }
}

#[async_trait]
impl Command for SyncCommand {
    type Output = SyncReport;

    fn operation(&self) -> Operation {
        Operation::Sync
    }

    fn subject(&self) -> String {
        self.group.name.clone()
    }

    fn callbacks(&mut self) -> &mut CommandCallbacks<SyncReport> {
        &mut self.callbacks
    }

    async fn execute(&mut self) -> ResultEnvelope<SyncReport> {
        self.sync
            .sync_file(&self.group, &self.file_name, &self.callbacks.progress)
            .await
    }
}
