use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::ResultEnvelope;
use crate::gui_bridge::SyncEvent;
use crate::project::ProjectGroup;
use crate::services::{ValidationReport, ValidationService};

use super::{Command, CommandCallbacks, Operation};

const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Archives every version of a group and runs the validator. When a ready
/// event is attached, the run waits for the UI to signal that its output
/// view is open.
pub struct ValidateCommand {
    group: ProjectGroup,
    validation: Arc<dyn ValidationService>,
    ready: Option<SyncEvent>,
    callbacks: CommandCallbacks<ValidationReport>,
}

impl ValidateCommand {
    pub fn new(
        group: ProjectGroup,
        validation: Arc<dyn ValidationService>,
        callbacks: CommandCallbacks<ValidationReport>,
    ) -> Self {
        Self {
            group,
            validation,
            ready: None,
            callbacks,
        }
    }

    pub fn wait_for(mut self, ready: SyncEvent) -> Self {
        self.ready = Some(ready);
        self
    }
}

#[async_trait]
impl Command for ValidateCommand {
    type Output = ValidationReport;

    fn operation(&self) -> Operation {
        Operation::Validate
    }

    fn subject(&self) -> String {
        self.group.name.clone()
    }

    fn callbacks(&mut self) -> &mut CommandCallbacks<ValidationReport> {
        &mut self.callbacks
    }

    async fn execute(&mut self) -> ResultEnvelope<ValidationReport> {
        let progress = &self.callbacks.progress;
        if let Some(ready) = &self.ready
            && tokio::time::timeout(READY_TIMEOUT, ready.wait()).await.is_err()
        {
            tracing::warn!(event = ready.id(), "output view never signalled ready; continuing");
        }
        progress.info(&format!("=== VALIDATION PROCESS FOR {} ===", self.group.name));
        self.validation.validate(&self.group, progress).await
    }
}
