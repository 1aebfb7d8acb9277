use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::{OperationError, ResultEnvelope};
use crate::fanout::FanOutSummary;
use crate::project::visible_subdirectories;
use crate::services::{GitService, blocking};

use super::{Command, CommandCallbacks, Operation};

/// Clones one repository into `<source_dir>/<version>/<name>` for every
/// version folder. Existing targets are skipped, not overwritten.
pub struct AddProjectCommand {
    source_dir: PathBuf,
    repo_url: String,
    name: String,
    git: Arc<dyn GitService>,
    callbacks: CommandCallbacks<FanOutSummary>,
}

impl AddProjectCommand {
    pub fn new(
        source_dir: impl Into<PathBuf>,
        repo_url: impl Into<String>,
        name: impl Into<String>,
        git: Arc<dyn GitService>,
        callbacks: CommandCallbacks<FanOutSummary>,
    ) -> Self {
        Self {
            source_dir: source_dir.into(),
            repo_url: repo_url.into(),
            name: name.into(),
            git,
            callbacks,
        }
    }
}

#[async_trait]
impl Command for AddProjectCommand {
    type Output = FanOutSummary;

    fn operation(&self) -> Operation {
        Operation::AddProject
    }

    fn subject(&self) -> String {
        self.name.clone()
    }

    fn callbacks(&mut self) -> &mut CommandCallbacks<FanOutSummary> {
        &mut self.callbacks
    }

    async fn execute(&mut self) -> ResultEnvelope<FanOutSummary> {
        let code = self.operation().error_code();
        if self.repo_url.trim().is_empty() || self.name.trim().is_empty() {
            return ResultEnvelope::error(
                OperationError::validation("repository URL and project name are required")
                    .with_code(code),
            );
        }

        let root = self.source_dir.clone();
        let folders = match blocking(code, move || visible_subdirectories(&root)).await {
            Ok(Ok(folders)) => folders,
            Ok(Err(error)) => {
                return ResultEnvelope::error(
                    OperationError::resource(
                        format!("cannot list version folders: {error}"),
                        &self.source_dir,
                    )
                    .with_code(code),
                );
            }
            Err(error) => return ResultEnvelope::error(error),
        };

        let progress = &self.callbacks.progress;
        let mut summary = FanOutSummary::default();
        for folder in folders {
            let destination = self.source_dir.join(&folder);
            let target_id = format!("{folder}/{}", self.name);
            if destination.join(&self.name).exists() {
                progress.warning(&format!("Skipping {target_id}: already exists"));
                summary.skipped(target_id, "already exists");
                continue;
            }
            progress.info(&format!("Cloning into {target_id}..."));
            let cloned = self
                .git
                .clone_repository(&self.repo_url, &destination, &self.name, progress)
                .await;
            match cloned.error_ref() {
                None => summary.succeeded(target_id),
                Some(error) => {
                    progress.error(&format!("Clone into {target_id} failed: {}", error.message));
                    summary.failed(target_id, error.message.clone());
                }
            }
        }

        summary
            .clone()
            .into_envelope(summary, &format!("clone {}", self.name), code)
            .with_metadata("repo_url", self.repo_url.clone())
    }
}

/// Repository name from its URL: the last path segment without `.git`.
pub fn project_name_from_url(repo_url: &str) -> Option<String> {
    let trimmed = repo_url.trim().trim_end_matches('/');
    let last = trimmed.rsplit(['/', ':']).next()?;
    let name = last.strip_suffix(".git").unwrap_or(last);
    (!name.is_empty()).then(|| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_come_from_the_last_url_segment() {
        assert_eq!(
            project_name_from_url("https://github.com/acme/widget.git").as_deref(),
            Some("widget")
        );
        assert_eq!(
            project_name_from_url("git@github.com:acme/widget").as_deref(),
            Some("widget")
        );
        assert_eq!(project_name_from_url("git@host:repo.git/").as_deref(), Some("repo"));
        assert_eq!(project_name_from_url("   "), None);
    }
}
