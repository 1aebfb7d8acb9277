use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::{OperationError, ResultEnvelope};
use crate::fanout::FanOutSummary;
use crate::project::{Project, ProjectGroup};
use crate::services::{GitCommit, GitService};

use super::{Command, CommandCallbacks, Operation};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GitView {
    pub commits: Vec<GitCommit>,
    pub fetched: bool,
    pub fetch_warning: Option<String>,
    pub checked_out: Option<String>,
}

/// Optionally fetches and checks out a commit, then reads the commit history
/// of one version. A failed fetch only produces a warning; a failed checkout
/// ends the command.
pub struct GitViewCommand {
    project: Project,
    fetch: bool,
    checkout: Option<String>,
    git: Arc<dyn GitService>,
    callbacks: CommandCallbacks<GitView>,
}

impl GitViewCommand {
    pub fn new(
        project: Project,
        fetch: bool,
        git: Arc<dyn GitService>,
        callbacks: CommandCallbacks<GitView>,
    ) -> Self {
        Self {
            project,
            fetch,
            checkout: None,
            git,
            callbacks,
        }
    }

    pub fn with_checkout(mut self, commit: impl Into<String>) -> Self {
        self.checkout = Some(commit.into());
        self
    }
}

#[async_trait]
impl Command for GitViewCommand {
    type Output = GitView;

    fn operation(&self) -> Operation {
        Operation::GitView
    }

    fn subject(&self) -> String {
        self.project.name.clone()
    }

    fn callbacks(&mut self) -> &mut CommandCallbacks<GitView> {
        &mut self.callbacks
    }

    async fn execute(&mut self) -> ResultEnvelope<GitView> {
        let progress = &self.callbacks.progress;
        let mut fetched = false;
        let mut fetch_warning = None;
        if self.fetch {
            let fetch = self.git.fetch(&self.project.path, progress).await;
            if fetch.is_success() {
                fetched = true;
            } else {
                let reason = fetch
                    .error_ref()
                    .map_or_else(|| fetch.summary(), |error| error.message.clone());
                progress.warning(&format!("Fetch skipped: {reason}"));
                fetch_warning = Some(reason);
            }
        }

        let mut checked_out = None;
        if let Some(commit) = &self.checkout {
            let checkout = self.git.checkout(&self.project.path, commit).await;
            if !checkout.is_success() {
                return checkout.map(|_| GitView::default());
            }
            progress.success(&checkout.summary());
            checked_out = Some(commit.clone());
        }

        let history = self.git.history(&self.project.path).await;
        let warning = fetch_warning.clone();
        let view = history.map(|commits| GitView {
            commits,
            fetched,
            fetch_warning,
            checked_out,
        });
        match warning {
            Some(warning) if view.is_success() => view.with_metadata("fetch_warning", warning),
            _ => view,
        }
    }
}

/// Checks out one commit in every version of a group, fetching each version
/// first when asked. A failed fetch is only a warning; each checkout outcome
/// is recorded per version.
pub struct GitCheckoutAllCommand {
    group: ProjectGroup,
    commit: String,
    fetch: bool,
    force: bool,
    git: Arc<dyn GitService>,
    callbacks: CommandCallbacks<FanOutSummary>,
}

impl GitCheckoutAllCommand {
    pub fn new(
        group: ProjectGroup,
        commit: impl Into<String>,
        git: Arc<dyn GitService>,
        callbacks: CommandCallbacks<FanOutSummary>,
    ) -> Self {
        Self {
            group,
            commit: commit.into(),
            fetch: true,
            force: false,
            git,
            callbacks,
        }
    }

    pub fn without_fetch(mut self) -> Self {
        self.fetch = false;
        self
    }

    /// Discards local changes in each version instead of refusing the checkout.
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

#[async_trait]
impl Command for GitCheckoutAllCommand {
    type Output = FanOutSummary;

    fn operation(&self) -> Operation {
        Operation::GitCheckoutAll
    }

    fn subject(&self) -> String {
        self.group.name.clone()
    }

    fn callbacks(&mut self) -> &mut CommandCallbacks<FanOutSummary> {
        &mut self.callbacks
    }

    async fn execute(&mut self) -> ResultEnvelope<FanOutSummary> {
        let code = self.operation().error_code();
        if self.commit.trim().is_empty() {
            return ResultEnvelope::error(
                OperationError::validation("a commit to check out is required").with_code(code),
            );
        }

        let progress = &self.callbacks.progress;
        let total = self.group.versions().len();
        let mut summary = FanOutSummary::default();
        for (index, version) in self.group.versions().iter().enumerate() {
            let target_id = version.relative_path.clone();
            progress.info(&format!("Processing {target_id} ({}/{total})", index + 1));
            if self.fetch {
                let fetch = self.git.fetch(&version.path, progress).await;
                if let Some(error) = fetch.error_ref() {
                    progress.warning(&format!("{target_id}: fetch skipped: {}", error.message));
                }
            }

            let checkout = if self.force {
                self.git.force_checkout(&version.path, &self.commit).await
            } else {
                self.git.checkout(&version.path, &self.commit).await
            };
            match checkout.error_ref() {
                None => {
                    progress.success(&format!("{target_id}: {}", checkout.summary()));
                    summary.succeeded(target_id);
                }
                Some(error) => {
                    progress.error(&format!("{target_id}: {}", error.message));
                    summary.failed(target_id, error.message.clone());
                }
            }
        }

        summary
            .clone()
            .into_envelope(summary, &format!("checkout {}", self.commit), code)
            .with_metadata("commit", self.commit.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    use crate::progress::ProgressReporter;
    use crate::settings::FolderAliases;

    struct OfflineGit;

    #[async_trait]
    impl GitService for OfflineGit {
        async fn fetch(&self, repository: &Path, _progress: &ProgressReporter) -> ResultEnvelope<String> {
            ResultEnvelope::error(OperationError::resource(
                "No remote repository configured",
                repository,
            ))
        }

        async fn history(&self, _repository: &Path) -> ResultEnvelope<Vec<GitCommit>> {
            ResultEnvelope::success(vec![GitCommit {
                hash: String::from("a1b2c3d"),
                parents: Vec::new(),
                author: String::from("Ada"),
                date: String::from("2024-05-01"),
                subject: String::from("Initial commit"),
            }])
        }

        async fn checkout(&self, _repository: &Path, commit: &str) -> ResultEnvelope<String> {
            ResultEnvelope::success(commit.to_string())
        }

        async fn force_checkout(&self, _repository: &Path, commit: &str) -> ResultEnvelope<String> {
            ResultEnvelope::success(commit.to_string())
        }

        async fn clone_repository(
            &self,
            _repo_url: &str,
            destination: &Path,
            name: &str,
            _progress: &ProgressReporter,
        ) -> ResultEnvelope<PathBuf> {
            ResultEnvelope::success(destination.join(name))
        }
    }

    #[tokio::test]
    async fn missing_remote_does_not_fail_the_view() {
        let project = Project::new(Path::new("/repos"), "pre-edit", "app");
        let mut command = GitViewCommand::new(
            project,
            true,
            Arc::new(OfflineGit),
            CommandCallbacks::default(),
        );
        assert_eq!(command.task_name(), "git-app");

        let envelope = command.execute().await;
        assert!(envelope.is_success());
        assert_eq!(
            envelope.metadata().get("fetch_warning").map(String::as_str),
            Some("No remote repository configured")
        );
        let view = envelope.into_data().expect("view should be present");
        assert!(!view.fetched);
        assert_eq!(view.commits.len(), 1);
    }

    #[tokio::test]
    async fn checkout_runs_before_history() {
        let project = Project::new(Path::new("/repos"), "post-edit", "app");
        let mut command = GitViewCommand::new(
            project,
            false,
            Arc::new(OfflineGit),
            CommandCallbacks::default(),
        )
        .with_checkout("a1b2c3d");

        let view = command
            .execute()
            .await
            .into_data()
            .expect("view should be present");
        assert_eq!(view.checked_out.as_deref(), Some("a1b2c3d"));
        assert!(view.fetch_warning.is_none());
    }

    /// Refuses plain checkouts in folders named `dirty`; forced ones always
    /// go through.
    #[derive(Default)]
    struct DirtyGit {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GitService for DirtyGit {
        async fn fetch(&self, repository: &Path, _progress: &ProgressReporter) -> ResultEnvelope<String> {
            self.calls.lock().expect("calls lock").push(format!("fetch {}", repository.display()));
            ResultEnvelope::error(OperationError::resource("No remote repository configured", repository))
        }

        async fn history(&self, _repository: &Path) -> ResultEnvelope<Vec<GitCommit>> {
            ResultEnvelope::success(Vec::new())
        }

        async fn checkout(&self, repository: &Path, commit: &str) -> ResultEnvelope<String> {
            self.calls.lock().expect("calls lock").push(format!("checkout {}", repository.display()));
            if repository.starts_with("/repos/dirty") {
                return ResultEnvelope::error(OperationError::resource(
                    "cannot checkout due to local changes",
                    repository,
                ));
            }
            ResultEnvelope::success(commit.to_string())
        }

        async fn force_checkout(&self, repository: &Path, commit: &str) -> ResultEnvelope<String> {
            self.calls.lock().expect("calls lock").push(format!("force {}", repository.display()));
            ResultEnvelope::success(commit.to_string())
        }

        async fn clone_repository(
            &self,
            _repo_url: &str,
            destination: &Path,
            name: &str,
            _progress: &ProgressReporter,
        ) -> ResultEnvelope<PathBuf> {
            ResultEnvelope::success(destination.join(name))
        }
    }

    fn group(parents: &[&str]) -> ProjectGroup {
        let root = Path::new("/repos");
        let versions = parents
            .iter()
            .map(|parent| Project::new(root, parent, "app"))
            .collect();
        ProjectGroup::new("app", versions, &FolderAliases::default())
    }

    #[tokio::test]
    async fn checkout_all_is_partial_when_some_versions_refuse() {
        let git = Arc::new(DirtyGit::default());
        let mut command = GitCheckoutAllCommand::new(
            group(&["clean", "dirty"]),
            "a1b2c3d",
            Arc::clone(&git) as Arc<dyn GitService>,
            CommandCallbacks::default(),
        );
        assert_eq!(command.task_name(), "git-checkout-all-app");

        let envelope = command.execute().await;
        assert!(envelope.is_partial());
        let error = envelope.error_ref().expect("error should be present");
        assert_eq!(error.code(), Some("GIT_CHECKOUT_ALL_ERROR"));
        assert_eq!(error.targets, vec![String::from("dirty/app")]);
        let summary = envelope.data().expect("summary should be present");
        assert_eq!(summary.succeeded_targets(), vec![String::from("clean/app")]);

        let calls = git.calls.lock().expect("calls lock");
        let fetches = calls.iter().filter(|call| call.starts_with("fetch")).count();
        assert_eq!(fetches, 2, "a failed fetch must not stop the checkout: {calls:?}");
    }

    #[tokio::test]
    async fn forced_checkout_all_skips_fetch_and_succeeds() {
        let git = Arc::new(DirtyGit::default());
        let mut command = GitCheckoutAllCommand::new(
            group(&["clean", "dirty"]),
            "a1b2c3d",
            Arc::clone(&git) as Arc<dyn GitService>,
            CommandCallbacks::default(),
        )
        .without_fetch()
        .forced();

        let envelope = command.execute().await;
        assert!(envelope.is_success(), "{}", envelope.summary());
        assert_eq!(envelope.metadata().get("commit").map(String::as_str), Some("a1b2c3d"));
        let calls = git.calls.lock().expect("calls lock");
        assert!(calls.iter().all(|call| call.starts_with("force")), "{calls:?}");
    }

    #[tokio::test]
    async fn checkout_all_without_a_commit_is_a_validation_error() {
        let mut command = GitCheckoutAllCommand::new(
            group(&["clean"]),
            "  ",
            Arc::new(OfflineGit),
            CommandCallbacks::default(),
        );
        let envelope = command.execute().await;
        let error = envelope.error_ref().expect("error should be present");
        assert_eq!(error.kind, crate::envelope::ErrorKind::Validation);
    }
}
