use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::{OperationError, ResultEnvelope};
use crate::progress::ProgressReporter;
use crate::settings::ServiceSettings;

use super::{blocking, expand_command, invalid_template, run_argv};

const GIT_ERROR: &str = "GIT_ERROR";
const CLONE_TIMEOUT: Duration = Duration::from_secs(300);
const MIN_COMMIT_PREFIX: usize = 6;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GitCommit {
    pub hash: String,
    pub parents: Vec<String>,
    pub author: String,
    pub date: String,
    pub subject: String,
}

impl GitCommit {
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    pub fn display_line(&self) -> String {
        let marker = if self.is_merge() { "M" } else { " " };
        format!(
            "{marker} {} {} {:<20} {}",
            self.hash, self.date, self.author, self.subject
        )
    }
}

#[async_trait]
pub trait GitService: Send + Sync {
    async fn fetch(&self, repository: &Path, progress: &ProgressReporter) -> ResultEnvelope<String>;

    async fn history(&self, repository: &Path) -> ResultEnvelope<Vec<GitCommit>>;

    async fn checkout(&self, repository: &Path, commit: &str) -> ResultEnvelope<String>;

    /// Discards tracked and untracked local changes, then checks out `commit`.
    async fn force_checkout(&self, repository: &Path, commit: &str) -> ResultEnvelope<String>;

    /// Clones `repo_url` into `destination/name`. An existing target is a
    /// resource error.
    async fn clone_repository(
        &self,
        repo_url: &str,
        destination: &Path,
        name: &str,
        progress: &ProgressReporter,
    ) -> ResultEnvelope<PathBuf>;
}

#[derive(Clone, Debug)]
pub struct GitCli {
    fetch_command: String,
    log_command: String,
    clone_command: String,
    timeout: Duration,
}

impl GitCli {
    pub fn new(services: &ServiceSettings) -> Self {
        Self {
            fetch_command: services.git_fetch_command.clone(),
            log_command: services.git_log_command.clone(),
            clone_command: services.git_clone_command.clone(),
            timeout: services.git_timeout,
        }
    }

    async fn git(&self, repository: &Path, args: &[&str]) -> Result<pcp_shell::CommandOutput, OperationError> {
        let mut argv = vec![String::from("git")];
        argv.extend(args.iter().map(|arg| arg.to_string()));
        run_argv(repository, argv, self.timeout, None, GIT_ERROR).await
    }
}

fn missing_repository<T>(repository: &Path) -> ResultEnvelope<T> {
    ResultEnvelope::error(
        OperationError::validation(format!(
            "project path does not exist: {}",
            repository.display()
        ))
        .with_code(GIT_ERROR)
        .with_resource_path(repository),
    )
}

#[async_trait]
impl GitService for GitCli {
    async fn fetch(&self, repository: &Path, progress: &ProgressReporter) -> ResultEnvelope<String> {
        if !repository.is_dir() {
            return missing_repository(repository);
        }
        let remotes = match self.git(repository, &["remote"]).await {
            Ok(output) if output.success() => output.stdout,
            Ok(output) => {
                return ResultEnvelope::error(
                    OperationError::process_output(
                        "not a git repository",
                        output.code(),
                        &output.stdout,
                        &output.stderr,
                    )
                    .with_code(GIT_ERROR),
                );
            }
            Err(error) => return ResultEnvelope::error(error),
        };
        if remotes.trim().is_empty() {
            return ResultEnvelope::error(
                OperationError::resource("No remote repository configured", repository)
                    .with_code(GIT_ERROR),
            );
        }

        let argv = match expand_command(&self.fetch_command, &[]) {
            Ok(argv) => argv,
            Err(error) => {
                return ResultEnvelope::error(invalid_template(&self.fetch_command, error, GIT_ERROR));
            }
        };
        progress.info("Fetching latest commits...");
        match run_argv(repository, argv, self.timeout, Some(progress), GIT_ERROR).await {
            Ok(output) if output.success() => ResultEnvelope::success(output.combined())
                .with_message("Successfully fetched latest commits")
                .with_metadata("remotes", remotes.split_whitespace().collect::<Vec<_>>().join(",")),
            Ok(output) => ResultEnvelope::error(
                OperationError::process_output(
                    format!("fetch failed: {}", output.stderr.trim()),
                    output.code(),
                    &output.stdout,
                    &output.stderr,
                )
                .with_code(GIT_ERROR),
            ),
            Err(error) => ResultEnvelope::error(error),
        }
    }

    async fn history(&self, repository: &Path) -> ResultEnvelope<Vec<GitCommit>> {
        if !repository.is_dir() {
            return missing_repository(repository);
        }
        let argv = match expand_command(&self.log_command, &[]) {
            Ok(argv) => argv,
            Err(error) => {
                return ResultEnvelope::error(invalid_template(&self.log_command, error, GIT_ERROR));
            }
        };
        let output = match run_argv(repository, argv, self.timeout, None, GIT_ERROR).await {
            Ok(output) => output,
            Err(error) => return ResultEnvelope::error(error),
        };
        if !output.success() {
            return ResultEnvelope::error(
                OperationError::process_output(
                    format!("error getting git log: {}", output.stderr.trim()),
                    output.code(),
                    &output.stdout,
                    &output.stderr,
                )
                .with_code(GIT_ERROR),
            );
        }

        let stdout = output.stdout;
        let commits = match blocking(GIT_ERROR, move || parse_git_log(&stdout)).await {
            Ok(commits) => commits,
            Err(error) => return ResultEnvelope::error(error),
        };
        let message = format!("Retrieved {} commits", commits.len());
        let total = commits.len().to_string();
        ResultEnvelope::success(commits)
            .with_message(message)
            .with_metadata("total_commits", total)
    }

    async fn checkout(&self, repository: &Path, commit: &str) -> ResultEnvelope<String> {
        if let Err(envelope) = check_checkout_target(repository, commit) {
            return envelope;
        }
        let output = match self.git(repository, &["checkout", commit]).await {
            Ok(output) => output,
            Err(error) => return ResultEnvelope::error(error),
        };
        if output.success() {
            return ResultEnvelope::success(commit.to_string())
                .with_message(format!("Checked out commit {commit}"));
        }
        let error = if blocked_by_local_changes(&output.stderr) {
            OperationError::resource(
                format!("cannot checkout due to local changes: {}", output.stderr.trim()),
                repository,
            )
        } else {
            OperationError::process_output(
                format!("checkout failed: {}", output.stderr.trim()),
                output.code(),
                &output.stdout,
                &output.stderr,
            )
        };
        ResultEnvelope::error(error.with_code(GIT_ERROR))
    }

    async fn force_checkout(&self, repository: &Path, commit: &str) -> ResultEnvelope<String> {
        if let Err(envelope) = check_checkout_target(repository, commit) {
            return envelope;
        }
        let mut discarded = Vec::new();
        for args in [&["reset", "--hard"][..], &["clean", "-fd"][..]] {
            match self.git(repository, args).await {
                Ok(output) if output.success() => discarded.push(output.stdout),
                Ok(output) => {
                    tracing::warn!(
                        repository = %repository.display(),
                        step = args[0],
                        stderr = output.stderr.trim(),
                        "discarding local changes failed"
                    );
                }
                Err(error) => return ResultEnvelope::error(error),
            }
        }
        let output = match self.git(repository, &["checkout", "-f", commit]).await {
            Ok(output) => output,
            Err(error) => return ResultEnvelope::error(error),
        };
        if !output.success() {
            return ResultEnvelope::error(
                OperationError::process_output(
                    format!("force checkout failed: {}", output.stderr.trim()),
                    output.code(),
                    &output.stdout,
                    &output.stderr,
                )
                .with_code(GIT_ERROR),
            );
        }
        ResultEnvelope::success(commit.to_string())
            .with_message(format!("Force checked out commit {commit}"))
            .with_metadata("discarded", discarded.concat().trim().to_string())
    }

    async fn clone_repository(
        &self,
        repo_url: &str,
        destination: &Path,
        name: &str,
        progress: &ProgressReporter,
    ) -> ResultEnvelope<PathBuf> {
        if repo_url.trim().is_empty() {
            return ResultEnvelope::error(
                OperationError::validation("repository URL cannot be empty").with_code(GIT_ERROR),
            );
        }
        if name.trim().is_empty() {
            return ResultEnvelope::error(
                OperationError::validation("project name cannot be empty").with_code(GIT_ERROR),
            );
        }
        let target = destination.join(name);
        if target.exists() {
            return ResultEnvelope::error(
                OperationError::resource("target directory already exists", &target)
                    .with_code(GIT_ERROR),
            );
        }
        let create = destination.to_path_buf();
        match blocking(GIT_ERROR, move || std::fs::create_dir_all(create)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                return ResultEnvelope::error(
                    OperationError::resource(
                        format!("cannot create destination: {error}"),
                        destination,
                    )
                    .with_code(GIT_ERROR),
                );
            }
            Err(error) => return ResultEnvelope::error(error),
        }

        let argv = match expand_command(
            &self.clone_command,
            &[("repo_url", repo_url), ("target", name)],
        ) {
            Ok(argv) => argv,
            Err(error) => {
                return ResultEnvelope::error(invalid_template(&self.clone_command, error, GIT_ERROR));
            }
        };
        let timeout = self.timeout.max(CLONE_TIMEOUT);
        match run_argv(destination, argv, timeout, Some(progress), GIT_ERROR).await {
            Ok(output) if output.success() => ResultEnvelope::success(target.clone())
                .with_message(format!("Cloned repository to {}", target.display()))
                .with_metadata("repo_url", repo_url),
            Ok(output) => ResultEnvelope::error(
                OperationError::process_output(
                    format!("clone failed: {}", output.stderr.trim()),
                    output.code(),
                    &output.stdout,
                    &output.stderr,
                )
                .with_code(GIT_ERROR)
                .with_resource_path(&target),
            ),
            Err(error) => ResultEnvelope::error(error),
        }
    }
}

fn check_checkout_target(repository: &Path, commit: &str) -> Result<(), ResultEnvelope<String>> {
    if !repository.is_dir() {
        return Err(missing_repository(repository));
    }
    if commit.len() < MIN_COMMIT_PREFIX {
        return Err(ResultEnvelope::error(
            OperationError::validation(format!(
                "commit hash must be at least {MIN_COMMIT_PREFIX} characters"
            ))
            .with_code(GIT_ERROR),
        ));
    }
    Ok(())
}

/// Whether git refused a checkout because it would overwrite local work.
fn blocked_by_local_changes(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    ["would be overwritten", "local changes", "uncommitted changes"]
        .iter()
        .any(|marker| stderr.contains(marker))
}

/// Parses `hash|parents|author|date|subject` lines. Leading graph characters
/// are stripped and malformed lines are skipped.
pub fn parse_git_log(output: &str) -> Vec<GitCommit> {
    output
        .lines()
        .filter_map(|line| {
            let line = line
                .trim_start_matches(['*', '|', '\\', '/', '-', ' '])
                .trim();
            let mut parts = line.splitn(5, '|');
            let hash = parts.next()?.trim();
            let parents = parts.next()?;
            let author = parts.next()?.trim();
            let date = parts.next()?.trim();
            let subject = parts.next()?.trim();
            if hash.is_empty() {
                return None;
            }
            Some(GitCommit {
                hash: hash.to_string(),
                parents: parents.split_whitespace().map(str::to_string).collect(),
                author: author.to_string(),
                date: date.to_string(),
                subject: subject.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_lines_and_marks_merges() {
        let output = "a1b2c3d|e4f5a6b 0a1b2c3|Ada|2024-05-01|Merge branch 'x' | cleanup\n\
                      e4f5a6b|0a1b2c3|Grace|2024-04-30|Add parser\n\
                      garbage line\n\
                      0a1b2c3||Linus|2024-04-29|Initial commit\n";
        let commits = parse_git_log(output);
        assert_eq!(commits.len(), 3);
        assert!(commits[0].is_merge());
        assert_eq!(commits[0].subject, "Merge branch 'x' | cleanup");
        assert!(!commits[1].is_merge());
        assert!(commits[2].parents.is_empty());
        assert_eq!(commits[2].author, "Linus");
    }

    #[tokio::test]
    async fn missing_repository_is_a_validation_error() {
        let git = GitCli::new(&ServiceSettings::default());
        let envelope = git.history(Path::new("/nonexistent-pcp-repo")).await;
        let error = envelope.error_ref().expect("error should be present");
        assert_eq!(error.kind, crate::envelope::ErrorKind::Validation);
        assert_eq!(error.code(), Some("GIT_ERROR"));
    }

    #[tokio::test]
    async fn short_commit_hashes_are_rejected() {
        let git = GitCli::new(&ServiceSettings::default());
        let envelope = git.checkout(&std::env::temp_dir(), "abc").await;
        assert!(envelope.is_error());
        let envelope = git.force_checkout(&std::env::temp_dir(), "abc").await;
        assert!(envelope.is_error());
    }

    #[test]
    fn local_change_refusals_are_recognised() {
        assert!(blocked_by_local_changes(
            "error: Your local changes to the following files would be overwritten by checkout:"
        ));
        assert!(!blocked_by_local_changes(
            "error: pathspec 'deadbeef' did not match any file(s) known to git"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn force_checkout_discards_local_edits() {
        use std::fs;

        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("pcp-git-force-{stamp}"));
        fs::create_dir_all(&dir).expect("repo dir should be created");
        let root = dir.as_path();
        let sh = |script: &str| {
            std::process::Command::new("sh")
                .args(["-c", script])
                .current_dir(root)
                .output()
                .map(|output| output.status.success())
                .unwrap_or(false)
        };
        let ready = sh("git init -q && git config user.email dev@example.com \
             && git config user.name dev && echo one > notes.txt && git add notes.txt \
             && git commit -qm first && echo two > notes.txt && git commit -qam second");
        if !ready {
            let _ = fs::remove_dir_all(&dir);
            return;
        }
        let first = std::process::Command::new("git")
            .args(["rev-parse", "HEAD~1"])
            .current_dir(root)
            .output()
            .expect("git should run");
        let first = String::from_utf8_lossy(&first.stdout).trim().to_string();
        fs::write(root.join("notes.txt"), "edited\n").expect("edit should be written");
        fs::write(root.join("scratch.txt"), "untracked\n").expect("scratch should be written");

        let git = GitCli::new(&ServiceSettings::default());
        let plain = git.checkout(root, &first).await;
        let error = plain.error_ref().expect("plain checkout should be refused");
        assert_eq!(error.kind, crate::envelope::ErrorKind::Resource);

        let forced = git.force_checkout(root, &first).await;
        assert!(forced.is_success(), "{}", forced.summary());
        assert_eq!(
            fs::read_to_string(root.join("notes.txt")).expect("notes should exist"),
            "one\n"
        );
        assert!(!root.join("scratch.txt").exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
