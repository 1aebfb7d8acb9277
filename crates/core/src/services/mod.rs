//! Collaborators that perform the filesystem and subprocess work behind each
//! command. All blocking work goes through the shared executor pool.

pub mod docker;
pub mod docker_files;
pub mod files;
pub mod git;
pub mod sync;
pub mod validation;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pcp_shell::{CommandOptions, CommandOutput, OutputStream};

use crate::envelope::OperationError;
use crate::error::ExecutorError;
use crate::executor::{run_cancellable_in_executor, run_in_executor};
use crate::progress::ProgressReporter;

pub use docker::{DockerCli, DockerReport, DockerService, analyze_test_results};
pub use docker_files::{DockerFilesReport, DockerFilesService, TemplateDockerFiles, detect_language};
pub use files::{
    ArchiveReport, CleanupItem, CleanupReport, CleanupScan, FileService, LocalFileService,
};
pub use git::{GitCli, GitCommit, GitService, parse_git_log};
pub use run_tests::{RUN_TESTS_FILE, RunTestsScript};
pub use sync::{LocalSyncService, SyncReport, SyncService};
pub use validation::{ValidationReport, ValidationRunner, ValidationService, extract_validation_id};

/// Splits `template` into argv and then substitutes `{key}` placeholders in
/// every argument, so substituted values are never re-split.
pub fn expand_command(template: &str, values: &[(&str, &str)]) -> io::Result<Vec<String>> {
    let mut argv = pcp_shell::split_command_line(template)?;
    for arg in &mut argv {
        for (key, value) in values {
            let placeholder = format!("{{{key}}}");
            if arg.contains(&placeholder) {
                *arg = arg.replace(&placeholder, value);
            }
        }
    }
    Ok(argv)
}

pub(crate) fn invalid_template(template: &str, error: io::Error, code: &str) -> OperationError {
    OperationError::validation(format!("invalid command template `{template}`: {error}"))
        .with_code(code)
}

pub(crate) fn executor_failure(error: ExecutorError, code: &str) -> OperationError {
    OperationError::process(error.to_string()).with_code(code)
}

/// Runs a filesystem closure on the executor pool, folding executor failures
/// into an [`OperationError`].
pub(crate) async fn blocking<F, R>(code: &str, work: F) -> Result<R, OperationError>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    run_in_executor(work)
        .await
        .map_err(|error| executor_failure(error, code))
}

/// Runs `argv` in `cwd` on the executor pool. Output is streamed line by line
/// to `progress` when given. Dropping the future kills the child.
pub(crate) async fn run_argv(
    cwd: &Path,
    argv: Vec<String>,
    timeout: Duration,
    progress: Option<&ProgressReporter>,
    code: &str,
) -> Result<CommandOutput, OperationError> {
    run_argv_with_input(cwd, argv, None, timeout, progress, code).await
}

/// [`run_argv`] with `input` written to the child's stdin.
pub(crate) async fn run_argv_with_input(
    cwd: &Path,
    argv: Vec<String>,
    input: Option<Vec<u8>>,
    timeout: Duration,
    progress: Option<&ProgressReporter>,
    code: &str,
) -> Result<CommandOutput, OperationError> {
    let label = argv.join(" ");
    let cwd: PathBuf = cwd.to_path_buf();
    let progress = progress.cloned();
    tracing::debug!(command = %label, cwd = %cwd.display(), "running command");

    let joined = run_cancellable_in_executor(move |cancel| {
        let Some((program, args)) = argv.split_first() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "command line is empty",
            ));
        };
        let options = CommandOptions {
            cancel_flag: Some(cancel.as_ref()),
            timeout: Some(timeout),
            stdin: input.as_deref(),
        };
        match progress {
            Some(progress) => {
                let mut forward = |_stream: OutputStream, chunk: &str| progress.output(chunk);
                pcp_shell::run_command(&cwd, program, args, options, Some(&mut forward))
            }
            None => pcp_shell::run_command(&cwd, program, args, options, None),
        }
    })
    .await;

    match joined {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) if error.kind() == io::ErrorKind::TimedOut => Err(OperationError::process(
            format!("`{label}` timed out after {}s", timeout.as_secs()),
        )
        .with_code(code)),
        Ok(Err(error)) => {
            Err(OperationError::process(format!("failed to run `{label}`: {error}")).with_code(code))
        }
        Err(error) => Err(executor_failure(error, code)),
    }
}
