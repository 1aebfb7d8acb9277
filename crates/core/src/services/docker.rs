use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::envelope::{OperationError, ResultEnvelope};
use crate::progress::ProgressReporter;
use crate::project::Project;
use crate::settings::ServiceSettings;

use super::{expand_command, invalid_template, run_argv};

const DOCKER_ERROR: &str = "DOCKER_ERROR";

const TEST_OUTPUT_MARKERS: &[&str] = &["collected", "passed", "failed", "error", "::test_", "pytest"];

static FAILED_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+failed").expect("valid failed-count regex"));

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DockerReport {
    pub tag: String,
    pub build_output: String,
    pub test_output: String,
    pub test_status: String,
    pub return_code: Option<i32>,
}

#[async_trait]
pub trait DockerService: Send + Sync {
    /// Builds the project image and runs its tests inside it.
    async fn build_and_test(
        &self,
        project: &Project,
        tag: &str,
        progress: &ProgressReporter,
    ) -> ResultEnvelope<DockerReport>;
}

#[derive(Clone, Debug)]
pub struct DockerCli {
    build_command: String,
    test_command: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(services: &ServiceSettings) -> Self {
        Self {
            build_command: services.docker_build_command.clone(),
            test_command: services.docker_test_command.clone(),
            timeout: services.docker_timeout,
        }
    }
}

#[async_trait]
impl DockerService for DockerCli {
    async fn build_and_test(
        &self,
        project: &Project,
        tag: &str,
        progress: &ProgressReporter,
    ) -> ResultEnvelope<DockerReport> {
        if !project.path.join("Dockerfile").is_file() {
            return ResultEnvelope::error(
                OperationError::validation(format!("no Dockerfile in {project}"))
                    .with_code(DOCKER_ERROR)
                    .with_resource_path(&project.path),
            );
        }
        let values = [("tag", tag)];
        let build = match expand_command(&self.build_command, &values) {
            Ok(argv) => argv,
            Err(error) => {
                return ResultEnvelope::error(invalid_template(&self.build_command, error, DOCKER_ERROR));
            }
        };
        let test = match expand_command(&self.test_command, &values) {
            Ok(argv) => argv,
            Err(error) => {
                return ResultEnvelope::error(invalid_template(&self.test_command, error, DOCKER_ERROR));
            }
        };

        progress.info(&format!("Building image {tag}..."));
        let built = match run_argv(&project.path, build, self.timeout, Some(progress), DOCKER_ERROR).await
        {
            Ok(output) => output,
            Err(error) => return ResultEnvelope::error(error),
        };
        if !built.success() {
            progress.error("Docker build failed");
            return ResultEnvelope::error(
                OperationError::process_output(
                    format!("docker build failed for {tag}"),
                    built.code(),
                    &built.stdout,
                    &built.stderr,
                )
                .with_code(DOCKER_ERROR),
            );
        }
        progress.success("Docker build completed");

        progress.info("Running tests in container...");
        let tested = match run_argv(&project.path, test, self.timeout, Some(progress), DOCKER_ERROR).await
        {
            Ok(output) => output,
            Err(error) => return ResultEnvelope::error(error),
        };
        let test_status = analyze_test_results(&tested.stdout, &tested.stderr, tested.code());
        let report = DockerReport {
            tag: tag.to_string(),
            build_output: built.combined(),
            test_output: tested.combined(),
            test_status: test_status.clone(),
            return_code: tested.code(),
        };

        if tested.success() {
            progress.success(&format!("Tests finished: {test_status}"));
            ResultEnvelope::success(report)
                .with_message(format!("Build and test completed: {test_status}"))
                .with_metadata("test_status", test_status)
        } else {
            progress.warning(&format!("Tests finished: {test_status}"));
            let error = OperationError::process_output(
                format!("tests exited unsuccessfully: {test_status}"),
                tested.code(),
                "",
                &tested.stderr,
            )
            .with_code(DOCKER_ERROR);
            ResultEnvelope::partial(report, error)
                .with_message(format!("Build succeeded, tests reported: {test_status}"))
                .with_metadata("test_status", test_status)
        }
    }
}

/// Classifies pytest-style output into a short status line.
pub fn analyze_test_results(stdout: &str, stderr: &str, return_code: Option<i32>) -> String {
    let text = format!("{stdout}{stderr}").to_lowercase();
    let succeeded = return_code == Some(0);

    let status = if !TEST_OUTPUT_MARKERS.iter().any(|marker| text.contains(marker)) {
        if succeeded {
            "COMPLETED (No Output)"
        } else {
            "FAILED TO RUN"
        }
    } else if text.contains("passed") && text.contains("failed") {
        let none_failed = FAILED_COUNT
            .captures(&text)
            .and_then(|captures| captures[1].parse::<u64>().ok())
            == Some(0);
        if none_failed {
            "COMPLETED (All Tests Passed)"
        } else {
            "COMPLETED (Some Tests Failed)"
        }
    } else if text.contains("failed") {
        "COMPLETED (All Tests Failed)"
    } else if text.contains("passed") {
        "COMPLETED (All Tests Passed)"
    } else if succeeded {
        "COMPLETED (Success)"
    } else {
        "COMPLETED (With Issues)"
    };
    status.to_string()
}
