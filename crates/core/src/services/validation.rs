use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;

use crate::envelope::{OperationError, ResultEnvelope};
use crate::fanout::FanOutSummary;
use crate::progress::ProgressReporter;
use crate::project::{ProjectCatalog, ProjectGroup};
use crate::settings::ServiceSettings;

use super::files::FileService;
use super::{blocking, expand_command, invalid_template, run_argv};

const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
const CODEBASES_DIR: &str = "codebases";
const RESULTS_FILE: &str = "output/validation_results.csv";

static VALIDATION_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"UNIQUE VALIDATION ID:\s*([a-f0-9]+)").expect("valid validation id regex")
});
static CONTAINER_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*\|\s*").expect("valid container prefix regex"));
static BARE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-f0-9]{8,32}$").expect("valid bare id regex"));

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ValidationReport {
    pub validation_id: Option<String>,
    pub archives: Vec<PathBuf>,
    pub archive_summary: FanOutSummary,
    pub return_code: Option<i32>,
    pub results_path: Option<PathBuf>,
    pub output: String,
}

#[async_trait]
pub trait ValidationService: Send + Sync {
    /// Archives every version of `group` into the validator's codebases
    /// directory and runs the validator over them.
    async fn validate(
        &self,
        group: &ProjectGroup,
        progress: &ProgressReporter,
    ) -> ResultEnvelope<ValidationReport>;
}

pub struct ValidationRunner {
    files: Arc<dyn FileService>,
    catalog: ProjectCatalog,
    validation_dir: PathBuf,
    command: String,
    health_command: Option<String>,
    timeout: Duration,
    poll_interval: Duration,
    health_timeout: Duration,
}

impl ValidationRunner {
    pub fn new(files: Arc<dyn FileService>, catalog: ProjectCatalog, services: &ServiceSettings) -> Self {
        Self {
            files,
            catalog,
            validation_dir: services.validation_dir.clone(),
            command: services.validation_command.clone(),
            health_command: services.validation_health_command.clone(),
            timeout: services.validation_timeout,
            poll_interval: services.validation_poll_interval,
            health_timeout: services.validation_timeout,
        }
    }

    async fn prepare_codebases(&self, progress: &ProgressReporter) -> Result<PathBuf, OperationError> {
        let codebases = self.validation_dir.join(CODEBASES_DIR);
        let target = codebases.clone();
        let cleared = blocking(VALIDATION_ERROR, move || clear_archives(&target))
            .await?
            .map_err(|error| {
                OperationError::resource(format!("cannot prepare codebases: {error}"), &codebases)
                    .with_code(VALIDATION_ERROR)
            })?;
        for name in cleared {
            progress.info(&format!("Removed stale archive {name}"));
        }
        Ok(codebases)
    }

    async fn archive_versions(
        &self,
        group: &ProjectGroup,
        codebases: &Path,
        progress: &ProgressReporter,
        report: &mut ValidationReport,
    ) {
        let total = group.versions().len();
        for (index, project) in group.versions().iter().enumerate() {
            progress.info(&format!("Archiving {project} ({}/{total})", index + 1));
            let cleaned = self.files.cleanup(project, progress).await;
            if !cleaned.is_success() {
                progress.warning(&format!("Cleanup before archiving {project}: {}", cleaned.summary()));
            }

            let archive_name = self.catalog.archive_name(project);
            let archived = self.files.create_archive(project, &archive_name, progress).await;
            let Some(archive) = archived.data().filter(|_| archived.is_success()) else {
                let reason = archived.summary();
                progress.error(&format!("Failed to archive {project}: {reason}"));
                report.archive_summary.failed(&project.relative_path, reason);
                continue;
            };

            let from = archive.archive_path.clone();
            let to = codebases.join(&archive_name);
            match blocking(VALIDATION_ERROR, move || {
                move_file(&from, &to)?;
                Ok::<_, io::Error>(to)
            })
            .await
            {
                Ok(Ok(moved)) => {
                    progress.success(&format!("Moved {archive_name} to validation directory"));
                    report.archives.push(moved);
                    report.archive_summary.succeeded(&project.relative_path);
                }
                Ok(Err(error)) => {
                    progress.error(&format!("Failed to move {archive_name}: {error}"));
                    report
                        .archive_summary
                        .failed(&project.relative_path, error.to_string());
                }
                Err(error) => report
                    .archive_summary
                    .failed(&project.relative_path, error.message),
            }
        }
    }

    async fn wait_until_healthy(&self, progress: &ProgressReporter) -> Result<(), OperationError> {
        let Some(health_command) = &self.health_command else {
            return Ok(());
        };
        let started = Instant::now();
        progress.info("Waiting for the validator to become ready...");
        loop {
            let argv = expand_command(health_command, &[])
                .map_err(|error| invalid_template(health_command, error, VALIDATION_ERROR))?;
            let probe_timeout = self.poll_interval.max(Duration::from_secs(1));
            match run_argv(&self.validation_dir, argv, probe_timeout, None, VALIDATION_ERROR).await {
                Ok(output) if output.success() => return Ok(()),
                Ok(_) => {}
                Err(error) => tracing::debug!("validator health probe failed: {error}"),
            }
            if started.elapsed() >= self.health_timeout {
                return Err(OperationError::process(format!(
                    "validator not ready after {}s",
                    self.health_timeout.as_secs()
                ))
                .with_code(VALIDATION_ERROR));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl ValidationService for ValidationRunner {
    async fn validate(
        &self,
        group: &ProjectGroup,
        progress: &ProgressReporter,
    ) -> ResultEnvelope<ValidationReport> {
        if !self.validation_dir.is_dir() {
            return ResultEnvelope::error(
                OperationError::resource("validation tool directory not found", &self.validation_dir)
                    .with_code(VALIDATION_ERROR),
            );
        }
        if group.versions().is_empty() {
            return ResultEnvelope::error(
                OperationError::validation(format!("no versions found for {}", group.name))
                    .with_code(VALIDATION_ERROR),
            );
        }
        let argv = match expand_command(&self.command, &[]) {
            Ok(argv) => argv,
            Err(error) => {
                return ResultEnvelope::error(invalid_template(&self.command, error, VALIDATION_ERROR));
            }
        };

        let codebases = match self.prepare_codebases(progress).await {
            Ok(codebases) => codebases,
            Err(error) => return ResultEnvelope::error(error),
        };
        let mut report = ValidationReport::default();
        self.archive_versions(group, &codebases, progress, &mut report)
            .await;
        if report.archives.is_empty() {
            let summary = report.archive_summary.clone();
            return summary
                .into_envelope(report, "archive versions", VALIDATION_ERROR)
                .with_message("No archives were successfully created");
        }
        progress.success(&format!("Archived {} version(s)", report.archives.len()));

        if let Err(error) = self.wait_until_healthy(progress).await {
            return ResultEnvelope::error(error).with_diagnostic_data(report);
        }

        progress.info("Running validation...");
        let output = match run_argv(
            &self.validation_dir,
            argv,
            self.timeout,
            Some(progress),
            VALIDATION_ERROR,
        )
        .await
        {
            Ok(output) => output,
            Err(error) => return ResultEnvelope::error(error).with_diagnostic_data(report),
        };
        let results = self.validation_dir.join(RESULTS_FILE);
        report.results_path = results.is_file().then_some(results);
        report.return_code = output.code();
        report.output = output.combined();
        report.validation_id = extract_validation_id(&report.output);

        let validator_ok = output.success() || report.results_path.is_some();
        let archive_failures = report.archive_summary.failure_count();
        let mut envelope = if validator_ok && archive_failures == 0 {
            ResultEnvelope::success(report).with_message("Validation completed successfully")
        } else if validator_ok {
            let summary = report.archive_summary.clone();
            summary
                .into_envelope(report, "archive versions", VALIDATION_ERROR)
                .with_message("Validation completed, some versions were not archived")
        } else {
            let error = OperationError::process_output(
                "validator reported a failure",
                output.code(),
                "",
                &output.stderr,
            )
            .with_code(VALIDATION_ERROR);
            ResultEnvelope::partial(report, error).with_message("Validation completed with issues")
        };
        if let Some(id) = envelope.data().and_then(|report| report.validation_id.clone()) {
            envelope = envelope.with_metadata("validation_id", id);
        }
        envelope
    }
}

/// Finds the validation id printed by the validator, either after the
/// `UNIQUE VALIDATION ID:` marker or as a bare hex line.
pub fn extract_validation_id(output: &str) -> Option<String> {
    if let Some(captures) = VALIDATION_ID.captures(output) {
        return Some(captures[1].to_string());
    }
    output.lines().find_map(|line| {
        let cleaned = CONTAINER_PREFIX.replace(line.trim(), "");
        let cleaned = cleaned.trim();
        BARE_ID.is_match(cleaned).then(|| cleaned.to_string())
    })
}

fn clear_archives(codebases: &Path) -> io::Result<Vec<String>> {
    fs::create_dir_all(codebases)?;
    let mut removed = Vec::new();
    for entry in fs::read_dir(codebases)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|extension| extension == "zip") {
            fs::remove_file(&path)?;
            if let Some(name) = path.file_name() {
                removed.push(name.to_string_lossy().into_owned());
            }
        }
    }
    removed.sort();
    Ok(removed)
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_file(to)?;
    }
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_follows_the_marker() {
        let output = "All validations completed successfully\nUNIQUE VALIDATION ID: a1b2c3d4\n";
        assert_eq!(extract_validation_id(output).as_deref(), Some("a1b2c3d4"));

        let boxed = "║        UNIQUE VALIDATION ID: abc123def456        ║";
        assert_eq!(extract_validation_id(boxed).as_deref(), Some("abc123def456"));
    }

    #[test]
    fn bare_hex_lines_are_a_fallback() {
        let output = "codebase-validator  | starting\ncodebase-validator  | 0123456789abcdef\n";
        assert_eq!(
            extract_validation_id(output).as_deref(),
            Some("0123456789abcdef")
        );
        assert_eq!(extract_validation_id("done\nabc\n"), None);
    }

    #[test]
    fn clearing_codebases_only_removes_archives() {
        let stamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("pcp-codebases-{stamp}"));
        fs::create_dir_all(&dir).expect("temp dir should be created");
        fs::write(dir.join("b.zip"), "x").expect("archive should be written");
        fs::write(dir.join("a.zip"), "x").expect("archive should be written");
        fs::write(dir.join("notes.txt"), "x").expect("note should be written");

        let removed = clear_archives(&dir).expect("clearing should succeed");
        assert_eq!(removed, vec!["a.zip", "b.zip"]);
        assert!(dir.join("notes.txt").exists());

        fs::remove_dir_all(&dir).expect("temp dir should be removed");
    }
}
