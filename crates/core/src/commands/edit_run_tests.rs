use std::fs;
use std::io;
use std::path::Path;

use async_trait::async_trait;

use crate::envelope::{OperationError, ResultEnvelope};
use crate::fanout::FanOutSummary;
use crate::project::ProjectGroup;
use crate::services::docker_files::{LANGUAGE_EXTENSIONS, detect_language};
use crate::services::{RUN_TESTS_FILE, RunTestsScript, blocking};
use crate::settings::{FolderAliases, ProjectSettings, TestSettings};

use super::{Command, CommandCallbacks, Operation};

const TESTS_DIR: &str = "tests";
const FALLBACK_LANGUAGE: &str = "python";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EditRunTestsReport {
    pub language: String,
    pub command: String,
    pub summary: FanOutSummary,
}

/// Regenerates `run_tests.sh` in every version of a group for the selected
/// tests, recording the outcome per version.
pub struct EditRunTestsCommand {
    group: ProjectGroup,
    language: Option<String>,
    selected_tests: Vec<String>,
    aliases: FolderAliases,
    tests: TestSettings,
    ignore_dirs: Vec<String>,
    callbacks: CommandCallbacks<EditRunTestsReport>,
}

impl EditRunTestsCommand {
    pub fn new(
        group: ProjectGroup,
        selected_tests: Vec<String>,
        aliases: FolderAliases,
        tests: TestSettings,
        project: &ProjectSettings,
        callbacks: CommandCallbacks<EditRunTestsReport>,
    ) -> Self {
        Self {
            group,
            language: None,
            selected_tests,
            aliases,
            tests,
            ignore_dirs: project.ignore_dirs.clone(),
            callbacks,
        }
    }

    /// Skips language detection.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

async fn resolve_language(
    language: Option<String>,
    pre_edit: &Path,
    ignore_dirs: Vec<String>,
) -> Result<String, OperationError> {
    if let Some(language) = language {
        return Ok(language);
    }
    let root = pre_edit.to_path_buf();
    blocking(Operation::EditRunTests.error_code(), move || {
        detect_language(&root, &ignore_dirs)
            .unwrap_or(FALLBACK_LANGUAGE)
            .to_string()
    })
    .await
}

#[async_trait]
impl Command for EditRunTestsCommand {
    type Output = EditRunTestsReport;

    fn operation(&self) -> Operation {
        Operation::EditRunTests
    }

    fn subject(&self) -> String {
        self.group.name.clone()
    }

    fn callbacks(&mut self) -> &mut CommandCallbacks<EditRunTestsReport> {
        &mut self.callbacks
    }

    async fn execute(&mut self) -> ResultEnvelope<EditRunTestsReport> {
        let code = self.operation().error_code();
        let Some(pre_edit) = self.group.pre_edit_version(&self.aliases) else {
            return ResultEnvelope::error(
                OperationError::validation(format!("no pre-edit version of {}", self.group.name))
                    .with_code(code),
            );
        };
        let resolved =
            resolve_language(self.language.clone(), &pre_edit.path, self.ignore_dirs.clone()).await;
        let language = match resolved {
            Ok(language) => language,
            Err(error) => return ResultEnvelope::error(error),
        };
        let test_paths: Vec<String> = self
            .selected_tests
            .iter()
            .map(|test| test.replace('\\', "/"))
            .collect();
        let command = self.tests.test_command(&language, &test_paths);

        let progress = &self.callbacks.progress;
        progress.info(&format!("Test command: {command}"));
        let mut report = EditRunTestsReport {
            language: language.clone(),
            command: command.clone(),
            summary: FanOutSummary::default(),
        };
        for version in self.group.versions() {
            let path = version.path.join(RUN_TESTS_FILE);
            let parent = version.parent.clone();
            let language = language.clone();
            let command = command.clone();
            let selected = test_paths.clone();
            let written = blocking(code, move || {
                RunTestsScript {
                    parent: &parent,
                    language: &language,
                    selected_tests: &selected,
                    command: &command,
                }
                .write_to(&path)
            })
            .await;
            match written {
                Ok(Ok(())) => {
                    progress.info(&format!("Updated {RUN_TESTS_FILE} in {version}"));
                    report.summary.succeeded(&version.relative_path);
                }
                Ok(Err(error)) => {
                    progress.warning(&format!("Failed to update {version}: {error}"));
                    report
                        .summary
                        .failed(&version.relative_path, error.to_string());
                }
                Err(error) => report.summary.failed(&version.relative_path, error.message),
            }
        }

        let summary = report.summary.clone();
        summary
            .into_envelope(report, &format!("update {RUN_TESTS_FILE}"), code)
            .with_metadata("language", language)
    }
}

/// Test files below `<project>/tests`, as forward-slash paths relative to the
/// project: `test_*` or `*_test` files of a known language.
pub fn discover_test_files(project: &Path) -> io::Result<Vec<String>> {
    let mut found = Vec::new();
    let mut pending = vec![project.join(TESTS_DIR)];
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
            Err(error) => return Err(error),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                pending.push(path);
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some((stem, extension)) = name.rsplit_once('.') else {
                continue;
            };
            let known = LANGUAGE_EXTENSIONS
                .iter()
                .flat_map(|(_, extensions)| extensions.iter())
                .any(|known| known.trim_start_matches('.') == extension);
            if known && (stem.starts_with("test_") || stem.ends_with("_test"))
                && let Ok(relative) = path.strip_prefix(project)
            {
                found.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn make_temp_dir(label: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        let path = env::temp_dir().join(format!("pcp-edit-tests-{label}-{stamp}"));
        fs::create_dir_all(&path).expect("temp dir should be created");
        path
    }

    #[test]
    fn discovers_only_test_files_with_forward_slashes() {
        let root = make_temp_dir("discover");
        for file in [
            "tests/test_example.py",
            "tests/utils_test.py",
            "tests/unit/test_utils.py",
            "tests/not_a_test_file.py",
            "tests/conftest.py",
            "tests/helper.py",
            "src/test_outside.py",
        ] {
            let path = root.join(file);
            fs::create_dir_all(path.parent().expect("fixture should have a parent"))
                .expect("fixture dir should be created");
            fs::write(path, "").expect("fixture should be written");
        }

        let found = discover_test_files(&root).expect("discovery should succeed");
        assert_eq!(
            found,
            vec!["tests/test_example.py", "tests/unit/test_utils.py", "tests/utils_test.py"]
        );
        assert!(discover_test_files(&root.join("missing"))
            .expect("missing tests dir should be empty")
            .is_empty());

        fs::remove_dir_all(&root).expect("temp dir should be removed");
    }
}
