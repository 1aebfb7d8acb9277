use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::envelope::{OperationError, ResultEnvelope};
use crate::fanout::FanOutSummary;
use crate::progress::ProgressReporter;
use crate::project::ProjectGroup;
use crate::settings::{FolderAliases, ProjectSettings, TestSettings};

use super::blocking;
use super::run_tests::{RUN_TESTS_FILE, RunTestsScript};

const DOCKER_FILES_ERROR: &str = "DOCKER_FILES_ERROR";
const EXISTING_FILES: &str = "EXISTING_FILES";
const DOCKERFILE: &str = "Dockerfile";
const DOCKERIGNORE: &str = ".dockerignore";
const BUILD_SCRIPT: &str = "build_docker.sh";
const FALLBACK_LANGUAGE: &str = "python";

/// Extensions counted per language, in tie-break order.
pub const LANGUAGE_EXTENSIONS: &[(&str, &[&str])] = &[
    ("python", &[".py"]),
    ("javascript", &[".js"]),
    ("typescript", &[".ts", ".tsx"]),
    ("java", &[".java"]),
    ("rust", &[".rs"]),
    ("c", &[".c", ".h"]),
    ("go", &[".go"]),
    ("cpp", &[".cpp", ".cc", ".hpp"]),
    ("csharp", &[".cs"]),
];

/// Base image and dependency step per language.
const DOCKER_BASES: &[(&str, &str, &str)] = &[
    (
        "python",
        "python:3.11-slim",
        "RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi\n\
         RUN pip install --no-cache-dir pytest",
    ),
    ("javascript", "node:20-slim", "RUN if [ -f package.json ]; then npm install; fi"),
    ("typescript", "node:20-slim", "RUN if [ -f package.json ]; then npm install; fi"),
    ("java", "maven:3.9-eclipse-temurin-17", "RUN mvn -q -DskipTests dependency:resolve || true"),
    ("rust", "rust:1.80", "RUN cargo fetch || true"),
    ("c", "gcc:13", "RUN apt-get update && apt-get install -y cmake && rm -rf /var/lib/apt/lists/*"),
    ("go", "golang:1.22", "RUN go mod download || true"),
    ("cpp", "gcc:13", "RUN apt-get update && apt-get install -y cmake && rm -rf /var/lib/apt/lists/*"),
    ("csharp", "mcr.microsoft.com/dotnet/sdk:8.0", "RUN dotnet restore || true"),
];

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DockerFilesReport {
    pub language: String,
    pub written: Vec<PathBuf>,
    pub summary: FanOutSummary,
}

#[async_trait]
pub trait DockerFilesService: Send + Sync {
    /// Generates Docker files in the pre-edit version and copies them to
    /// every other version. Existing files are only replaced when `force`.
    async fn build_docker_files(
        &self,
        group: &ProjectGroup,
        force: bool,
        progress: &ProgressReporter,
    ) -> ResultEnvelope<DockerFilesReport>;
}

#[derive(Clone, Debug)]
pub struct TemplateDockerFiles {
    aliases: FolderAliases,
    tests: TestSettings,
    ignore_dirs: Vec<String>,
}

impl TemplateDockerFiles {
    pub fn new(aliases: FolderAliases, tests: TestSettings, project: &ProjectSettings) -> Self {
        Self {
            aliases,
            tests,
            ignore_dirs: project.ignore_dirs.clone(),
        }
    }
}

#[async_trait]
impl DockerFilesService for TemplateDockerFiles {
    async fn build_docker_files(
        &self,
        group: &ProjectGroup,
        force: bool,
        progress: &ProgressReporter,
    ) -> ResultEnvelope<DockerFilesReport> {
        let Some(source) = group.pre_edit_version(&self.aliases) else {
            return ResultEnvelope::error(
                OperationError::validation(format!("no pre-edit version of {}", group.name))
                    .with_code(DOCKER_FILES_ERROR),
            );
        };

        let existing: Vec<String> = [DOCKERFILE, DOCKERIGNORE, BUILD_SCRIPT]
            .into_iter()
            .filter(|name| source.path.join(name).exists())
            .map(str::to_string)
            .collect();
        if !existing.is_empty() && !force {
            return ResultEnvelope::error(
                OperationError::resource(
                    format!("Docker files already exist: {}", existing.join(", ")),
                    &source.path,
                )
                .with_code(EXISTING_FILES)
                .with_detail("existing_files", existing.join(",")),
            );
        }

        let root = source.path.clone();
        let ignore_dirs = self.ignore_dirs.clone();
        let detected = blocking(DOCKER_FILES_ERROR, move || detect_language(&root, &ignore_dirs)).await;
        let language = match detected {
            Ok(language) => language.unwrap_or(FALLBACK_LANGUAGE),
            Err(error) => return ResultEnvelope::error(error),
        };
        progress.info(&format!("Detected language: {language}"));

        let test_command = self.tests.test_command(language, &[]);
        let root = source.path.clone();
        let parent = source.parent.clone();
        let generated = blocking(DOCKER_FILES_ERROR, move || {
            write_docker_files(&root, &parent, language, &test_command)
        })
        .await;
        let written = match generated {
            Ok(Ok(written)) => written,
            Ok(Err(error)) => {
                return ResultEnvelope::error(
                    OperationError::resource(
                        format!("failed to write Docker files: {error}"),
                        &source.path,
                    )
                    .with_code(DOCKER_FILES_ERROR),
                );
            }
            Err(error) => return ResultEnvelope::error(error),
        };
        progress.success(&format!("Generated Docker files in {source}"));

        let mut report = DockerFilesReport {
            language: language.to_string(),
            written: written.clone(),
            summary: FanOutSummary::default(),
        };
        for target in group.non_pre_edit_versions(&self.aliases) {
            let files = written.clone();
            let destination = target.path.clone();
            match blocking(DOCKER_FILES_ERROR, move || copy_into(&files, &destination)).await {
                Ok(Ok(())) => {
                    progress.info(&format!("Copied Docker files to {target}"));
                    report.summary.succeeded(&target.relative_path);
                }
                Ok(Err(error)) => {
                    progress.warning(&format!("Failed to copy Docker files to {target}: {error}"));
                    report.summary.failed(&target.relative_path, error.to_string());
                }
                Err(error) => report.summary.failed(&target.relative_path, error.message),
            }
        }

        let summary = report.summary.clone();
        if summary.total_targets() == 0 {
            return ResultEnvelope::success(report)
                .with_message(format!("Generated Docker files for {}", group.name))
                .with_metadata("language", language);
        }
        summary
            .into_envelope(report, "copy Docker files", DOCKER_FILES_ERROR)
            .with_metadata("language", language)
    }
}

/// The language with the most matching files under `root`, skipping hidden
/// and ignored directories. `None` when no file matches.
pub fn detect_language(root: &Path, ignore_dirs: &[String]) -> Option<&'static str> {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if !name.starts_with('.') && !ignore_dirs.iter().any(|ignored| *ignored == name) {
                    pending.push(entry.path());
                }
                continue;
            }
            let matched = LANGUAGE_EXTENSIONS
                .iter()
                .find(|(_, extensions)| extensions.iter().any(|extension| name.ends_with(extension)));
            if let Some((language, _)) = matched {
                *counts.entry(*language).or_default() += 1;
            }
        }
    }

    let mut best: Option<(&'static str, usize)> = None;
    for (language, _) in LANGUAGE_EXTENSIONS {
        let count = counts.get(language).copied().unwrap_or(0);
        if count > 0 && best.is_none_or(|(_, top)| count > top) {
            best = Some((*language, count));
        }
    }
    best.map(|(language, _)| language)
}

fn dockerfile_for(language: &str) -> String {
    let (_, image, setup) = DOCKER_BASES
        .iter()
        .find(|(name, _, _)| *name == language)
        .unwrap_or(&DOCKER_BASES[0]);
    format!(
        "FROM {image}\n\
         WORKDIR /app\n\
         COPY . .\n\
         {setup}\n\
         RUN chmod +x {RUN_TESTS_FILE}\n\
         CMD [\"./{RUN_TESTS_FILE}\"]\n"
    )
}

fn dockerignore() -> &'static str {
    ".git\n.venv\nvenv\n__pycache__\n.pytest_cache\nnode_modules\ntarget\n*.zip\n"
}

fn build_script(parent: &str) -> String {
    format!(
        "#!/bin/sh\n\
         # Builds and tests the image for {parent}\n\
         set -e\n\
         docker build -t \"${{1:-project}}\" .\n\
         docker run --rm \"${{1:-project}}\" ./{RUN_TESTS_FILE}\n"
    )
}

fn write_docker_files(
    root: &Path,
    parent: &str,
    language: &str,
    test_command: &str,
) -> io::Result<Vec<PathBuf>> {
    let dockerfile = root.join(DOCKERFILE);
    fs::write(&dockerfile, dockerfile_for(language))?;
    let ignore = root.join(DOCKERIGNORE);
    fs::write(&ignore, dockerignore())?;
    let build = root.join(BUILD_SCRIPT);
    fs::write(&build, build_script(parent))?;
    let run_tests = root.join(RUN_TESTS_FILE);
    RunTestsScript {
        parent,
        language,
        selected_tests: &[],
        command: test_command,
    }
    .write_to(&run_tests)?;

    let mut written = vec![dockerfile, ignore, build, run_tests];
    if language == "python" {
        let requirements = root.join("requirements.txt");
        if !requirements.exists() {
            fs::write(&requirements, "")?;
        }
    }
    written.sort();
    Ok(written)
}

fn copy_into(files: &[PathBuf], destination: &Path) -> io::Result<()> {
    for file in files {
        let Some(name) = file.file_name() else {
            continue;
        };
        let target = destination.join(name);
        fs::copy(file, &target)?;
    }
    Ok(())
}
