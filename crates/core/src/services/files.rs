use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::envelope::{OperationError, ResultEnvelope};
use crate::progress::ProgressReporter;
use crate::project::Project;
use crate::settings::{ProjectSettings, ServiceSettings};

use super::{blocking, expand_command, invalid_template, run_argv_with_input};

const CLEANUP_ERROR: &str = "CLEANUP_ERROR";
const ARCHIVE_ERROR: &str = "ARCHIVE_ERROR";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CleanupItem {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CleanupScan {
    pub items: Vec<CleanupItem>,
    pub total_size: u64,
    /// Directories below the project that could not be read, with the reason.
    pub unreadable: Vec<(PathBuf, String)>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CleanupReport {
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub freed_bytes: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArchiveReport {
    pub archive_path: PathBuf,
    pub file_count: usize,
    pub archive_size: u64,
}

#[async_trait]
pub trait FileService: Send + Sync {
    async fn scan_cleanup(&self, project: &Project) -> ResultEnvelope<CleanupScan>;

    async fn cleanup(
        &self,
        project: &Project,
        progress: &ProgressReporter,
    ) -> ResultEnvelope<CleanupReport>;

    async fn create_archive(
        &self,
        project: &Project,
        archive_name: &str,
        progress: &ProgressReporter,
    ) -> ResultEnvelope<ArchiveReport>;
}

/// Cleanup and archiving on the local filesystem.
#[derive(Clone, Debug)]
pub struct LocalFileService {
    ignore_dirs: Vec<String>,
    ignore_files: Vec<String>,
    archive_command: String,
    timeout: Duration,
}

impl LocalFileService {
    pub fn new(project: &ProjectSettings, services: &ServiceSettings) -> Self {
        Self {
            ignore_dirs: project.ignore_dirs.clone(),
            ignore_files: project.ignore_files.clone(),
            archive_command: services.archive_command.clone(),
            timeout: services.default_timeout,
        }
    }
}

#[async_trait]
impl FileService for LocalFileService {
    async fn scan_cleanup(&self, project: &Project) -> ResultEnvelope<CleanupScan> {
        if !project.path.is_dir() {
            return missing_project(project, CLEANUP_ERROR);
        }
        let root = project.path.clone();
        let patterns = self.ignore_dirs.clone();
        match blocking(CLEANUP_ERROR, move || scan_cleanup_items(&root, &patterns)).await {
            Ok(Ok(scan)) => {
                let message = format!(
                    "Found {} item(s) to clean up ({} bytes)",
                    scan.items.len(),
                    scan.total_size
                );
                ResultEnvelope::success(scan).with_message(message)
            }
            Ok(Err(error)) => ResultEnvelope::error(
                OperationError::resource(format!("failed to scan project: {error}"), &project.path)
                    .with_code(CLEANUP_ERROR),
            ),
            Err(error) => ResultEnvelope::error(error),
        }
    }

    async fn cleanup(
        &self,
        project: &Project,
        progress: &ProgressReporter,
    ) -> ResultEnvelope<CleanupReport> {
        let scan = match self.scan_cleanup(project).await {
            ResultEnvelope::Success { data, .. } => data,
            other => return other.map(|_| CleanupReport::default()),
        };
        if scan.items.is_empty() {
            return ResultEnvelope::success(CleanupReport::default())
                .with_message("No items found to clean up");
        }

        for (path, reason) in &scan.unreadable {
            progress.warning(&format!("Skipped unreadable {}: {reason}", path.display()));
        }
        progress.info(&format!("Removing {} item(s)...", scan.items.len()));
        let report = match blocking(CLEANUP_ERROR, move || remove_items(scan.items)).await {
            Ok(report) => report,
            Err(error) => return ResultEnvelope::error(error),
        };
        for (path, reason) in &report.failed {
            tracing::warn!(path = %path.display(), "cleanup failed: {reason}");
        }

        let message = format!(
            "Removed {} item(s), freed {} bytes",
            report.deleted.len(),
            report.freed_bytes
        );
        if report.failed.is_empty() {
            return ResultEnvelope::success(report).with_message(message);
        }

        let mut error = OperationError::resource(
            format!("{} item(s) could not be removed", report.failed.len()),
            &project.path,
        )
        .with_code(CLEANUP_ERROR)
        .with_targets(report.failed.iter().map(|(path, _)| path.display().to_string()));
        for (path, reason) in &report.failed {
            error.details.insert(path.display().to_string(), reason.clone());
        }
        if report.deleted.is_empty() {
            ResultEnvelope::error(error)
                .with_diagnostic_data(report)
                .with_message(message)
        } else {
            ResultEnvelope::partial(report, error).with_message(message)
        }
    }

    async fn create_archive(
        &self,
        project: &Project,
        archive_name: &str,
        progress: &ProgressReporter,
    ) -> ResultEnvelope<ArchiveReport> {
        if !project.path.is_dir() {
            return missing_project(project, ARCHIVE_ERROR);
        }
        let archive_path = project.path.join(archive_name);
        let root = project.path.clone();
        let ignore_dirs = self.ignore_dirs.clone();
        let ignore_files = self.ignore_files.clone();
        let excluded = archive_name.to_string();
        let stale = archive_path.clone();
        let listed = blocking(ARCHIVE_ERROR, move || {
            if stale.is_file() {
                fs::remove_file(&stale)?;
            }
            archive_members(&root, &ignore_dirs, &ignore_files, &excluded)
        })
        .await;
        let members = match listed {
            Ok(Ok(members)) => members,
            Ok(Err(error)) => {
                return ResultEnvelope::error(
                    OperationError::resource(
                        format!("failed to collect files for archive: {error}"),
                        &project.path,
                    )
                    .with_code(ARCHIVE_ERROR),
                );
            }
            Err(error) => return ResultEnvelope::error(error),
        };
        if members.is_empty() {
            return ResultEnvelope::error(
                OperationError::validation(format!("no files to archive in {project}"))
                    .with_code(ARCHIVE_ERROR)
                    .with_resource_path(&project.path),
            );
        }

        let argv = match expand_command(&self.archive_command, &[("archive_name", archive_name)])
        {
            Ok(argv) => argv,
            Err(error) => {
                return ResultEnvelope::error(invalid_template(
                    &self.archive_command,
                    error,
                    ARCHIVE_ERROR,
                ));
            }
        };
        let file_count = members.len();
        let mut listing = members.join("\n");
        listing.push('\n');
        progress.info(&format!("Archiving {file_count} file(s) into {archive_name}..."));

        let output = match run_argv_with_input(
            &project.path,
            argv,
            Some(listing.into_bytes()),
            self.timeout,
            None,
            ARCHIVE_ERROR,
        )
        .await
        {
            Ok(output) => output,
            Err(error) => return ResultEnvelope::error(error),
        };
        if !output.success() {
            return ResultEnvelope::error(
                OperationError::process_output(
                    "archive command failed",
                    output.code(),
                    &output.stdout,
                    &output.stderr,
                )
                .with_code(ARCHIVE_ERROR),
            );
        }

        match fs::metadata(&archive_path) {
            Ok(metadata) => {
                let message = format!("Created {archive_name} with {file_count} file(s)");
                ResultEnvelope::success(ArchiveReport {
                    archive_path,
                    file_count,
                    archive_size: metadata.len(),
                })
                .with_message(message)
            }
            Err(_) => ResultEnvelope::error(
                OperationError::resource("archive command produced no archive", &archive_path)
                    .with_code(ARCHIVE_ERROR),
            ),
        }
    }
}

fn missing_project<T>(project: &Project, code: &str) -> ResultEnvelope<T> {
    ResultEnvelope::error(
        OperationError::resource(format!("project folder not found: {project}"), &project.path)
            .with_code(code),
    )
}

fn matches_cleanup_pattern(name: &str, patterns: &[String]) -> bool {
    let name = name.to_lowercase();
    patterns
        .iter()
        .any(|pattern| name.contains(&pattern.to_lowercase()))
}

/// Directories whose lowercased name contains a cleanup pattern. Matched
/// directories are not descended into. Only an unreadable `root` fails the
/// scan; unreadable subdirectories are recorded and skipped.
pub(crate) fn scan_cleanup_items(root: &Path, patterns: &[String]) -> io::Result<CleanupScan> {
    let mut scan = CleanupScan::default();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(error) if dir != root => {
                tracing::warn!(path = %dir.display(), "skipping unreadable directory: {error}");
                scan.unreadable.push((dir, error.to_string()));
                continue;
            }
            Err(error) => return Err(error),
        };
        for entry in entries {
            let Ok(entry) = entry else {
                continue;
            };
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let path = entry.path();
            if matches_cleanup_pattern(&entry.file_name().to_string_lossy(), patterns) {
                let size = directory_size(&path);
                scan.total_size += size;
                scan.items.push(CleanupItem { path, size });
            } else {
                pending.push(path);
            }
        }
    }
    scan.items.sort_by(|left, right| left.path.cmp(&right.path));
    Ok(scan)
}

fn directory_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.file_type() {
            Ok(file_type) if file_type.is_dir() => directory_size(&entry.path()),
            Ok(file_type) if file_type.is_file() => entry.metadata().map_or(0, |meta| meta.len()),
            _ => 0,
        })
        .sum()
}

fn remove_items(items: Vec<CleanupItem>) -> CleanupReport {
    let mut report = CleanupReport::default();
    for item in items {
        match fs::remove_dir_all(&item.path) {
            Ok(()) => {
                report.freed_bytes += item.size;
                report.deleted.push(item.path);
            }
            Err(error) => report.failed.push((item.path, error.to_string())),
        }
    }
    report
}

/// Relative paths of files to archive: hidden paths, paths mentioning an
/// ignore pattern and the archive itself are left out.
pub(crate) fn archive_members(
    root: &Path,
    ignore_dirs: &[String],
    ignore_files: &[String],
    archive_name: &str,
) -> io::Result<Vec<String>> {
    let mut members = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            let hidden = relative.split('/').any(|part| part.starts_with('.'));
            let ignored = ignore_dirs
                .iter()
                .chain(ignore_files)
                .any(|pattern| relative.contains(pattern.as_str()));
            if hidden || ignored || relative == archive_name {
                continue;
            }
            members.push(relative);
        }
    }
    members.sort();
    Ok(members)
}
