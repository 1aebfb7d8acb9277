use std::fs;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use filetime::FileTime;

use crate::envelope::{OperationError, ResultEnvelope};
use crate::fanout::FanOutSummary;
use crate::progress::ProgressReporter;
use crate::project::ProjectGroup;
use crate::settings::FolderAliases;

use super::blocking;

const SYNC_ERROR: &str = "SYNC_ERROR";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SyncReport {
    pub file_name: String,
    pub source: String,
    pub summary: FanOutSummary,
}

impl SyncReport {
    pub fn success_count(&self) -> usize {
        self.summary.success_count()
    }

    pub fn total_targets(&self) -> usize {
        self.summary.total_targets()
    }

    /// Ids (`parent/name`) of the versions the file could not be copied to.
    pub fn failed_syncs(&self) -> Vec<String> {
        self.summary.failed_targets()
    }
}

#[async_trait]
pub trait SyncService: Send + Sync {
    /// Copies `file_name` from the pre-edit version to every other version.
    async fn sync_file(
        &self,
        group: &ProjectGroup,
        file_name: &str,
        progress: &ProgressReporter,
    ) -> ResultEnvelope<SyncReport>;
}

#[derive(Clone, Debug)]
pub struct LocalSyncService {
    aliases: FolderAliases,
}

impl LocalSyncService {
    pub fn new(aliases: FolderAliases) -> Self {
        Self { aliases }
    }
}

#[async_trait]
impl SyncService for LocalSyncService {
    async fn sync_file(
        &self,
        group: &ProjectGroup,
        file_name: &str,
        progress: &ProgressReporter,
    ) -> ResultEnvelope<SyncReport> {
        let Some(source) = group.pre_edit_version(&self.aliases) else {
            return ResultEnvelope::error(
                OperationError::validation(format!("no pre-edit version of {}", group.name))
                    .with_code(SYNC_ERROR),
            );
        };
        let source_file = source.path.join(file_name);
        if !source_file.is_file() {
            return ResultEnvelope::error(
                OperationError::resource(
                    format!("{file_name} not found in {source}"),
                    &source_file,
                )
                .with_code(SYNC_ERROR),
            );
        }

        let mut report = SyncReport {
            file_name: file_name.to_string(),
            source: source.relative_path.clone(),
            summary: FanOutSummary::default(),
        };
        for target in group.non_pre_edit_versions(&self.aliases) {
            let from = source_file.clone();
            let to = target.path.join(file_name);
            match blocking(SYNC_ERROR, move || copy_preserving_mtime(&from, &to)).await {
                Ok(Ok(())) => {
                    progress.info(&format!("Synced {file_name} to {target}"));
                    report.summary.succeeded(&target.relative_path);
                }
                Ok(Err(error)) => {
                    progress.warning(&format!("Failed to sync {file_name} to {target}: {error}"));
                    report.summary.failed(&target.relative_path, error.to_string());
                }
                Err(error) => report.summary.failed(&target.relative_path, error.message),
            }
        }

        let summary = report.summary.clone();
        summary
            .into_envelope(report, &format!("sync {file_name}"), SYNC_ERROR)
            .with_metadata("file_name", file_name)
    }
}

fn copy_preserving_mtime(from: &Path, to: &Path) -> io::Result<()> {
    if to.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} is a directory", to.display()),
        ));
    }
    fs::copy(from, to)?;
    let modified = FileTime::from_last_modification_time(&fs::metadata(from)?);
    filetime::set_file_mtime(to, modified)
}
