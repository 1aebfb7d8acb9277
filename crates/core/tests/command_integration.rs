#![forbid(unsafe_code)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use pcp_core::commands::{
    AddProjectCommand, CleanupCommand, EditRunTestsCommand, EditRunTestsReport, SyncCommand,
    ValidateCommand,
};
use pcp_core::services::{
    CleanupReport, GitCommit, GitService, LocalFileService, LocalSyncService, SyncReport,
    ValidationReport, ValidationService,
};
use pcp_core::settings::{ProjectSettings, ServiceSettings, TestSettings};
use pcp_core::{
    Command, CommandCallbacks, FanOutSummary, FolderAliases, GuiBridge, OperationError, Project,
    ProjectGroup, ProgressLevel, ProgressReporter, ResultEnvelope, Status, TaskManager,
    TaskManagerConfig, TaskOutcome, submit_command,
};

fn make_temp_dir(label: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time should be monotonic")
        .as_nanos();
    let path = env::temp_dir().join(format!("pcp-command-{label}-{stamp}"));
    fs::create_dir_all(&path).expect("temp dir should be created");
    path
}

fn version(root: &Path, parent: &str, name: &str) -> Project {
    let project = Project::new(root, parent, name);
    fs::create_dir_all(&project.path).expect("version dir should be created");
    project
}

#[test]
fn sync_reports_partial_success_per_target() {
    let root = make_temp_dir("sync");
    let aliases = FolderAliases::default();
    let source = version(&root, "pre-edit", "app");
    fs::write(source.path.join("run_tests.sh"), "#!/bin/sh\npytest\n")
        .expect("source file should be written");
    let versions = vec![
        source,
        version(&root, "post-edit", "app"),
        version(&root, "post-edit2", "app"),
        version(&root, "correct-edit", "app"),
        version(&root, "scratch", "app"),
    ];
    fs::create_dir_all(root.join("post-edit2/app/run_tests.sh"))
        .expect("blocking directory should be created");
    let group = ProjectGroup::new("app", versions, &aliases);

    let manager = TaskManager::new(TaskManagerConfig::default());
    let (done_tx, done_rx) = mpsc::channel();
    let callbacks = CommandCallbacks::<SyncReport>::default().on_complete(move |envelope| {
        let _ = done_tx.send((envelope.status(), envelope.data().cloned()));
    });
    let command = SyncCommand::new(
        group,
        "run_tests.sh",
        Arc::new(LocalSyncService::new(aliases)),
        callbacks,
    );
    let handle = submit_command(&manager, command).expect("submit should succeed");
    assert_eq!(handle.name(), "sync-app");

    let (status, report) = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("sync should complete");
    assert_eq!(status, Status::Partial);
    let report = report.expect("partial result should carry the report");
    assert_eq!(report.success_count(), 3);
    assert_eq!(report.total_targets(), 4);
    assert_eq!(report.failed_syncs(), vec![String::from("post-edit2/app")]);
    for parent in ["post-edit", "correct-edit", "scratch"] {
        let copied = fs::read_to_string(root.join(parent).join("app/run_tests.sh"))
            .expect("synced file should exist");
        assert_eq!(copied, "#!/bin/sh\npytest\n");
    }

    manager.shutdown(Duration::from_secs(1));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn edit_run_tests_rewrites_every_version() {
    let root = make_temp_dir("edit-run-tests");
    let aliases = FolderAliases::default();
    let versions = vec![
        version(&root, "pre-edit", "svc"),
        version(&root, "post-edit", "svc"),
    ];
    let group = ProjectGroup::new("svc", versions, &aliases);

    let (progress_tx, progress_rx) = mpsc::channel();
    let progress = ProgressReporter::new(move |message, level| {
        let _ = progress_tx.send((message.to_string(), level));
    });
    let (done_tx, done_rx) = mpsc::channel();
    let callbacks =
        CommandCallbacks::<EditRunTestsReport>::new(progress).on_complete(move |envelope| {
            let _ = done_tx.send((envelope.status(), envelope.data().cloned()));
        });
    let command = EditRunTestsCommand::new(
        group,
        vec![String::from("tests\\test_api.py")],
        aliases,
        TestSettings::default(),
        &ProjectSettings::default(),
        callbacks,
    )
    .with_language("python");

    let manager = TaskManager::new(TaskManagerConfig::default());
    let handle = submit_command(&manager, command).expect("submit should succeed");
    let (status, report) = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("edit should complete");
    assert_eq!(status, Status::Success);
    let report = report.expect("success carries the report");
    assert_eq!(report.language, "python");
    assert_eq!(report.summary.success_count(), 2);
    assert!(report.command.contains("tests/test_api.py"));

    for parent in ["pre-edit", "post-edit"] {
        let script = fs::read_to_string(root.join(parent).join("svc/run_tests.sh"))
            .expect("script should be written");
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("tests/test_api.py"));
        assert!(!script.contains('\r'));
    }

    assert_eq!(
        handle.wait_timeout(Duration::from_secs(1)),
        Some(TaskOutcome::Completed)
    );
    let messages: Vec<(String, ProgressLevel)> = progress_rx.try_iter().collect();
    assert_eq!(
        messages.first().map(|(message, _)| message.as_str()),
        Some("Starting operation...")
    );
    assert_eq!(
        messages.last().map(|(_, level)| *level),
        Some(ProgressLevel::Success)
    );

    manager.shutdown(Duration::from_secs(1));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn cleanup_removes_cache_directories_only() {
    let root = make_temp_dir("cleanup");
    let project = version(&root, "pre-edit", "tool");
    fs::create_dir_all(project.path.join("__pycache__")).expect("cache dir should be created");
    fs::write(project.path.join("__pycache__/mod.pyc"), b"cache")
        .expect("cache file should be written");
    fs::create_dir_all(project.path.join("src")).expect("src dir should be created");
    fs::write(project.path.join("src/main.py"), "print('hi')\n")
        .expect("source file should be written");

    let files = LocalFileService::new(&ProjectSettings::default(), &ServiceSettings::default());
    let (done_tx, done_rx) = mpsc::channel();
    let callbacks = CommandCallbacks::<CleanupReport>::default().on_complete(move |envelope| {
        let _ = done_tx.send((
            envelope.status(),
            envelope.data().cloned(),
            envelope.metadata().get("project").cloned(),
        ));
    });
    let manager = TaskManager::new(TaskManagerConfig::default());
    submit_command(
        &manager,
        CleanupCommand::new(project.clone(), Arc::new(files), callbacks),
    )
    .expect("submit should succeed");

    let (status, report, subject) = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("cleanup should complete");
    assert_eq!(status, Status::Success);
    let report = report.expect("success carries the report");
    assert_eq!(report.deleted, vec![project.path.join("__pycache__")]);
    assert_eq!(report.freed_bytes, 5);
    assert_eq!(subject.as_deref(), Some("pre-edit/tool"));
    assert!(!project.path.join("__pycache__").exists());
    assert!(project.path.join("src/main.py").is_file());

    manager.shutdown(Duration::from_secs(1));
    let _ = fs::remove_dir_all(root);
}

/// Clones by creating the target directory; destinations under a folder
/// named `offline` fail like an unreachable remote.
struct LocalClones;

#[async_trait]
impl GitService for LocalClones {
    async fn fetch(&self, repository: &Path, _progress: &ProgressReporter) -> ResultEnvelope<String> {
        ResultEnvelope::error(OperationError::resource("No remote repository configured", repository))
    }

    async fn history(&self, _repository: &Path) -> ResultEnvelope<Vec<GitCommit>> {
        ResultEnvelope::success(Vec::new())
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
        if destination.ends_with("offline") {
            return ResultEnvelope::error(OperationError::process("could not resolve host"));
        }
        let target = destination.join(name);
        match fs::create_dir_all(&target) {
            Ok(()) => ResultEnvelope::success(target),
            Err(error) => ResultEnvelope::error(OperationError::resource(error.to_string(), &target)),
        }
    }
}

#[test]
fn add_project_skips_existing_targets_and_reports_failed_clones() {
    let root = make_temp_dir("add-project");
    for folder in ["pre-edit", "post-edit", "offline"] {
        fs::create_dir_all(root.join(folder)).expect("version folder should be created");
    }
    fs::create_dir_all(root.join("post-edit/widget")).expect("existing clone should be created");
    fs::write(root.join("post-edit/widget/keep.txt"), "local work\n")
        .expect("existing file should be written");

    let (done_tx, done_rx) = mpsc::channel();
    let callbacks = CommandCallbacks::<FanOutSummary>::default().on_complete(move |envelope| {
        let _ = done_tx.send((
            envelope.status(),
            envelope.data().cloned(),
            envelope.error_ref().map(|error| error.targets.clone()),
        ));
    });
    let command = AddProjectCommand::new(
        root.clone(),
        "https://example.com/acme/widget.git",
        "widget",
        Arc::new(LocalClones),
        callbacks,
    );
    let manager = TaskManager::new(TaskManagerConfig::default());
    let handle = submit_command(&manager, command).expect("submit should succeed");
    assert_eq!(handle.name(), "add-project-widget");

    let (status, summary, failed) = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("add project should complete");
    assert_eq!(status, Status::Partial);
    let summary = summary.expect("partial result should carry the summary");
    assert_eq!(summary.total_targets(), 3);
    assert_eq!(summary.succeeded_targets(), vec![String::from("pre-edit/widget")]);
    assert_eq!(summary.skipped_count(), 1);
    assert_eq!(failed, Some(vec![String::from("offline/widget")]));
    assert!(root.join("pre-edit/widget").is_dir());
    assert_eq!(
        fs::read_to_string(root.join("post-edit/widget/keep.txt")).expect("file should survive"),
        "local work\n"
    );

    manager.shutdown(Duration::from_secs(1));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn add_project_with_every_target_present_is_a_success() {
    let root = make_temp_dir("add-project-present");
    fs::create_dir_all(root.join("pre-edit/widget")).expect("existing clone should be created");

    let (done_tx, done_rx) = mpsc::channel();
    let callbacks = CommandCallbacks::<FanOutSummary>::default().on_complete(move |envelope| {
        let _ = done_tx.send((envelope.status(), envelope.data().map(FanOutSummary::skipped_count)));
    });
    let manager = TaskManager::new(TaskManagerConfig::default());
    submit_command(
        &manager,
        AddProjectCommand::new(
            root.clone(),
            "https://example.com/acme/widget.git",
            "widget",
            Arc::new(LocalClones),
            callbacks,
        ),
    )
    .expect("submit should succeed");

    let (status, skipped) = done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("add project should complete");
    assert_eq!(status, Status::Success);
    assert_eq!(skipped, Some(1));

    manager.shutdown(Duration::from_secs(1));
    let _ = fs::remove_dir_all(root);
}

/// Counts validator runs and returns a fixed report.
#[derive(Default)]
struct CountingValidator {
    runs: AtomicUsize,
}

#[async_trait]
impl ValidationService for CountingValidator {
    async fn validate(
        &self,
        group: &ProjectGroup,
        _progress: &ProgressReporter,
    ) -> ResultEnvelope<ValidationReport> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        ResultEnvelope::success(ValidationReport {
            validation_id: Some(format!("{}-1", group.name)),
            ..ValidationReport::default()
        })
    }
}

fn validation_group() -> ProjectGroup {
    let root = Path::new("/projects");
    ProjectGroup::new(
        "app",
        vec![Project::new(root, "pre-edit", "app")],
        &FolderAliases::default(),
    )
}

#[test]
fn validate_waits_for_the_ready_signal() {
    let manager = Arc::new(TaskManager::new(TaskManagerConfig::default()));
    manager.start().expect("loop should start");
    let bridge = GuiBridge::new(Arc::clone(&manager));
    let (event_id, ready) = bridge.create_sync_event();
    assert!(!ready.is_set());

    let validator = Arc::new(CountingValidator::default());
    let (done_tx, done_rx) = mpsc::channel();
    let callbacks = CommandCallbacks::<ValidationReport>::default().on_complete(move |envelope| {
        let _ = done_tx.send((envelope.status(), envelope.data().cloned()));
    });
    let command = ValidateCommand::new(
        validation_group(),
        Arc::clone(&validator) as Arc<dyn ValidationService>,
        callbacks,
    )
    .wait_for(ready);
    submit_command(&manager, command).expect("submit should succeed");

    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(validator.runs.load(Ordering::SeqCst), 0);
    assert!(done_rx.try_recv().is_err());

    bridge.signal_from_gui(&event_id);
    let (status, report) = done_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("validate should finish soon after the signal");
    assert_eq!(status, Status::Success);
    assert_eq!(
        report.and_then(|report| report.validation_id).as_deref(),
        Some("app-1")
    );
    assert_eq!(validator.runs.load(Ordering::SeqCst), 1);

    bridge.cleanup_event(&event_id);
    manager.shutdown(Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn validate_proceeds_after_thirty_seconds_without_a_signal() {
    let manager = Arc::new(TaskManager::new(TaskManagerConfig::default()));
    manager.start().expect("loop should start");
    let bridge = GuiBridge::new(Arc::clone(&manager));
    let (event_id, ready) = bridge.create_sync_event();

    let validator = Arc::new(CountingValidator::default());
    let mut command = ValidateCommand::new(
        validation_group(),
        Arc::clone(&validator) as Arc<dyn ValidationService>,
        CommandCallbacks::default(),
    )
    .wait_for(ready);

    let started = tokio::time::Instant::now();
    let envelope = command.execute().await;
    let waited = started.elapsed();
    assert!(envelope.is_success(), "{}", envelope.summary());
    assert!(waited >= Duration::from_secs(30), "waited only {waited:?}");
    assert!(waited < Duration::from_secs(31), "waited {waited:?}");
    assert_eq!(validator.runs.load(Ordering::SeqCst), 1);

    bridge.cleanup_event(&event_id);
    manager.shutdown(Duration::from_secs(1));
}
