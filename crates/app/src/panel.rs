use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use pcp_core::commands::{
    AddProjectCommand, ArchiveCommand, BuildDockerFilesCommand, CleanupCommand,
    DockerBuildCommand, EditRunTestsCommand, GitCheckoutAllCommand, GitViewCommand, SyncCommand, ValidateCommand,
    discover_test_files, project_name_from_url,
};
use pcp_core::services::{
    DockerCli, DockerFilesService, DockerService, FileService, GitCli, GitService,
    LocalFileService, LocalSyncService, SyncService, TemplateDockerFiles, ValidationRunner,
    ValidationService,
};
use pcp_core::{
    Command, CommandCallbacks, GuiBridge, GuiEvent, GuiReceiver, GuiSender, Project,
    ProjectCatalog, ProjectGroup, ResultEnvelope, Settings, Status, TaskManager,
    TaskManagerConfig, gui_channel, submit_command,
};

/// Headless control panel. The calling thread plays the UI thread: it owns
/// the receiving end of the event queue and runs every `Invoke` it drains.
pub(crate) struct ControlPanel {
    settings: Settings,
    catalog: ProjectCatalog,
    manager: Arc<TaskManager>,
    bridge: GuiBridge,
    sender: GuiSender,
    receiver: GuiReceiver,
    tick_rate: Duration,
    files: Arc<dyn FileService>,
    docker: Arc<dyn DockerService>,
    git: Arc<dyn GitService>,
    sync: Arc<dyn SyncService>,
    validation: Arc<dyn ValidationService>,
    docker_files: Arc<dyn DockerFilesService>,
}

impl ControlPanel {
    pub(crate) fn new(settings: Settings) -> Result<Self> {
        let manager = Arc::new(TaskManager::new(TaskManagerConfig {
            startup_timeout: settings.runtime.startup_timeout,
            shutdown_timeout: settings.runtime.shutdown_timeout,
            ..TaskManagerConfig::default()
        }));
        manager
            .start()
            .context("failed to start the background loop")?;
        let bridge = GuiBridge::new(Arc::clone(&manager));
        let (sender, receiver) = gui_channel();

        let catalog = ProjectCatalog::new(
            settings.project.source_dir.clone(),
            settings.aliases.clone(),
        );
        let files: Arc<dyn FileService> =
            Arc::new(LocalFileService::new(&settings.project, &settings.services));
        let validation = Arc::new(ValidationRunner::new(
            Arc::clone(&files),
            catalog.clone(),
            &settings.services,
        ));
        let docker_files = Arc::new(TemplateDockerFiles::new(
            settings.aliases.clone(),
            settings.tests.clone(),
            &settings.project,
        ));

        Ok(Self {
            tick_rate: Duration::from_millis(settings.runtime.tick_rate_ms),
            docker: Arc::new(DockerCli::new(&settings.services)),
            git: Arc::new(GitCli::new(&settings.services)),
            sync: Arc::new(LocalSyncService::new(settings.aliases.clone())),
            catalog,
            manager,
            bridge,
            sender,
            receiver,
            files,
            validation,
            docker_files,
            settings,
        })
    }

    pub(crate) fn list(&self) -> Result<Status> {
        let groups = self
            .catalog
            .groups()
            .with_context(|| format!("failed to scan {}", self.catalog.root().display()))?;
        if groups.is_empty() {
            println!("No projects under {}", self.catalog.root().display());
            return Ok(Status::Success);
        }
        for group in groups {
            println!("{}", group.name);
            for version in group.versions() {
                let alias = self.catalog.folder_alias(&version.parent).unwrap_or("-");
                let tests = discover_test_files(&version.path).map_or(0, |tests| tests.len());
                println!("  {:<16} {alias:<18} {tests} test file(s)", version.parent);
            }
        }
        Ok(Status::Success)
    }

    pub(crate) fn cleanup(&mut self, project: &str) -> Result<Status> {
        let project = self.project(project)?;
        let command =
            CleanupCommand::new(project, Arc::clone(&self.files), CommandCallbacks::default());
        self.dispatch(command, |report| {
            report
                .deleted
                .iter()
                .map(|path| format!("removed {}", path.display()))
                .collect()
        })
    }

    pub(crate) fn archive(&mut self, project: &str, name: Option<String>) -> Result<Status> {
        let project = self.project(project)?;
        let name = name.unwrap_or_else(|| self.catalog.archive_name(&project));
        let command = ArchiveCommand::new(
            project,
            name,
            Arc::clone(&self.files),
            CommandCallbacks::default(),
        );
        self.dispatch(command, |report| {
            vec![format!(
                "{} ({} files, {} bytes)",
                report.archive_path.display(),
                report.file_count,
                report.archive_size
            )]
        })
    }

    pub(crate) fn docker(&mut self, project: &str, tag: Option<String>) -> Result<Status> {
        let project = self.project(project)?;
        let tag = tag.unwrap_or_else(|| self.catalog.docker_tag(&project));
        let command = DockerBuildCommand::new(
            project,
            tag,
            Arc::clone(&self.docker),
            CommandCallbacks::default(),
        );
        self.dispatch(command, |report| {
            vec![format!("{}: {}", report.tag, report.test_status)]
        })
    }

    pub(crate) fn git(
        &mut self,
        project: &str,
        fetch: bool,
        checkout: Option<String>,
    ) -> Result<Status> {
        let project = self.project(project)?;
        let mut command = GitViewCommand::new(
            project,
            fetch,
            Arc::clone(&self.git),
            CommandCallbacks::default(),
        );
        if let Some(commit) = checkout {
            command = command.with_checkout(commit);
        }
        self.dispatch(command, |view| {
            view.commits.iter().map(|commit| commit.display_line()).collect()
        })
    }

    pub(crate) fn checkout_all(
        &mut self,
        group: &str,
        commit: &str,
        no_fetch: bool,
        force: bool,
    ) -> Result<Status> {
        let group = self.group(group)?;
        let mut command = GitCheckoutAllCommand::new(
            group,
            commit,
            Arc::clone(&self.git),
            CommandCallbacks::default(),
        );
        if no_fetch {
            command = command.without_fetch();
        }
        if force {
            command = command.forced();
        }
        self.dispatch(command, |summary| {
            summary
                .succeeded_targets()
                .into_iter()
                .map(|target| format!("checked out {target}"))
                .collect()
        })
    }

    pub(crate) fn sync(&mut self, group: &str, file_name: &str) -> Result<Status> {
        let group = self.group(group)?;
        let command = SyncCommand::new(
            group,
            file_name,
            Arc::clone(&self.sync),
            CommandCallbacks::default(),
        );
        self.dispatch(command, |report| {
            report
                .summary
                .succeeded_targets()
                .into_iter()
                .map(|target| format!("synced {target}"))
                .collect()
        })
    }

    pub(crate) fn validate(&mut self, group: &str) -> Result<Status> {
        let group = self.group(group)?;
        let (event_id, ready) = self.bridge.create_sync_event();
        let command = ValidateCommand::new(
            group,
            Arc::clone(&self.validation),
            CommandCallbacks::default(),
        )
        .wait_for(ready);

        let status = self.dispatch_then(
            command,
            |report| {
                let mut lines = Vec::new();
                if let Some(id) = &report.validation_id {
                    lines.push(format!("validation id: {id}"));
                }
                if let Some(results) = &report.results_path {
                    lines.push(format!("results: {}", results.display()));
                }
                lines
            },
            |panel| {
                println!("--- validation output ---");
                panel.bridge.signal_from_gui(&event_id);
            },
        );
        self.bridge.cleanup_event(&event_id);
        status
    }

    pub(crate) fn build_docker_files(&mut self, group: &str, force: bool) -> Result<Status> {
        let group = self.group(group)?;
        let command = BuildDockerFilesCommand::new(
            group,
            force,
            Arc::clone(&self.docker_files),
            CommandCallbacks::default(),
        );
        self.dispatch(command, |report| {
            let mut lines = vec![format!("language: {}", report.language)];
            lines.extend(
                report
                    .written
                    .iter()
                    .map(|path| format!("wrote {}", path.display())),
            );
            lines
        })
    }

    pub(crate) fn edit_run_tests(
        &mut self,
        group: &str,
        tests: Vec<String>,
        language: Option<String>,
    ) -> Result<Status> {
        let group = self.group(group)?;
        let mut command = EditRunTestsCommand::new(
            group,
            tests,
            self.settings.aliases.clone(),
            self.settings.tests.clone(),
            &self.settings.project,
            CommandCallbacks::default(),
        );
        if let Some(language) = language {
            command = command.with_language(language);
        }
        self.dispatch(command, |report| {
            vec![format!("{}: {}", report.language, report.command)]
        })
    }

    pub(crate) fn add_project(&mut self, repo_url: &str, name: Option<String>) -> Result<Status> {
        let name = match name {
            Some(name) => name,
            None => project_name_from_url(repo_url)
                .ok_or_else(|| anyhow!("cannot derive a project name from {repo_url}"))?,
        };
        let command = AddProjectCommand::new(
            self.catalog.root().to_path_buf(),
            repo_url,
            name,
            Arc::clone(&self.git),
            CommandCallbacks::default(),
        );
        self.dispatch(command, |summary| {
            summary
                .succeeded_targets()
                .into_iter()
                .map(|target| format!("cloned into {target}"))
                .collect()
        })
    }

    /// Cancels anything still tracked and stops the background loop.
    pub(crate) fn shutdown(mut self) {
        self.drain();
        self.manager.shutdown(self.settings.runtime.shutdown_timeout);
    }

    fn dispatch<C, R>(&mut self, command: C, render: R) -> Result<Status>
    where
        C: Command,
        R: FnOnce(&C::Output) -> Vec<String> + Send + 'static,
    {
        self.dispatch_then(command, render, |_| {})
    }

    /// Submits `command` with its callbacks routed through the UI queue, runs
    /// `after_submit` on this thread, then pumps events until it finishes.
    fn dispatch_then<C, R>(
        &mut self,
        mut command: C,
        render: R,
        after_submit: impl FnOnce(&Self),
    ) -> Result<Status>
    where
        C: Command,
        R: FnOnce(&C::Output) -> Vec<String> + Send + 'static,
    {
        let task = command.task_name();
        let mut callbacks: CommandCallbacks<C::Output> =
            CommandCallbacks::to_gui(self.sender.clone(), task.clone());
        let finished = callbacks.completion.take();
        let printer = self.sender.clone();
        *command.callbacks() = callbacks.on_complete(move |envelope| {
            let lines = render_lines(envelope, render);
            if !lines.is_empty() {
                printer.invoke(move || {
                    for line in lines {
                        println!("{line}");
                    }
                });
            }
            if let Some(finished) = finished {
                finished(envelope);
            }
        });

        let handle = submit_command(&self.manager, command)
            .with_context(|| format!("failed to submit {task}"))?;
        tracing::debug!(task = %task, "command submitted");
        after_submit(&*self);

        loop {
            match self.receiver.recv_timeout(self.tick_rate) {
                Some(event) => {
                    if let Some(status) = accept(&task, event) {
                        self.drain();
                        return Ok(status);
                    }
                }
                None if self.receiver.is_disconnected() => {
                    return Err(anyhow!("UI event channel closed before {task} finished"));
                }
                None => {}
            }
            // The completion callback runs before the handle settles, so a
            // settled task has already queued everything it will send.
            if let Some(outcome) = handle.outcome() {
                for event in self.receiver.drain() {
                    if let Some(status) = accept(&task, event) {
                        return Ok(status);
                    }
                }
                return Err(anyhow!("{task} ended without a result ({outcome:?})"));
            }
        }
    }

    fn drain(&mut self) {
        for event in self.receiver.drain() {
            handle_event(event);
        }
    }

    fn project(&self, relative_path: &str) -> Result<Project> {
        self.catalog
            .find(relative_path)
            .with_context(|| format!("failed to scan {}", self.catalog.root().display()))?
            .ok_or_else(|| {
                anyhow!(
                    "no project {relative_path} under {}",
                    self.catalog.root().display()
                )
            })
    }

    fn group(&self, name: &str) -> Result<ProjectGroup> {
        self.catalog
            .group(name)
            .with_context(|| format!("failed to scan {}", self.catalog.root().display()))?
            .ok_or_else(|| {
                anyhow!(
                    "no project named {name} under {}",
                    self.catalog.root().display()
                )
            })
    }
}

fn render_lines<T>(
    envelope: &ResultEnvelope<T>,
    render: impl FnOnce(&T) -> Vec<String>,
) -> Vec<String> {
    let mut lines = envelope.data().map(render).unwrap_or_default();
    if let Some(error) = envelope.error_ref() {
        lines.extend(
            error
                .details
                .iter()
                .map(|(key, value)| format!("  {key}: {value}")),
        );
    }
    lines
}

/// Handles one queued event; returns the status once `task` has finished.
fn accept(task: &str, event: GuiEvent) -> Option<Status> {
    match event {
        GuiEvent::Finished {
            task: finished,
            status,
            summary,
        } if finished == task => {
            println!("{summary}");
            Some(status)
        }
        other => {
            handle_event(other);
            None
        }
    }
}

fn handle_event(event: GuiEvent) {
    match event {
        GuiEvent::Progress { message, level, .. } => {
            println!("[{}] {message}", level.label());
        }
        GuiEvent::Finished { task, summary, .. } => {
            tracing::debug!(task = %task, "late completion: {summary}");
        }
        GuiEvent::Invoke(action) => action(),
    }
}
