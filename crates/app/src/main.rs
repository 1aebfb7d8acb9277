#![forbid(unsafe_code)]

mod panel;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use pcp_core::{Settings, Status, default_settings_path, load_settings};
use tracing_subscriber::EnvFilter;

use crate::panel::ControlPanel;

#[derive(Debug, Parser)]
#[command(version, about = "Project control panel: manage versioned project folders")]
struct Cli {
    /// Folder holding the version folders; overrides `[project] source_dir`.
    #[arg(long)]
    root: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    tick_rate_ms: Option<u64>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Debug, Subcommand)]
enum CliCommand {
    /// List project groups and their versions.
    List,
    /// Remove cache directories from one version (`parent/name`).
    Cleanup { project: String },
    /// Zip one version.
    Archive {
        project: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Build the version's image and run its tests inside it.
    Docker {
        project: String,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Show commit history, optionally after fetching or checking out.
    Git {
        project: String,
        #[arg(long)]
        fetch: bool,
        #[arg(long)]
        checkout: Option<String>,
    },
    /// Check out one commit in every version of a project.
    CheckoutAll {
        group: String,
        commit: String,
        /// Skip fetching before each checkout.
        #[arg(long)]
        no_fetch: bool,
        /// Discard local changes instead of refusing the checkout.
        #[arg(long)]
        force: bool,
    },
    /// Copy a file from the pre-edit version to every other version.
    Sync { group: String, file: String },
    /// Archive every version of a project and run the validator.
    Validate { group: String },
    /// Generate Docker files and copy them to every version.
    BuildDockerFiles {
        group: String,
        #[arg(long)]
        force: bool,
    },
    /// Regenerate run_tests.sh in every version.
    EditRunTests {
        group: String,
        tests: Vec<String>,
        #[arg(long)]
        language: Option<String>,
    },
    /// Clone a repository into every version folder.
    AddProject {
        repo_url: String,
        #[arg(long)]
        name: Option<String>,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;
    init_tracing(&settings.logging.level);

    let mut panel = ControlPanel::new(settings)?;
    let result = run(&mut panel, cli.command);
    panel.shutdown();

    Ok(match result? {
        Status::Success => ExitCode::SUCCESS,
        Status::Partial => ExitCode::from(2),
        Status::Error => ExitCode::FAILURE,
    })
}

fn resolve_settings(cli: &Cli) -> Result<Settings> {
    let path = cli
        .config
        .clone()
        .or_else(default_settings_path)
        .ok_or_else(|| anyhow!("no settings path: pass --config or set HOME"))?;
    let mut settings = load_settings(&path)
        .with_context(|| format!("failed to load settings from {}", path.display()))?;
    settings.apply_env_overrides(|key| std::env::var(key).ok());
    if let Some(root) = &cli.root {
        settings.project.source_dir = root.clone();
    }
    if let Some(tick_rate_ms) = cli.tick_rate_ms {
        settings.runtime.tick_rate_ms = tick_rate_ms;
    }
    settings.validate().context("invalid settings")?;
    Ok(settings)
}

fn default_filter(level: &str) -> String {
    format!("pcp={level},pcp_core={level},pcp_shell={level},warn")
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(panel: &mut ControlPanel, command: CliCommand) -> Result<Status> {
    match command {
        CliCommand::List => panel.list(),
        CliCommand::Cleanup { project } => panel.cleanup(&project),
        CliCommand::Archive { project, name } => panel.archive(&project, name),
        CliCommand::Docker { project, tag } => panel.docker(&project, tag),
        CliCommand::Git {
            project,
            fetch,
            checkout,
        } => panel.git(&project, fetch, checkout),
        CliCommand::CheckoutAll {
            group,
            commit,
            no_fetch,
            force,
        } => panel.checkout_all(&group, &commit, no_fetch, force),
        CliCommand::Sync { group, file } => panel.sync(&group, &file),
        CliCommand::Validate { group } => panel.validate(&group),
        CliCommand::BuildDockerFiles { group, force } => panel.build_docker_files(&group, force),
        CliCommand::EditRunTests {
            group,
            tests,
            language,
        } => panel.edit_run_tests(&group, tests, language),
        CliCommand::AddProject { repo_url, name } => panel.add_project(&repo_url, name),
    }
}
