use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::SettingsError;

pub const PRE_EDIT_ALIAS: &str = "preedit";

pub const DEFAULT_IGNORE_DIRS: &[&str] = &[
    "__pycache__",
    ".pytest_cache",
    "pytest",
    ".dist",
    "dist",
    ".trunk",
    ".benchmarks",
    "benchmarks",
    ".vscode",
    "vscode",
    ".venv",
    "venv",
    "htmlcov",
];

pub const DEFAULT_IGNORE_FILES: &[&str] = &[".coverage"];

const DEFAULT_FOLDER_ALIASES: &[(&str, &[&str])] = &[
    (PRE_EDIT_ALIAS, &["pre-edit", "original"]),
    (
        "postedit-beetle",
        &["post-edit", "da", "da_edit", "beetle", "beetle_edit"],
    ),
    ("postedit-sonnet", &["post-edit2", "sonnet", "sonnet_edit"]),
    (
        "rewrite",
        &["correct-edit", "rewrite", "correct", "correct_edit"],
    ),
];

const DEFAULT_TEST_TEMPLATES: &[(&str, &str)] = &[
    ("python", "pytest -vv -s {test_paths}"),
    ("javascript", "npm test {test_paths}"),
    ("typescript", "npm run build && npm test {test_paths}"),
    ("java", "mvn test -Dtest={test_paths}"),
    ("rust", "cargo test {test_paths}"),
    ("c", "ctest --verbose -R {test_paths}"),
    ("cpp", "ctest --verbose -R {test_paths}"),
    ("csharp", "dotnet test {test_paths}"),
    ("go", "go test {test_paths}"),
];

const DEFAULT_TEST_COMMANDS: &[(&str, &str)] = &[
    ("python", "pytest -vv -s tests/"),
    ("javascript", "npm test"),
    ("typescript", "npm run build && npm test"),
    ("java", "mvn test"),
    ("rust", "cargo test"),
    ("c", "ctest --verbose"),
    ("cpp", "ctest --verbose"),
    ("csharp", "dotnet test"),
    ("go", "go test"),
];

const FALLBACK_TEST_TEMPLATE: &str = "pytest -vv -s {test_paths}";
const FALLBACK_TEST_COMMAND: &str = "pytest -vv -s tests/";

pub const ENV_SOURCE_DIR: &str = "PCP_SOURCE_DIR";
pub const ENV_LOG_LEVEL: &str = "PCP_LOG_LEVEL";
pub const ENV_VALIDATION_COMMAND: &str = "PCP_VALIDATION_COMMAND";

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Settings {
    pub project: ProjectSettings,
    pub aliases: FolderAliases,
    pub tests: TestSettings,
    pub services: ServiceSettings,
    pub runtime: RuntimeSettings,
    pub logging: LoggingSettings,
}

impl Settings {
    /// Applies `PCP_*` overrides. `lookup` is usually `std::env::var`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(source_dir) = lookup(ENV_SOURCE_DIR).filter(|value| !value.trim().is_empty()) {
            self.project.source_dir = PathBuf::from(source_dir);
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL).filter(|value| !value.trim().is_empty()) {
            self.logging.level = level.trim().to_ascii_lowercase();
        }
        if let Some(command) =
            lookup(ENV_VALIDATION_COMMAND).filter(|value| !value.trim().is_empty())
        {
            self.services.validation_command = command;
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let timeouts = [
            ("services.default_timeout_secs", self.services.default_timeout),
            ("services.docker_timeout_secs", self.services.docker_timeout),
            ("services.git_timeout_secs", self.services.git_timeout),
            (
                "services.validation_timeout_secs",
                self.services.validation_timeout,
            ),
            (
                "services.validation_poll_secs",
                self.services.validation_poll_interval,
            ),
            ("runtime.startup_timeout_ms", self.runtime.startup_timeout),
            ("runtime.shutdown_timeout_ms", self.runtime.shutdown_timeout),
        ];
        for (key, value) in timeouts {
            if value.is_zero() {
                return Err(SettingsError::Invalid {
                    key: key.to_string(),
                    message: String::from("timeout must be positive"),
                });
            }
        }
        if self.runtime.tick_rate_ms == 0 {
            return Err(SettingsError::Invalid {
                key: String::from("runtime.tick_rate_ms"),
                message: String::from("tick rate must be positive"),
            });
        }
        if !self.source_dir_exists() {
            tracing::warn!(
                source_dir = %self.project.source_dir.display(),
                "source directory does not exist"
            );
        }
        Ok(())
    }

    fn source_dir_exists(&self) -> bool {
        self.project.source_dir.is_dir()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProjectSettings {
    pub source_dir: PathBuf,
    pub ignore_dirs: Vec<String>,
    pub ignore_files: Vec<String>,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("."),
            ignore_dirs: DEFAULT_IGNORE_DIRS.iter().map(ToString::to_string).collect(),
            ignore_files: DEFAULT_IGNORE_FILES
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

/// Ordered mapping from alias to the folder names it covers. The order is
/// the display order of versions inside a project group.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FolderAliases {
    entries: Vec<(String, Vec<String>)>,
}

impl Default for FolderAliases {
    fn default() -> Self {
        Self {
            entries: DEFAULT_FOLDER_ALIASES
                .iter()
                .map(|(alias, folders)| {
                    (
                        alias.to_string(),
                        folders.iter().map(ToString::to_string).collect(),
                    )
                })
                .collect(),
        }
    }
}

impl FolderAliases {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, alias: &str, folders: Vec<String>) {
        match self.entries.iter_mut().find(|(name, _)| name == alias) {
            Some((_, existing)) => *existing = folders,
            None => self.entries.push((alias.to_string(), folders)),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(alias, folders)| (alias.as_str(), folders.as_slice()))
    }

    pub fn alias_for(&self, folder: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, folders)| folders.iter().any(|name| name == folder))
            .map(|(alias, _)| alias.as_str())
    }

    /// Position of the folder's alias; unaliased folders sort last.
    pub fn sort_order(&self, folder: &str) -> usize {
        self.entries
            .iter()
            .position(|(_, folders)| folders.iter().any(|name| name == folder))
            .unwrap_or(self.entries.len())
    }

    pub fn is_pre_edit(&self, folder: &str) -> bool {
        self.alias_for(folder) == Some(PRE_EDIT_ALIAS)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestSettings {
    pub command_templates: BTreeMap<String, String>,
    pub default_commands: BTreeMap<String, String>,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            command_templates: DEFAULT_TEST_TEMPLATES
                .iter()
                .map(|(language, template)| (language.to_string(), template.to_string()))
                .collect(),
            default_commands: DEFAULT_TEST_COMMANDS
                .iter()
                .map(|(language, command)| (language.to_string(), command.to_string()))
                .collect(),
        }
    }
}

impl TestSettings {
    pub fn test_command(&self, language: &str, test_paths: &[String]) -> String {
        let test_paths = test_paths.join(" ");
        if test_paths.trim().is_empty() {
            return self
                .default_commands
                .get(language)
                .map_or(FALLBACK_TEST_COMMAND, String::as_str)
                .to_string();
        }
        self.command_templates
            .get(language)
            .map_or(FALLBACK_TEST_TEMPLATE, String::as_str)
            .replace("{test_paths}", &test_paths)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceSettings {
    pub default_timeout: Duration,
    pub docker_timeout: Duration,
    pub git_timeout: Duration,
    pub validation_timeout: Duration,
    pub validation_poll_interval: Duration,
    pub archive_command: String,
    pub docker_build_command: String,
    pub docker_test_command: String,
    pub git_fetch_command: String,
    pub git_log_command: String,
    pub git_clone_command: String,
    pub validation_dir: PathBuf,
    pub validation_command: String,
    pub validation_health_command: Option<String>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            docker_timeout: Duration::from_secs(300),
            git_timeout: Duration::from_secs(60),
            validation_timeout: Duration::from_secs(1800),
            validation_poll_interval: Duration::from_secs(5),
            archive_command: String::from("zip -q {archive_name} -@"),
            docker_build_command: String::from("docker build -t {tag} ."),
            docker_test_command: String::from("docker run --rm {tag} ./run_tests.sh"),
            git_fetch_command: String::from("git fetch --all"),
            git_log_command: String::from(
                "git log --pretty=format:%h|%P|%an|%ad|%s --date=short --all",
            ),
            git_clone_command: String::from("git clone {repo_url} {target}"),
            validation_dir: PathBuf::from("validation-tool"),
            validation_command: String::from("bash run_validation.sh"),
            validation_health_command: None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RuntimeSettings {
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub tick_rate_ms: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            tick_rate_ms: 100,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: String::from("info"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_and_order_folders() {
        let aliases = FolderAliases::default();
        assert_eq!(aliases.alias_for("original"), Some(PRE_EDIT_ALIAS));
        assert_eq!(aliases.alias_for("sonnet_edit"), Some("postedit-sonnet"));
        assert_eq!(aliases.alias_for("scratch"), None);
        assert!(aliases.sort_order("pre-edit") < aliases.sort_order("post-edit"));
        assert!(aliases.sort_order("post-edit2") < aliases.sort_order("correct-edit"));
        assert_eq!(aliases.sort_order("scratch"), 4);
        assert!(aliases.is_pre_edit("pre-edit"));
    }

    #[test]
    fn test_command_uses_template_or_language_default() {
        let tests = TestSettings::default();
        assert_eq!(tests.test_command("rust", &[]), "cargo test");
        assert_eq!(
            tests.test_command(
                "python",
                &[String::from("tests/test_a.py"), String::from("tests/test_b.py")]
            ),
            "pytest -vv -s tests/test_a.py tests/test_b.py"
        );
        assert_eq!(tests.test_command("cobol", &[]), FALLBACK_TEST_COMMAND);
    }

    #[test]
    fn env_overrides_replace_values() {
        let mut settings = Settings::default();
        settings.apply_env_overrides(|key| match key {
            ENV_SOURCE_DIR => Some(String::from("/srv/projects")),
            ENV_LOG_LEVEL => Some(String::from("DEBUG")),
            _ => None,
        });
        assert_eq!(settings.project.source_dir, PathBuf::from("/srv/projects"));
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(
            settings.services.validation_command,
            ServiceSettings::default().validation_command
        );
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_ok());
        settings.services.docker_timeout = Duration::ZERO;
        let error = settings.validate().expect_err("zero timeout should be rejected");
        assert!(error.to_string().contains("services.docker_timeout_secs"));
    }
}
