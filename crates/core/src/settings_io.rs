use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SettingsError;
use crate::settings::{FolderAliases, Settings};

pub fn default_settings_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/pcp/settings.ini"))
}

/// Reads settings from `path`, falling back to defaults when the file does
/// not exist. Environment overrides are applied by the caller.
pub fn load_settings(path: &Path) -> Result<Settings, SettingsError> {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "settings file not found; using defaults");
            return Ok(Settings::default());
        }
        Err(error) => {
            return Err(SettingsError::Read {
                path: path.display().to_string(),
                source: error,
            });
        }
    };
    parse_settings(&source, &path.display().to_string())
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    write_atomic(path, &render_settings_ini(settings)).map_err(|error| SettingsError::Write {
        path: path.display().to_string(),
        source: error,
    })
}

pub fn parse_settings(source: &str, origin: &str) -> Result<Settings, SettingsError> {
    let mut settings = Settings::default();
    let mut section = String::new();
    let mut saw_ignore_dir = false;
    let mut saw_ignore_file = false;
    let mut saw_alias = false;

    for (index, raw_line) in source.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section_name) = parse_ini_section_name(line) {
            section = section_name.to_ascii_lowercase();
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            return Err(SettingsError::Parse {
                path: origin.to_string(),
                line: index + 1,
                message: format!("expected key=value, found {line:?}"),
            });
        };
        let key = raw_key.trim().to_ascii_lowercase();
        let value = raw_value.trim();
        let parse_error = |message: String| SettingsError::Parse {
            path: origin.to_string(),
            line: index + 1,
            message,
        };

        match (section.as_str(), key.as_str()) {
            ("project", "source_dir") => settings.project.source_dir = PathBuf::from(value),
            ("project", "ignore_dir") => {
                if !saw_ignore_dir {
                    settings.project.ignore_dirs.clear();
                    saw_ignore_dir = true;
                }
                settings.project.ignore_dirs.push(value.to_string());
            }
            ("project", "ignore_file") => {
                if !saw_ignore_file {
                    settings.project.ignore_files.clear();
                    saw_ignore_file = true;
                }
                settings.project.ignore_files.push(value.to_string());
            }
            ("aliases", alias) => {
                if !saw_alias {
                    settings.aliases = FolderAliases::empty();
                    saw_alias = true;
                }
                settings.aliases.insert(alias, parse_list(value));
            }
            ("tests", language) => {
                settings
                    .tests
                    .command_templates
                    .insert(language.to_string(), value.to_string());
            }
            ("test-defaults", language) => {
                settings
                    .tests
                    .default_commands
                    .insert(language.to_string(), value.to_string());
            }
            ("services", "default_timeout_secs") => {
                settings.services.default_timeout = parse_secs(value).map_err(parse_error)?;
            }
            ("services", "docker_timeout_secs") => {
                settings.services.docker_timeout = parse_secs(value).map_err(parse_error)?;
            }
            ("services", "git_timeout_secs") => {
                settings.services.git_timeout = parse_secs(value).map_err(parse_error)?;
            }
            ("services", "validation_timeout_secs") => {
                settings.services.validation_timeout = parse_secs(value).map_err(parse_error)?;
            }
            ("services", "validation_poll_secs") => {
                settings.services.validation_poll_interval =
                    parse_secs(value).map_err(parse_error)?;
            }
            ("services", "archive_command") => {
                settings.services.archive_command = value.to_string();
            }
            ("services", "docker_build_command") => {
                settings.services.docker_build_command = value.to_string();
            }
            ("services", "docker_test_command") => {
                settings.services.docker_test_command = value.to_string();
            }
            ("services", "git_fetch_command") => {
                settings.services.git_fetch_command = value.to_string();
            }
            ("services", "git_log_command") => {
                settings.services.git_log_command = value.to_string();
            }
            ("services", "git_clone_command") => {
                settings.services.git_clone_command = value.to_string();
            }
            ("services", "validation_dir") => {
                settings.services.validation_dir = PathBuf::from(value);
            }
            ("services", "validation_command") => {
                settings.services.validation_command = value.to_string();
            }
            ("services", "validation_health_command") => {
                settings.services.validation_health_command =
                    (!value.is_empty()).then(|| value.to_string());
            }
            ("runtime", "startup_timeout_ms") => {
                settings.runtime.startup_timeout = parse_millis(value).map_err(parse_error)?;
            }
            ("runtime", "shutdown_timeout_ms") => {
                settings.runtime.shutdown_timeout = parse_millis(value).map_err(parse_error)?;
            }
            ("runtime", "tick_rate_ms") => {
                settings.runtime.tick_rate_ms = value
                    .parse::<u64>()
                    .map_err(|error| parse_error(format!("invalid tick rate {value:?}: {error}")))?;
            }
            ("logging", "level") => settings.logging.level = value.to_ascii_lowercase(),
            _ => {
                tracing::debug!(section = %section, key = %key, "ignoring unknown setting");
            }
        }
    }

    Ok(settings)
}

fn parse_ini_section_name(line: &str) -> Option<&str> {
    let line = line.trim();
    if line.starts_with('[') && line.ends_with(']') {
        return Some(line[1..line.len() - 1].trim());
    }
    None
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_secs(value: &str) -> Result<Duration, String> {
    value
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .ok_or_else(|| format!("invalid duration in seconds: {value:?}"))
}

fn parse_millis(value: &str) -> Result<Duration, String> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|error| format!("invalid duration in milliseconds {value:?}: {error}"))
}

fn render_settings_ini(settings: &Settings) -> String {
    let mut lines = vec![String::from("[project]")];
    lines.push(format!(
        "source_dir={}",
        settings.project.source_dir.to_string_lossy()
    ));
    for dir in &settings.project.ignore_dirs {
        lines.push(format!("ignore_dir={dir}"));
    }
    for file in &settings.project.ignore_files {
        lines.push(format!("ignore_file={file}"));
    }

    lines.push(String::new());
    lines.push(String::from("[aliases]"));
    for (alias, folders) in settings.aliases.entries() {
        lines.push(format!("{alias}={}", folders.join(", ")));
    }

    lines.push(String::new());
    lines.push(String::from("[tests]"));
    for (language, template) in &settings.tests.command_templates {
        lines.push(format!("{language}={template}"));
    }

    lines.push(String::new());
    lines.push(String::from("[test-defaults]"));
    for (language, command) in &settings.tests.default_commands {
        lines.push(format!("{language}={command}"));
    }

    let services = &settings.services;
    lines.push(String::new());
    lines.push(String::from("[services]"));
    lines.push(format!(
        "default_timeout_secs={}",
        services.default_timeout.as_secs_f64()
    ));
    lines.push(format!(
        "docker_timeout_secs={}",
        services.docker_timeout.as_secs_f64()
    ));
    lines.push(format!(
        "git_timeout_secs={}",
        services.git_timeout.as_secs_f64()
    ));
    lines.push(format!(
        "validation_timeout_secs={}",
        services.validation_timeout.as_secs_f64()
    ));
    lines.push(format!(
        "validation_poll_secs={}",
        services.validation_poll_interval.as_secs_f64()
    ));
    lines.push(format!("archive_command={}", services.archive_command));
    lines.push(format!(
        "docker_build_command={}",
        services.docker_build_command
    ));
    lines.push(format!("docker_test_command={}", services.docker_test_command));
    lines.push(format!("git_fetch_command={}", services.git_fetch_command));
    lines.push(format!("git_log_command={}", services.git_log_command));
    lines.push(format!("git_clone_command={}", services.git_clone_command));
    lines.push(format!(
        "validation_dir={}",
        services.validation_dir.to_string_lossy()
    ));
    lines.push(format!("validation_command={}", services.validation_command));
    lines.push(format!(
        "validation_health_command={}",
        services.validation_health_command.as_deref().unwrap_or("")
    ));

    lines.push(String::new());
    lines.push(String::from("[runtime]"));
    lines.push(format!(
        "startup_timeout_ms={}",
        settings.runtime.startup_timeout.as_millis()
    ));
    lines.push(format!(
        "shutdown_timeout_ms={}",
        settings.runtime.shutdown_timeout.as_millis()
    ));
    lines.push(format!("tick_rate_ms={}", settings.runtime.tick_rate_ms));

    lines.push(String::new());
    lines.push(String::from("[logging]"));
    lines.push(format!("level={}", settings.logging.level));
    lines.push(String::new());

    lines.join("\n")
}

fn write_atomic(path: &Path, content: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let stem = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("settings");
    let tmp = path.with_file_name(format!("{stem}.tmp-{}", std::process::id()));
    fs::write(&tmp, content)?;
    #[cfg(windows)]
    {
        match fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                fs::remove_file(path)?;
                fs::rename(tmp, path)
            }
            Err(error) => Err(error),
        }
    }
    #[cfg(not(windows))]
    {
        fs::rename(tmp, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_settings_path(label: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        env::temp_dir().join(format!("pcp-{label}-{stamp}/settings.ini"))
    }

    #[test]
    fn parse_settings_overrides_sections() {
        let source = "\
# panel settings
[project]
source_dir=/work/projects
ignore_dir=node_modules
ignore_dir=target

[aliases]
preedit=pre-edit, baseline
candidate=post-edit

[tests]
rust=cargo test -- {test_paths}

[services]
docker_timeout_secs=120
validation_poll_secs=0.5

[runtime]
startup_timeout_ms=2500

[logging]
level=DEBUG
";
        let settings = parse_settings(source, "inline").expect("settings should parse");
        assert_eq!(settings.project.source_dir, PathBuf::from("/work/projects"));
        assert_eq!(settings.project.ignore_dirs, vec!["node_modules", "target"]);
        assert_eq!(settings.project.ignore_files, vec![".coverage"]);
        assert_eq!(settings.aliases.alias_for("baseline"), Some("preedit"));
        assert_eq!(settings.aliases.alias_for("sonnet"), None);
        assert_eq!(settings.aliases.sort_order("post-edit"), 1);
        assert_eq!(
            settings.tests.test_command("rust", &[String::from("smoke")]),
            "cargo test -- smoke"
        );
        assert_eq!(settings.services.docker_timeout, Duration::from_secs(120));
        assert_eq!(
            settings.services.validation_poll_interval,
            Duration::from_millis(500)
        );
        assert_eq!(settings.runtime.startup_timeout, Duration::from_millis(2500));
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn parse_settings_reports_line_of_bad_value() {
        let source = "[services]\ngit_timeout_secs=soon\n";
        let error = parse_settings(source, "panel.ini").expect_err("bad value should fail");
        assert!(matches!(error, SettingsError::Parse { line: 2, .. }));
        assert!(error.to_string().starts_with("panel.ini:2:"));
    }

    #[test]
    fn load_settings_defaults_when_missing() {
        let path = temp_settings_path("missing");
        let settings = load_settings(&path).expect("missing file should yield defaults");
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let path = temp_settings_path("save");
        let mut settings = Settings::default();
        settings.project.source_dir = PathBuf::from("/tmp/source");
        settings.services.validation_health_command = Some(String::from("curl -sf localhost"));
        settings.runtime.tick_rate_ms = 250;

        save_settings(&path, &settings).expect("settings should save");
        let loaded = load_settings(&path).expect("settings should load");
        assert_eq!(loaded, settings);

        if let Some(parent) = path.parent() {
            fs::remove_dir_all(parent).expect("temp dir should be removed");
        }
    }
}
