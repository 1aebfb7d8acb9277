use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::settings::FolderAliases;

/// One version folder of a project: `<root>/<parent>/<name>`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Project {
    pub parent: String,
    pub name: String,
    pub path: PathBuf,
    pub relative_path: String,
}

impl Project {
    pub fn new(root: &Path, parent: &str, name: &str) -> Self {
        Self {
            parent: parent.to_string(),
            name: name.to_string(),
            path: root.join(parent).join(name),
            relative_path: format!("{parent}/{name}"),
        }
    }
}

impl fmt::Display for Project {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}/{}", self.parent, self.name)
    }
}

/// Every version of one logical project, ordered by alias order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProjectGroup {
    pub name: String,
    versions: Vec<Project>,
}

impl ProjectGroup {
    pub fn new(name: &str, mut versions: Vec<Project>, aliases: &FolderAliases) -> Self {
        versions.sort_by(|left, right| {
            aliases
                .sort_order(&left.parent)
                .cmp(&aliases.sort_order(&right.parent))
                .then_with(|| left.parent.cmp(&right.parent))
        });
        Self {
            name: name.to_string(),
            versions,
        }
    }

    pub fn versions(&self) -> &[Project] {
        &self.versions
    }

    pub fn version(&self, parent: &str) -> Option<&Project> {
        self.versions.iter().find(|project| project.parent == parent)
    }

    pub fn pre_edit_version(&self, aliases: &FolderAliases) -> Option<&Project> {
        self.versions
            .iter()
            .find(|project| aliases.is_pre_edit(&project.parent))
    }

    pub fn non_pre_edit_versions(&self, aliases: &FolderAliases) -> Vec<&Project> {
        self.versions
            .iter()
            .filter(|project| !aliases.is_pre_edit(&project.parent))
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct ProjectCatalog {
    root: PathBuf,
    aliases: FolderAliases,
}

impl ProjectCatalog {
    pub fn new(root: impl Into<PathBuf>, aliases: FolderAliases) -> Self {
        Self {
            root: root.into(),
            aliases,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn aliases(&self) -> &FolderAliases {
        &self.aliases
    }

    pub fn folder_alias(&self, folder: &str) -> Option<&str> {
        self.aliases.alias_for(folder)
    }

    pub fn archive_name(&self, project: &Project) -> String {
        format!(
            "{}_{}.zip",
            project.name.replace('-', ""),
            self.version_label(&project.parent)
        )
    }

    pub fn docker_tag(&self, project: &Project) -> String {
        format!(
            "{}:{}",
            project.name.replace('-', "").to_ascii_lowercase(),
            self.version_label(&project.parent).to_ascii_lowercase()
        )
    }

    fn version_label(&self, parent: &str) -> String {
        match self.folder_alias(parent) {
            Some(alias) => alias.to_string(),
            None => parent.replace('-', ""),
        }
    }

    /// Projects exactly two levels below the root, hidden folders skipped,
    /// sorted by parent then name.
    pub fn discover(&self) -> io::Result<Vec<Project>> {
        let mut projects = Vec::new();
        for parent in visible_subdirectories(&self.root)? {
            let parent_path = self.root.join(&parent);
            let names = match visible_subdirectories(&parent_path) {
                Ok(names) => names,
                Err(error) => {
                    tracing::warn!(
                        path = %parent_path.display(),
                        "skipping unreadable version folder: {error}"
                    );
                    continue;
                }
            };
            for name in names {
                projects.push(Project::new(&self.root, &parent, &name));
            }
        }
        projects.sort_by(|left, right| {
            left.parent
                .cmp(&right.parent)
                .then_with(|| left.name.cmp(&right.name))
        });
        Ok(projects)
    }

    pub fn groups(&self) -> io::Result<Vec<ProjectGroup>> {
        let mut by_name: BTreeMap<String, Vec<Project>> = BTreeMap::new();
        for project in self.discover()? {
            by_name
                .entry(project.name.clone())
                .or_default()
                .push(project);
        }
        Ok(by_name
            .into_iter()
            .map(|(name, versions)| ProjectGroup::new(&name, versions, &self.aliases))
            .collect())
    }

    pub fn group(&self, name: &str) -> io::Result<Option<ProjectGroup>> {
        Ok(self.groups()?.into_iter().find(|group| group.name == name))
    }

    /// Resolves `parent/name` to a discovered project.
    pub fn find(&self, relative_path: &str) -> io::Result<Option<Project>> {
        let relative_path = relative_path.trim_matches('/');
        Ok(self
            .discover()?
            .into_iter()
            .find(|project| project.relative_path == relative_path))
    }
}

pub(crate) fn visible_subdirectories(path: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if entry.file_type()?.is_dir() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
