//! User settings for manager selection and known projects.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/pyenvs/settings.json
//! - Linux: ~/.config/pyenvs/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\pyenvs\settings.json

use std::path::{Path, PathBuf};

use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::model::{normalize_path, Project};

fn default_manager_id() -> String {
    "conda".to_string()
}

/// Per-project overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProjectSettings {
    /// Project root (folder or file).
    pub path: PathBuf,
    /// Display name; defaults to the last path component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Environment manager id used for this project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_manager: Option<String>,
    /// Package manager id used for this project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
}

impl ProjectSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            name: None,
            env_manager: None,
            package_manager: None,
        }
    }

    pub fn to_project(&self) -> Project {
        let mut project = Project::from_path(&self.path);
        if let Some(name) = &self.name {
            project.name = name.clone();
        }
        project
    }
}

/// Settings for environment and package manager selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EnvsSettings {
    /// Environment manager used when no project override applies.
    #[serde(default = "default_manager_id")]
    pub default_env_manager: String,

    /// Package manager used when no project override applies.
    #[serde(default = "default_manager_id")]
    pub default_package_manager: String,

    /// Known projects and their overrides.
    #[serde(default)]
    pub projects: Vec<ProjectSettings>,
}

impl Default for EnvsSettings {
    fn default() -> Self {
        Self {
            default_env_manager: default_manager_id(),
            default_package_manager: default_manager_id(),
            projects: Vec::new(),
        }
    }
}

impl EnvsSettings {
    /// Overrides for the project rooted exactly at `path`.
    pub fn project(&self, path: &Path) -> Option<&ProjectSettings> {
        let path = normalize_path(path);
        self.projects
            .iter()
            .find(|p| normalize_path(&p.path) == path)
    }

    /// Overrides for `path`, inserting an empty entry if none exists.
    pub fn project_mut(&mut self, path: &Path) -> &mut ProjectSettings {
        let normalized = normalize_path(path);
        let idx = match self
            .projects
            .iter()
            .position(|p| normalize_path(&p.path) == normalized)
        {
            Some(idx) => idx,
            None => {
                self.projects.push(ProjectSettings::new(normalized));
                self.projects.len() - 1
            }
        };
        &mut self.projects[idx]
    }

    pub fn remove_project(&mut self, path: &Path) -> bool {
        let path = normalize_path(path);
        let before = self.projects.len();
        self.projects.retain(|p| normalize_path(&p.path) != path);
        before != self.projects.len()
    }
}

/// Get the path to the settings file.
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pyenvs")
        .join("settings.json")
}

/// Get the path to the persisted state file.
pub fn state_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("pyenvs")
        .join("state.json")
}

/// Load settings from the default location.
pub fn load_settings() -> EnvsSettings {
    load_settings_from(&settings_path())
}

/// Load settings from `path`, returning defaults if the file doesn't exist
/// or doesn't parse.
pub fn load_settings_from(path: &Path) -> EnvsSettings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    } else {
        EnvsSettings::default()
    }
}

/// Save settings to the default location.
pub fn save_settings(settings: &EnvsSettings) -> Result<()> {
    save_settings_to(&settings_path(), settings)
}

pub fn save_settings_to(path: &Path, settings: &EnvsSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

/// JSON schema for the settings file.
pub fn settings_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(EnvsSettings)).unwrap_or_default()
}
