//! Identity and entity types shared by every manager.
//!
//! These are plain values. Environments and packages are handed out as
//! `Arc`s by the manager that produced them; callers only ever hold read
//! references.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Length of the random suffix appended to generated identities.
const ID_SUFFIX_LEN: usize = 8;

/// Generate a fresh identifier of the form `<name>-<random suffix>`.
///
/// The suffix is taken from a v4 UUID. Uniqueness is probabilistic; managers
/// that need a hard guarantee check the result against their own collection.
pub fn generate_id(name: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", name, &suffix[..ID_SUFFIX_LEN])
}

/// Lexically normalize a path: drop `.` segments, fold `..` and strip
/// trailing separators. Does not touch the filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Identity of an environment: unique per (manager, generated id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentId {
    pub id: String,
    pub manager_id: String,
}

impl EnvironmentId {
    /// Mint a new identity for an environment called `name`.
    pub fn generate(name: &str, manager_id: &str) -> Self {
        Self {
            id: generate_id(name),
            manager_id: manager_id.to_string(),
        }
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.manager_id, self.id)
    }
}

/// A single command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub executable: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl CommandConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// How to run, activate and deactivate an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecInfo {
    /// Plain interpreter invocation.
    pub run: CommandConfig,
    /// Interpreter invocation that also activates the environment, when the
    /// backend needs a wrapper for that.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_run: Option<CommandConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub activation: Vec<CommandConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deactivation: Vec<CommandConfig>,
}

/// Everything a backend knows about an environment before it gets an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PythonEnvironmentInfo {
    pub name: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_display_name: Option<String>,
    pub display_path: String,
    pub version: String,
    /// Path the environment is addressed by (for conda, the interpreter).
    pub environment_path: PathBuf,
    /// Root prefix of the environment.
    pub sys_prefix: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Filled in lazily by `resolve`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_info: Option<ExecInfo>,
}

/// A Python environment owned by exactly one environment manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PythonEnvironment {
    pub env_id: EnvironmentId,
    #[serde(flatten)]
    pub info: PythonEnvironmentInfo,
}

impl PythonEnvironment {
    pub fn new(env_id: EnvironmentId, info: PythonEnvironmentInfo) -> Self {
        Self { env_id, info }
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn manager_id(&self) -> &str {
        &self.env_id.manager_id
    }

    pub fn environment_path(&self) -> &Path {
        &self.info.environment_path
    }

    pub fn has_exec_info(&self) -> bool {
        self.info.exec_info.is_some()
    }
}

/// Identity of a package inside one environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageId {
    pub id: String,
    pub manager_id: String,
    pub environment_id: String,
}

impl PackageId {
    pub fn generate(name: &str, manager_id: &str, environment: &EnvironmentId) -> Self {
        Self {
            id: generate_id(name),
            manager_id: manager_id.to_string(),
            environment_id: environment.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInfo {
    pub name: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PackageInfo {
    pub fn new(name: impl Into<String>, version: Option<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            version,
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Package {
    pub pkg_id: PackageId,
    #[serde(flatten)]
    pub info: PackageInfo,
}

/// A logical unit (folder, file or manifest) that can be bound to an
/// environment. Existence is independent of any environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub uri: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Project {
    /// Project named after the last component of `uri`.
    pub fn from_path(uri: impl Into<PathBuf>) -> Self {
        let uri = normalize_path(&uri.into());
        let name = uri
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| uri.to_string_lossy().to_string());
        Self {
            name,
            uri,
            description: None,
        }
    }
}

/// Which environments a `get_environments` call targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetEnvironmentsScope {
    /// Every environment known to the manager(s).
    All,
    /// Environments usable outside any project.
    Global,
    /// Environments associated with this location.
    Uri(PathBuf),
}

/// Where a new environment should be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateScope {
    Global,
    Uris(Vec<PathBuf>),
}

impl CreateScope {
    /// Location used to pick the manager: the first uri, if any.
    pub fn primary_uri(&self) -> Option<&Path> {
        match self {
            CreateScope::Global => None,
            CreateScope::Uris(uris) => uris.first().map(PathBuf::as_path),
        }
    }
}
