//! The seam between the conda manager and the `conda` executable.
//!
//! [`CondaEnvManager`](crate::CondaEnvManager) never shells out itself. It
//! calls a [`CondaTooling`], which lets tests swap in a fake and keeps
//! process handling in one place.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use pyenvs_api::{CommandConfig, ExecInfo, PythonEnvironment, PythonEnvironmentInfo};
use rattler_conda_types::PrefixRecord;
use serde::Deserialize;

/// Where a new environment should live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateRequest {
    /// `conda create --prefix <path>`
    Prefix(PathBuf),
    /// `conda create --name <name>`, placed in conda's envs directory.
    Named(String),
}

/// Operations the conda manager needs from the outside world.
#[async_trait]
pub trait CondaTooling: Send + Sync {
    /// Every environment conda knows about.
    async fn discover(&self) -> Result<Vec<PythonEnvironmentInfo>>;

    async fn create(&self, request: &CreateRequest) -> Result<PythonEnvironmentInfo>;

    async fn delete(&self, environment: &PythonEnvironment) -> Result<()>;

    /// Resolve a prefix, interpreter, or anything inside a prefix.
    ///
    /// `Ok(None)` means the path is not a conda environment.
    async fn resolve_path(&self, path: &Path) -> Result<Option<PythonEnvironmentInfo>>;

    async fn clear_cache(&self) -> Result<()> {
        Ok(())
    }
}

/// [`CondaTooling`] backed by the `conda` command line.
#[derive(Debug, Clone)]
pub struct CondaCli {
    conda: PathBuf,
}

#[derive(Deserialize)]
struct EnvList {
    envs: Vec<PathBuf>,
}

impl CondaCli {
    pub fn new(conda: impl Into<PathBuf>) -> Self {
        Self {
            conda: conda.into(),
        }
    }

    /// Use `$CONDA_EXE` when set, otherwise whatever `conda` is on `PATH`.
    pub fn from_env() -> Self {
        let conda = std::env::var_os("CONDA_EXE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("conda"));
        Self::new(conda)
    }

    pub fn executable(&self) -> &Path {
        &self.conda
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("[conda] Running {:?} {}", self.conda, args.join(" "));
        let output = tokio::process::Command::new(&self.conda)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to run {:?}", self.conda))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("conda {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn env_prefixes(&self) -> Result<Vec<PathBuf>> {
        let stdout = self.run(&["env", "list", "--json"]).await?;
        let list: EnvList =
            serde_json::from_str(&stdout).context("Unexpected output from conda env list")?;
        Ok(list.envs)
    }

    async fn describe(&self, prefix: &Path) -> PythonEnvironmentInfo {
        let python = python_path(prefix);
        let version = python_version(prefix).await.unwrap_or_default();
        let is_base = prefix.join("condabin").is_dir();
        let name = if is_base {
            "base".to_string()
        } else {
            prefix
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| prefix.display().to_string())
        };
        let named = is_base
            || prefix
                .parent()
                .and_then(Path::file_name)
                .is_some_and(|dir| dir == "envs");

        let display_name = if version.is_empty() {
            name.clone()
        } else {
            format!("{} ({})", name, version)
        };
        let prefix_arg = prefix.display().to_string();

        PythonEnvironmentInfo {
            name: name.clone(),
            display_name,
            short_display_name: Some(name),
            display_path: prefix.display().to_string(),
            version,
            environment_path: python.clone(),
            sys_prefix: prefix.to_path_buf(),
            description: None,
            group: Some(if named { "Named" } else { "Prefix" }.to_string()),
            exec_info: Some(ExecInfo {
                run: CommandConfig::new(python.clone()),
                activated_run: Some(CommandConfig::new(&self.conda).with_args([
                    "run",
                    "--live-stream",
                    "--prefix",
                    prefix_arg.as_str(),
                    "python",
                ])),
                activation: vec![
                    CommandConfig::new(&self.conda).with_args(["activate", prefix_arg.as_str()])
                ],
                deactivation: vec![CommandConfig::new(&self.conda).with_args(["deactivate"])],
            }),
        }
    }
}

#[async_trait]
impl CondaTooling for CondaCli {
    async fn discover(&self) -> Result<Vec<PythonEnvironmentInfo>> {
        let prefixes = self.env_prefixes().await?;
        let mut found = Vec::with_capacity(prefixes.len());
        for prefix in prefixes {
            if !prefix.join("conda-meta").is_dir() {
                warn!("[conda] Skipping {:?}: no conda-meta", prefix);
                continue;
            }
            found.push(self.describe(&prefix).await);
        }
        info!("[conda] Discovered {} environments", found.len());
        Ok(found)
    }

    async fn create(&self, request: &CreateRequest) -> Result<PythonEnvironmentInfo> {
        let prefix = match request {
            CreateRequest::Prefix(prefix) => {
                let prefix_arg = prefix.display().to_string();
                info!("[conda] Creating environment at {:?}", prefix);
                self.run(&["create", "--yes", "--prefix", &prefix_arg, "python"])
                    .await?;
                prefix.clone()
            }
            CreateRequest::Named(name) => {
                info!("[conda] Creating environment {}", name);
                self.run(&["create", "--yes", "--name", name, "python"])
                    .await?;
                self.env_prefixes()
                    .await?
                    .into_iter()
                    .find(|p| p.file_name().is_some_and(|n| n == name.as_str()))
                    .ok_or_else(|| anyhow!("Created environment {} is not listed by conda", name))?
            }
        };
        Ok(self.describe(&prefix).await)
    }

    async fn delete(&self, environment: &PythonEnvironment) -> Result<()> {
        let prefix = environment.info.sys_prefix.display().to_string();
        info!("[conda] Removing environment at {}", prefix);
        self.run(&["env", "remove", "--yes", "--prefix", &prefix])
            .await?;
        Ok(())
    }

    async fn resolve_path(&self, path: &Path) -> Result<Option<PythonEnvironmentInfo>> {
        match find_prefix(path) {
            Some(prefix) => Ok(Some(self.describe(&prefix).await)),
            None => Ok(None),
        }
    }

    async fn clear_cache(&self) -> Result<()> {
        self.run(&["clean", "--index-cache", "--yes"]).await?;
        Ok(())
    }
}

/// The conda prefix that `path` is, or that contains it as an interpreter
/// (`<prefix>/python.exe` or `<prefix>/bin/python`).
pub fn find_prefix(path: &Path) -> Option<PathBuf> {
    path.ancestors()
        .take(3)
        .find(|candidate| candidate.join("conda-meta").is_dir())
        .map(Path::to_path_buf)
}

fn python_path(prefix: &Path) -> PathBuf {
    #[cfg(target_os = "windows")]
    let python = prefix.join("python.exe");
    #[cfg(not(target_os = "windows"))]
    let python = prefix.join("bin").join("python");
    python
}

/// Version of the `python` package record installed in `prefix`.
async fn python_version(prefix: &Path) -> Option<String> {
    let owned = prefix.to_path_buf();
    let records = tokio::task::spawn_blocking(move || {
        PrefixRecord::collect_from_prefix::<PrefixRecord>(&owned)
    })
    .await;
    let records = match records {
        Ok(Ok(records)) => records,
        Ok(Err(e)) => {
            debug!("[conda] Could not read package records in {:?}: {}", prefix, e);
            return None;
        }
        Err(e) => {
            warn!("[conda] Reading package records in {:?} panicked: {}", prefix, e);
            return None;
        }
    };
    records.into_iter().find_map(|record| {
        let package = record.repodata_record.package_record;
        (package.name.as_normalized() == "python").then(|| package.version.to_string())
    })
}
