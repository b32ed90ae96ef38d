//! Persisted environment choices.
//!
//! The user's global conda environment and the per-project selections
//! survive restarts as environment paths in [`PersistentState`]. Identities
//! are regenerated on every discovery, so only paths are stored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use pyenvs_api::model::normalize_path;
use pyenvs_api::PersistentState;

const GLOBAL_KEY: &str = "conda:global";
const WORKSPACE_KEY: &str = "conda:workspace";

pub struct CondaPathStore {
    state: Arc<PersistentState>,
}

impl CondaPathStore {
    pub fn new(state: Arc<PersistentState>) -> Self {
        Self { state }
    }

    pub async fn global(&self) -> Option<PathBuf> {
        self.state.get(GLOBAL_KEY).await
    }

    /// `None` forgets the global selection.
    pub async fn set_global(&self, path: Option<&Path>) -> Result<()> {
        match path {
            Some(path) => self.state.set(GLOBAL_KEY, &path).await,
            None => self.state.clear(Some(&[GLOBAL_KEY][..])).await,
        }
    }

    pub async fn project(&self, project: &Path) -> Option<PathBuf> {
        let mut projects = self.projects().await;
        projects.remove(&key(project)).map(PathBuf::from)
    }

    pub async fn set_project(&self, project: &Path, path: Option<&Path>) -> Result<()> {
        let mut projects = self.projects().await;
        match path {
            Some(path) => {
                projects.insert(key(project), path.to_string_lossy().into_owned());
            }
            None => {
                projects.remove(&key(project));
            }
        }
        self.state.set(WORKSPACE_KEY, &projects).await
    }

    /// Every persisted selection as `(scope, environment path)`, including
    /// scopes that are no longer projects.
    pub async fn selections(&self) -> Vec<(PathBuf, PathBuf)> {
        self.projects()
            .await
            .into_iter()
            .map(|(scope, path)| (PathBuf::from(scope), PathBuf::from(path)))
            .collect()
    }

    async fn projects(&self) -> BTreeMap<String, String> {
        self.state.get_or(WORKSPACE_KEY, BTreeMap::new()).await
    }
}

fn key(project: &Path) -> String {
    normalize_path(project).to_string_lossy().into_owned()
}
