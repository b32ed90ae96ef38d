//! Project registry: maps filesystem locations to logical projects.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use log::info;

use crate::events::{DidChangeProjectsEvent, EventChannel};
use crate::model::{normalize_path, Project};
use crate::settings::EnvsSettings;

/// Known projects. Projects are added and removed explicitly by callers.
#[derive(Default)]
pub struct ProjectRegistry {
    projects: RwLock<Vec<Project>>,
    changed: EventChannel<DidChangeProjectsEvent>,
}

impl ProjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with the projects listed in `settings`.
    pub fn from_settings(settings: &EnvsSettings) -> Self {
        let registry = Self::new();
        let projects = settings
            .projects
            .iter()
            .map(|p| p.to_project())
            .collect::<Vec<_>>();
        registry.insert(projects);
        registry
    }

    /// Add projects, ignoring ones whose location is already registered.
    /// Emits one change event listing the projects actually added.
    pub fn add(&self, projects: Vec<Project>) {
        let added = self.insert(projects);
        if !added.is_empty() {
            info!("[projects] Added {} project(s)", added.len());
            self.changed.emit(DidChangeProjectsEvent {
                added,
                removed: Vec::new(),
            });
        }
    }

    pub fn remove(&self, project: &Project) -> bool {
        let target = normalize_path(&project.uri);
        let removed = {
            let mut projects = self.projects.write().unwrap_or_else(PoisonError::into_inner);
            let (removed, kept): (Vec<_>, Vec<_>) = projects
                .drain(..)
                .partition(|p| normalize_path(&p.uri) == target);
            *projects = kept;
            removed
        };
        if removed.is_empty() {
            return false;
        }
        info!("[projects] Removed project {:?}", project.uri);
        self.changed.emit(DidChangeProjectsEvent {
            added: Vec::new(),
            removed,
        });
        true
    }

    /// All projects, or those whose location matches one of `uris`.
    pub fn get_projects(&self, uris: Option<&[PathBuf]>) -> Vec<Project> {
        let projects = self.projects.read().unwrap_or_else(PoisonError::into_inner);
        match uris {
            None => projects.clone(),
            Some(uris) => {
                let wanted = uris.iter().map(|u| normalize_path(u)).collect::<Vec<_>>();
                projects
                    .iter()
                    .filter(|p| wanted.contains(&normalize_path(&p.uri)))
                    .cloned()
                    .collect()
            }
        }
    }

    /// The project owning `uri`: the deepest project whose location equals
    /// `uri` or contains it.
    pub fn get(&self, uri: &Path) -> Option<Project> {
        let uri = normalize_path(uri);
        let projects = self.projects.read().unwrap_or_else(PoisonError::into_inner);
        projects
            .iter()
            .filter(|p| uri.starts_with(normalize_path(&p.uri)))
            .max_by_key(|p| p.uri.components().count())
            .cloned()
    }

    /// Normalized locations of every project.
    pub fn paths(&self) -> Vec<PathBuf> {
        let projects = self.projects.read().unwrap_or_else(PoisonError::into_inner);
        projects.iter().map(|p| normalize_path(&p.uri)).collect()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DidChangeProjectsEvent> {
        self.changed.subscribe()
    }

    fn insert(&self, new: Vec<Project>) -> Vec<Project> {
        let mut projects = self.projects.write().unwrap_or_else(PoisonError::into_inner);
        let mut added = Vec::new();
        for mut project in new {
            project.uri = normalize_path(&project.uri);
            if projects.iter().any(|p| p.uri == project.uri) {
                continue;
            }
            projects.push(project.clone());
            added.push(project);
        }
        added
    }
}
