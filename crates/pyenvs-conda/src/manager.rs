//! The conda environment manager.
//!
//! Owns the discovered collection, the project-to-environment table and the
//! global default. Discovery runs once, lazily, on the first read; after
//! that only an explicit `refresh` rescans.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use pyenvs_api::model::normalize_path;
use pyenvs_api::{
    ChangeKind, CreateScope, DidChangeEnvironmentEvent, DidChangeEnvironmentsEvent,
    EnvironmentChange, EnvironmentId, EnvironmentManager, EventChannel, GetEnvironmentsScope,
    PersistentState, ProjectRegistry, PythonEnvironment, PythonEnvironmentInfo,
};
use tokio::sync::{broadcast, Mutex, OnceCell};

use crate::paths::CondaPathStore;
use crate::tooling::{CondaTooling, CreateRequest};

pub const CONDA_MANAGER_ID: &str = "conda";

const BASE_ENV_NAME: &str = "base";

#[derive(Default)]
struct ManagerState {
    collection: Vec<Arc<PythonEnvironment>>,
    scope_to_env: HashMap<PathBuf, Arc<PythonEnvironment>>,
    global_env: Option<Arc<PythonEnvironment>>,
    /// Disposal handles of the environments this manager created, keyed by id.
    created: HashMap<String, Arc<PythonEnvironment>>,
    /// Set once a discovery pass (lazy or refresh) has filled the collection.
    discovered: bool,
}

impl ManagerState {
    fn find_by_path(&self, path: &Path) -> Option<Arc<PythonEnvironment>> {
        let target = normalize_path(path);
        self.collection
            .iter()
            .find(|env| path_matches(env.environment_path(), &target))
            .cloned()
    }

    fn find_by_id(&self, env_id: &EnvironmentId) -> Option<Arc<PythonEnvironment>> {
        self.collection
            .iter()
            .find(|env| &env.env_id == env_id)
            .cloned()
    }

    fn base(&self) -> Option<Arc<PythonEnvironment>> {
        self.collection
            .iter()
            .find(|env| env.name() == BASE_ENV_NAME)
            .cloned()
    }

    /// Append a newly known environment with an identity unique in the
    /// collection.
    fn push(&mut self, info: PythonEnvironmentInfo) -> Arc<PythonEnvironment> {
        let env = Arc::new(PythonEnvironment::new(self.unique_id(&info.name), info));
        self.collection.push(env.clone());
        env
    }

    fn unique_id(&self, name: &str) -> EnvironmentId {
        loop {
            let env_id = EnvironmentId::generate(name, CONDA_MANAGER_ID);
            if !self.collection.iter().any(|env| env.env_id.id == env_id.id) {
                return env_id;
            }
            warn!("[conda] Generated id {} is taken, retrying", env_id.id);
        }
    }

    /// Projects currently associated with `env_id`.
    fn projects_for(&self, env_id: &EnvironmentId) -> Vec<PathBuf> {
        let mut projects = self
            .scope_to_env
            .iter()
            .filter(|(_, env)| &env.env_id == env_id)
            .map(|(project, _)| project.clone())
            .collect::<Vec<_>>();
        projects.sort();
        projects
    }

    /// Track a created environment so a rescan or a removal can dispose it.
    fn register_created(&mut self, env: &Arc<PythonEnvironment>) {
        self.created.insert(env.env_id.id.clone(), env.clone());
    }

    /// Dispose the creation handle of `env_id`: the environment leaves the
    /// collection and every scope pointing at it.
    fn dispose_created(&mut self, env_id: &EnvironmentId) -> Option<Arc<PythonEnvironment>> {
        let env = self.created.remove(&env_id.id)?;
        self.collection.retain(|e| e.env_id != env.env_id);
        self.scope_to_env.retain(|_, e| e.env_id != env.env_id);
        Some(env)
    }

    fn dispose_all_created(&mut self) -> Vec<Arc<PythonEnvironment>> {
        let ids = self
            .created
            .values()
            .map(|env| env.env_id.clone())
            .collect::<Vec<_>>();
        ids.iter()
            .filter_map(|env_id| self.dispose_created(env_id))
            .collect()
    }

    /// Drop `env_id` from the collection and from every association.
    fn forget(&mut self, env_id: &EnvironmentId) {
        self.dispose_created(env_id);
        self.collection.retain(|env| &env.env_id != env_id);
        self.scope_to_env.retain(|_, env| &env.env_id != env_id);
        if self
            .global_env
            .as_ref()
            .is_some_and(|env| &env.env_id == env_id)
        {
            self.global_env = None;
        }
    }

    /// Swap in a more complete instance under the same identity.
    fn upgrade(&mut self, env: &Arc<PythonEnvironment>) {
        for slot in self
            .collection
            .iter_mut()
            .chain(self.scope_to_env.values_mut())
            .chain(self.global_env.iter_mut())
        {
            if slot.env_id == env.env_id {
                *slot = env.clone();
            }
        }
    }
}

/// `env_path` addresses `target` directly, or `target` is its parent or
/// grandparent (an environment root given for an interpreter path).
fn path_matches(env_path: &Path, target: &Path) -> bool {
    let env_path = normalize_path(env_path);
    env_path.ancestors().take(3).any(|candidate| candidate == target)
}

/// Order candidates shortest path first, then lexicographically.
fn sort_candidates(candidates: &mut [Arc<PythonEnvironment>]) {
    candidates.sort_by(|a, b| {
        let (a, b) = (a.environment_path().as_os_str(), b.environment_path().as_os_str());
        a.len().cmp(&b.len()).then_with(|| a.cmp(b))
    });
}

pub struct CondaEnvManager {
    tooling: Arc<dyn CondaTooling>,
    paths: CondaPathStore,
    projects: Arc<ProjectRegistry>,
    state: Mutex<ManagerState>,
    initialized: OnceCell<()>,
    environments_changed: EventChannel<DidChangeEnvironmentsEvent>,
    environment_changed: EventChannel<DidChangeEnvironmentEvent>,
}

impl CondaEnvManager {
    pub fn new(
        tooling: Arc<dyn CondaTooling>,
        state: Arc<PersistentState>,
        projects: Arc<ProjectRegistry>,
    ) -> Self {
        Self {
            tooling,
            paths: CondaPathStore::new(state),
            projects,
            state: Mutex::new(ManagerState::default()),
            initialized: OnceCell::new(),
            environments_changed: EventChannel::default(),
            environment_changed: EventChannel::default(),
        }
    }

    /// Run discovery exactly once; concurrent first callers share it.
    ///
    /// A full refresh that got the state lock first counts as the discovery
    /// pass, so the lazy pass never pushes a second copy of the collection.
    async fn ensure_initialized(&self) {
        self.initialized
            .get_or_init(|| async {
                let mut state = self.state.lock().await;
                if state.discovered {
                    debug!("[conda] Skipping lazy discovery, a refresh already ran");
                    return;
                }
                state.discovered = true;
                info!("[conda] Discovering environments");
                let infos = match self.tooling.discover().await {
                    Ok(infos) => infos,
                    Err(e) => {
                        error!("[conda] Discovery failed: {:#}", e);
                        Vec::new()
                    }
                };
                for info in infos {
                    state.push(info);
                }
                self.load_env_map(&mut state).await;

                let changes = state
                    .collection
                    .iter()
                    .map(|env| EnvironmentChange {
                        kind: ChangeKind::Add,
                        environment: env.clone(),
                    })
                    .collect::<Vec<_>>();
                if !changes.is_empty() {
                    self.environments_changed
                        .emit(DidChangeEnvironmentsEvent { changes });
                }
            })
            .await;
    }

    /// Rebuild the global default and the project associations from the
    /// collection and the persisted paths.
    async fn load_env_map(&self, state: &mut ManagerState) {
        state.global_env = None;
        state.scope_to_env.clear();

        if let Some(global) = self.paths.global().await {
            let found = match state.find_by_path(&global) {
                Some(env) => Some(env),
                None => self.resolve_standalone(state, &global).await,
            };
            state.global_env = found;
        }
        if state.global_env.is_none() {
            state.global_env = state.base();
        }

        let project_paths = self.projects.paths();
        let selections = self.paths.selections().await;
        let mut candidates = state
            .collection
            .iter()
            .filter(|env| {
                self.projects.get(env.environment_path()).is_some()
                    || project_paths
                        .iter()
                        .any(|p| p.starts_with(normalize_path(&env.info.sys_prefix)))
            })
            .cloned()
            .collect::<Vec<_>>();
        sort_candidates(&mut candidates);

        for project in &project_paths {
            let saved = selections
                .iter()
                .find(|(scope, _)| scope == project)
                .map(|(_, saved)| saved);
            let env = match saved {
                Some(saved) => match state.find_by_path(saved) {
                    Some(env) => Some(env),
                    None => self.resolve_standalone(state, saved).await,
                },
                None if candidates.len() == 1 => Some(candidates[0].clone()),
                None => candidates
                    .iter()
                    .find(|env| {
                        self.projects
                            .get(env.environment_path())
                            .is_some_and(|owner| &owner.uri == project)
                    })
                    .cloned(),
            };
            match env {
                Some(env) => {
                    debug!("[conda] {:?} -> {}", project, env.name());
                    state.scope_to_env.insert(project.clone(), env);
                }
                None => debug!("[conda] {:?} has no environment", project),
            }
        }

        // Selections made for plain paths outside any project.
        for (scope, saved) in selections {
            if project_paths.contains(&scope) {
                continue;
            }
            let env = match state.find_by_path(&saved) {
                Some(env) => Some(env),
                None => self.resolve_standalone(state, &saved).await,
            };
            if let Some(env) = env {
                debug!("[conda] {:?} -> {}", scope, env.name());
                state.scope_to_env.insert(scope, env);
            }
        }
    }

    /// Resolve a persisted path that discovery did not report (portable
    /// installs) and add it to the collection.
    async fn resolve_standalone(
        &self,
        state: &mut ManagerState,
        path: &Path,
    ) -> Option<Arc<PythonEnvironment>> {
        match self.tooling.resolve_path(path).await {
            Ok(Some(info)) => Some(state.push(info)),
            Ok(None) => {
                warn!("[conda] Saved environment {:?} no longer resolves", path);
                None
            }
            Err(e) => {
                error!("[conda] Failed to resolve {:?}: {:#}", path, e);
                None
            }
        }
    }

    /// The project owning `uri`, or `uri` itself.
    fn scope_key(&self, uri: &Path) -> PathBuf {
        self.projects
            .get(uri)
            .map(|project| project.uri)
            .unwrap_or_else(|| normalize_path(uri))
    }

    /// The collection's instance of `environment`, adding it if unknown.
    fn adopt(
        &self,
        state: &mut ManagerState,
        environment: &PythonEnvironment,
    ) -> Arc<PythonEnvironment> {
        if let Some(env) = state
            .find_by_id(&environment.env_id)
            .or_else(|| state.find_by_path(environment.environment_path()))
        {
            return env;
        }
        let env = Arc::new(environment.clone());
        state.collection.push(env.clone());
        self.environments_changed
            .emit(DidChangeEnvironmentsEvent::added(env.clone()));
        env
    }

    fn emit_if_changed(
        &self,
        uri: Option<PathBuf>,
        old: Option<Arc<PythonEnvironment>>,
        new: Option<Arc<PythonEnvironment>>,
    ) {
        let same = match (&old, &new) {
            (Some(old), Some(new)) => old.env_id == new.env_id,
            (None, None) => true,
            _ => false,
        };
        if !same {
            self.environment_changed
                .emit(DidChangeEnvironmentEvent { uri, old, new });
        }
    }
}

#[async_trait]
impl EnvironmentManager for CondaEnvManager {
    fn id(&self) -> &str {
        CONDA_MANAGER_ID
    }

    fn name(&self) -> &str {
        "conda"
    }

    fn display_name(&self) -> &str {
        "Conda"
    }

    fn preferred_package_manager_id(&self) -> &str {
        CONDA_MANAGER_ID
    }

    async fn create(&self, scope: &CreateScope) -> Option<Arc<PythonEnvironment>> {
        self.ensure_initialized().await;
        let request = match scope {
            CreateScope::Uris(uris) if uris.len() == 1 => {
                CreateRequest::Prefix(self.scope_key(&uris[0]).join(".conda"))
            }
            _ => CreateRequest::Named(pyenvs_api::model::generate_id("env")),
        };

        let info = match self.tooling.create(&request).await {
            Ok(info) => info,
            Err(e) => {
                error!("[conda] Failed to create environment {:?}: {:#}", request, e);
                return None;
            }
        };

        let mut state = self.state.lock().await;
        let env = state.push(info);
        state.register_created(&env);
        info!("[conda] Created {} at {:?}", env.name(), env.info.sys_prefix);
        self.environments_changed
            .emit(DidChangeEnvironmentsEvent::added(env.clone()));
        Some(env)
    }

    async fn remove(&self, environment: &PythonEnvironment) {
        self.ensure_initialized().await;
        let (removed, projects) = {
            let state = self.state.lock().await;
            let removed = state
                .find_by_id(&environment.env_id)
                .unwrap_or_else(|| Arc::new(environment.clone()));
            (removed, state.projects_for(&environment.env_id))
        };

        if let Err(e) = self.tooling.delete(environment).await {
            error!(
                "[conda] Failed to remove {} at {:?}: {:#}",
                environment.name(),
                environment.info.sys_prefix,
                e
            );
            return;
        }

        self.state.lock().await.forget(&environment.env_id);
        info!("[conda] Removed {}", removed.name());

        let environments_changed = self.environments_changed.clone();
        let environment_changed = self.environment_changed.clone();
        tokio::spawn(async move {
            environments_changed.emit(DidChangeEnvironmentsEvent::removed(removed.clone()));
            for project in projects {
                environment_changed.emit(DidChangeEnvironmentEvent {
                    uri: Some(project),
                    old: Some(removed.clone()),
                    new: None,
                });
            }
        });
    }

    async fn refresh(&self, scope: Option<&Path>) {
        if let Some(scope) = scope {
            debug!("[conda] Ignoring refresh scoped to {:?}", scope);
            return;
        }

        let mut state = self.state.lock().await;
        info!("[conda] Refreshing environments");
        let previous = state.collection.clone();
        let disposed = state.dispose_all_created();

        let (rescanned, changes) = match self.tooling.discover().await {
            Ok(infos) => {
                state.collection.clear();
                for info in infos {
                    state.push(info);
                }
                state.discovered = true;
                self.load_env_map(&mut state).await;

                let changes = previous
                    .into_iter()
                    .map(|env| EnvironmentChange {
                        kind: ChangeKind::Remove,
                        environment: env,
                    })
                    .chain(state.collection.iter().map(|env| EnvironmentChange {
                        kind: ChangeKind::Add,
                        environment: env.clone(),
                    }))
                    .collect::<Vec<_>>();
                (true, changes)
            }
            Err(e) => {
                error!("[conda] Refresh failed: {:#}", e);
                if state
                    .global_env
                    .as_ref()
                    .is_some_and(|global| disposed.iter().any(|env| env.env_id == global.env_id))
                {
                    state.global_env = state.base();
                }
                let changes = disposed
                    .into_iter()
                    .map(|env| EnvironmentChange {
                        kind: ChangeKind::Remove,
                        environment: env,
                    })
                    .collect::<Vec<_>>();
                (false, changes)
            }
        };
        drop(state);

        // Settle the lazy pass now; it sees `discovered` and stays out.
        if rescanned {
            self.initialized.get_or_init(|| async {}).await;
        }

        if !changes.is_empty() {
            self.environments_changed
                .emit(DidChangeEnvironmentsEvent { changes });
        }
    }

    async fn get_environments(&self, scope: &GetEnvironmentsScope) -> Vec<Arc<PythonEnvironment>> {
        self.ensure_initialized().await;
        let state = self.state.lock().await;
        match scope {
            GetEnvironmentsScope::All => state.collection.clone(),
            GetEnvironmentsScope::Global => state
                .collection
                .iter()
                .filter(|env| self.projects.get(env.environment_path()).is_none())
                .cloned()
                .collect(),
            GetEnvironmentsScope::Uri(uri) => state
                .scope_to_env
                .get(&self.scope_key(uri))
                .cloned()
                .into_iter()
                .collect(),
        }
    }

    async fn set(&self, scope: Option<&Path>, environment: Option<&PythonEnvironment>) -> Result<()> {
        if let Some(env) = environment {
            if env.manager_id() != CONDA_MANAGER_ID {
                bail!("{} is not a conda environment", env.env_id);
            }
        }
        self.ensure_initialized().await;

        match scope {
            None => {
                self.paths
                    .set_global(environment.map(PythonEnvironment::environment_path))
                    .await?;
                let mut state = self.state.lock().await;
                let old = state.global_env.clone();
                let new = match environment {
                    Some(env) => Some(self.adopt(&mut state, env)),
                    None => state.base(),
                };
                state.global_env = new.clone();
                self.emit_if_changed(None, old, new);
            }
            Some(uri) => {
                let project = self.scope_key(uri);
                self.paths
                    .set_project(&project, environment.map(PythonEnvironment::environment_path))
                    .await?;
                let mut state = self.state.lock().await;
                let old = state
                    .scope_to_env
                    .get(&project)
                    .cloned()
                    .or_else(|| state.global_env.clone());
                let new = match environment {
                    Some(env) => {
                        let env = self.adopt(&mut state, env);
                        state.scope_to_env.insert(project.clone(), env.clone());
                        Some(env)
                    }
                    None => {
                        state.scope_to_env.remove(&project);
                        state.global_env.clone()
                    }
                };
                self.emit_if_changed(Some(project), old, new);
            }
        }
        Ok(())
    }

    async fn get(&self, scope: Option<&Path>) -> Option<Arc<PythonEnvironment>> {
        self.ensure_initialized().await;
        let state = self.state.lock().await;
        match scope {
            None => state.global_env.clone(),
            Some(uri) => state
                .scope_to_env
                .get(&self.scope_key(uri))
                .cloned()
                .or_else(|| state.global_env.clone()),
        }
    }

    async fn resolve(&self, context: &Path) -> Option<Arc<PythonEnvironment>> {
        self.ensure_initialized().await;
        let info = match self.tooling.resolve_path(context).await {
            Ok(Some(info)) => info,
            Ok(None) => return None,
            Err(e) => {
                error!("[conda] Failed to resolve {:?}: {:#}", context, e);
                return None;
            }
        };

        let mut state = self.state.lock().await;
        if let Some(existing) = state.find_by_path(&info.environment_path) {
            if existing.has_exec_info() || info.exec_info.is_none() {
                return Some(existing);
            }
            let completed = Arc::new(PythonEnvironment::new(existing.env_id.clone(), info));
            state.upgrade(&completed);
            return Some(completed);
        }

        let env = state.push(info);
        self.environments_changed
            .emit(DidChangeEnvironmentsEvent::added(env.clone()));
        Some(env)
    }

    async fn clear_cache(&self) {
        if let Err(e) = self.tooling.clear_cache().await {
            error!("[conda] Failed to clear cache: {:#}", e);
        }
    }

    fn subscribe_environments(&self) -> Option<broadcast::Receiver<DidChangeEnvironmentsEvent>> {
        Some(self.environments_changed.subscribe())
    }

    fn subscribe_environment(&self) -> Option<broadcast::Receiver<DidChangeEnvironmentEvent>> {
        Some(self.environment_changed.subscribe())
    }
}
