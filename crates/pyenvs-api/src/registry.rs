//! Manager registry: tracks registered environment and package managers,
//! decides which one serves a scope, and fans their events in.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use log::{debug, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use crate::error::EnvError;
use crate::events::{
    DidChangeEnvironmentEvent, DidChangeEnvironmentsEvent, DidChangePackagesEvent, EventChannel,
};
use crate::manager::{EnvironmentManager, PackageManager};
use crate::model::PythonEnvironment;
use crate::projects::ProjectRegistry;
use crate::settings::EnvsSettings;

/// What to resolve a manager from.
#[derive(Debug, Clone, Copy)]
pub enum ManagerLookup<'a> {
    /// The configured global default.
    Default,
    /// A manager id.
    Id(&'a str),
    /// The manager that owns this environment.
    Environment(&'a PythonEnvironment),
    /// The manager assigned to the project owning this location, else the
    /// configured default.
    Uri(&'a Path),
}

impl<'a> ManagerLookup<'a> {
    /// `None` maps to the global default.
    pub fn scope(scope: Option<&'a Path>) -> Self {
        match scope {
            Some(uri) => ManagerLookup::Uri(uri),
            None => ManagerLookup::Default,
        }
    }
}

struct RegistryInner {
    env_managers: RwLock<Vec<Arc<dyn EnvironmentManager>>>,
    pkg_managers: RwLock<Vec<Arc<dyn PackageManager>>>,
    settings: RwLock<EnvsSettings>,
    projects: Arc<ProjectRegistry>,
    environments_changed: EventChannel<DidChangeEnvironmentsEvent>,
    environment_changed: EventChannel<DidChangeEnvironmentEvent>,
    packages_changed: EventChannel<DidChangePackagesEvent>,
}

impl RegistryInner {
    fn env_manager_by_id(&self, id: &str) -> Option<Arc<dyn EnvironmentManager>> {
        let managers = self.env_managers.read().unwrap_or_else(PoisonError::into_inner);
        managers.iter().find(|m| m.id() == id).cloned()
    }

    fn pkg_manager_by_id(&self, id: &str) -> Option<Arc<dyn PackageManager>> {
        let managers = self.pkg_managers.read().unwrap_or_else(PoisonError::into_inner);
        managers.iter().find(|m| m.id() == id).cloned()
    }

    /// Settings key for `uri`: the owning project's location, else `uri`.
    fn project_key(&self, uri: &Path) -> PathBuf {
        self.projects
            .get(uri)
            .map(|p| p.uri)
            .unwrap_or_else(|| uri.to_path_buf())
    }

    fn env_manager_id_for(&self, uri: Option<&Path>) -> String {
        let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
        uri.and_then(|uri| settings.project(&self.project_key(uri)))
            .and_then(|p| p.env_manager.clone())
            .unwrap_or_else(|| settings.default_env_manager.clone())
    }

    fn pkg_manager_override_for(&self, uri: &Path) -> Option<String> {
        let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
        self.projects
            .get(uri)
            .and_then(|project| settings.project(&project.uri))
            .and_then(|p| p.package_manager.clone())
    }

    fn env_manager(&self, lookup: ManagerLookup<'_>) -> Option<Arc<dyn EnvironmentManager>> {
        match lookup {
            ManagerLookup::Default => self.env_manager_by_id(&self.env_manager_id_for(None)),
            ManagerLookup::Id(id) => self.env_manager_by_id(id),
            ManagerLookup::Environment(env) => self.env_manager_by_id(env.manager_id()),
            ManagerLookup::Uri(uri) => self.env_manager_by_id(&self.env_manager_id_for(Some(uri))),
        }
    }

    fn pkg_manager(&self, lookup: ManagerLookup<'_>) -> Option<Arc<dyn PackageManager>> {
        let id = match lookup {
            ManagerLookup::Default => self
                .settings
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .default_package_manager
                .clone(),
            ManagerLookup::Id(id) => id.to_string(),
            ManagerLookup::Environment(env) => {
                match self.pkg_manager_override_for(&env.info.sys_prefix) {
                    Some(id) => id,
                    None => self
                        .env_manager_by_id(env.manager_id())?
                        .preferred_package_manager_id()
                        .to_string(),
                }
            }
            ManagerLookup::Uri(uri) => match self.pkg_manager_override_for(uri) {
                Some(id) => id,
                None => self
                    .settings
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .default_package_manager
                    .clone(),
            },
        };
        self.pkg_manager_by_id(&id)
    }
}

/// Registered environment and package managers.
pub struct ManagerRegistry {
    inner: Arc<RegistryInner>,
}

impl ManagerRegistry {
    pub fn new(settings: EnvsSettings, projects: Arc<ProjectRegistry>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                env_managers: RwLock::new(Vec::new()),
                pkg_managers: RwLock::new(Vec::new()),
                settings: RwLock::new(settings),
                projects,
                environments_changed: EventChannel::default(),
                environment_changed: EventChannel::default(),
                packages_changed: EventChannel::default(),
            }),
        }
    }

    /// Register an environment manager.
    ///
    /// Its environment-list events are forwarded verbatim. Its
    /// current-environment events are forwarded only while it is still the
    /// manager resolved for the event's scope; forwarding happens on a
    /// spawned task, never inline with the emitting call.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn register_environment_manager(
        &self,
        manager: Arc<dyn EnvironmentManager>,
    ) -> Result<ManagerRegistration, EnvError> {
        {
            let mut managers = self
                .inner
                .env_managers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if managers.iter().any(|m| m.equals(manager.as_ref())) {
                return Err(EnvError::DuplicateManager {
                    id: manager.id().to_string(),
                });
            }
            managers.push(manager.clone());
        }

        let mut tasks = Vec::new();
        if let Some(rx) = manager.subscribe_environments() {
            let channel = self.inner.environments_changed.clone();
            tasks.push(tokio::spawn(forward(rx, channel)));
        }
        if let Some(rx) = manager.subscribe_environment() {
            let inner = Arc::downgrade(&self.inner);
            tasks.push(tokio::spawn(forward_if_current(rx, inner, manager.clone())));
        }

        info!("[envs] Registered environment manager {}", manager.id());
        Ok(ManagerRegistration {
            inner: Arc::downgrade(&self.inner),
            kind: RegisteredKind::Environment(manager.id().to_string()),
            tasks,
        })
    }

    /// Register a package manager; its package-list events are forwarded
    /// verbatim.
    pub fn register_package_manager(
        &self,
        manager: Arc<dyn PackageManager>,
    ) -> Result<ManagerRegistration, EnvError> {
        {
            let mut managers = self
                .inner
                .pkg_managers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if managers.iter().any(|m| m.equals(manager.as_ref())) {
                return Err(EnvError::DuplicateManager {
                    id: manager.id().to_string(),
                });
            }
            managers.push(manager.clone());
        }

        let mut tasks = Vec::new();
        if let Some(rx) = manager.subscribe_packages() {
            let channel = self.inner.packages_changed.clone();
            tasks.push(tokio::spawn(forward(rx, channel)));
        }

        info!("[envs] Registered package manager {}", manager.id());
        Ok(ManagerRegistration {
            inner: Arc::downgrade(&self.inner),
            kind: RegisteredKind::Package(manager.id().to_string()),
            tasks,
        })
    }

    /// Resolve an environment manager. Never fails; `None` when nothing
    /// matches.
    pub fn get_environment_manager(
        &self,
        lookup: ManagerLookup<'_>,
    ) -> Option<Arc<dyn EnvironmentManager>> {
        self.inner.env_manager(lookup)
    }

    pub fn get_package_manager(&self, lookup: ManagerLookup<'_>) -> Option<Arc<dyn PackageManager>> {
        self.inner.pkg_manager(lookup)
    }

    pub fn environment_managers(&self) -> Vec<Arc<dyn EnvironmentManager>> {
        self.inner
            .env_managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn package_managers(&self) -> Vec<Arc<dyn PackageManager>> {
        self.inner
            .pkg_managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_environment_manager_registered(&self, manager: &dyn EnvironmentManager) -> bool {
        self.inner
            .env_managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|m| m.equals(manager))
    }

    pub fn is_package_manager_registered(&self, manager: &dyn PackageManager) -> bool {
        self.inner
            .pkg_managers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|m| m.equals(manager))
    }

    /// Override the managers used for the project owning `uri`. `None`
    /// leaves that field unchanged.
    pub fn set_project_managers(
        &self,
        uri: &Path,
        env_manager: Option<&str>,
        package_manager: Option<&str>,
    ) {
        let key = self.inner.project_key(uri);
        let mut settings = self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = settings.project_mut(&key);
        if let Some(id) = env_manager {
            entry.env_manager = Some(id.to_string());
        }
        if let Some(id) = package_manager {
            entry.package_manager = Some(id.to_string());
        }
    }

    /// Snapshot of the settings in effect.
    pub fn settings(&self) -> EnvsSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn projects(&self) -> &Arc<ProjectRegistry> {
        &self.inner.projects
    }

    pub fn subscribe_environments(&self) -> broadcast::Receiver<DidChangeEnvironmentsEvent> {
        self.inner.environments_changed.subscribe()
    }

    pub fn subscribe_environment(&self) -> broadcast::Receiver<DidChangeEnvironmentEvent> {
        self.inner.environment_changed.subscribe()
    }

    pub fn subscribe_packages(&self) -> broadcast::Receiver<DidChangePackagesEvent> {
        self.inner.packages_changed.subscribe()
    }
}

enum RegisteredKind {
    Environment(String),
    Package(String),
}

/// Handle returned by registration. [`dispose`](Self::dispose) unregisters
/// the manager and stops forwarding its events.
#[must_use = "dropping the registration keeps the manager registered; call dispose() to remove it"]
pub struct ManagerRegistration {
    inner: Weak<RegistryInner>,
    kind: RegisteredKind,
    tasks: Vec<JoinHandle<()>>,
}

impl ManagerRegistration {
    pub fn manager_id(&self) -> &str {
        match &self.kind {
            RegisteredKind::Environment(id) | RegisteredKind::Package(id) => id,
        }
    }

    pub fn dispose(self) {
        for task in &self.tasks {
            task.abort();
        }
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match &self.kind {
            RegisteredKind::Environment(id) => {
                inner
                    .env_managers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|m| m.id() != id);
                info!("[envs] Unregistered environment manager {}", id);
            }
            RegisteredKind::Package(id) => {
                inner
                    .pkg_managers
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|m| m.id() != id);
                info!("[envs] Unregistered package manager {}", id);
            }
        }
    }
}

async fn forward<T: Clone + Send + 'static>(
    mut rx: broadcast::Receiver<T>,
    channel: EventChannel<T>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => channel.emit(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!("[envs] Event forwarding lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn forward_if_current(
    mut rx: broadcast::Receiver<DidChangeEnvironmentEvent>,
    inner: Weak<RegistryInner>,
    source: Arc<dyn EnvironmentManager>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let current = inner.env_manager(ManagerLookup::scope(event.uri.as_deref()));
                if current.is_some_and(|m| m.equals(source.as_ref())) {
                    inner.environment_changed.emit(event);
                } else {
                    debug!(
                        "[envs] Dropping environment change from {} for {:?}: not the active manager",
                        source.id(),
                        event.uri
                    );
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("[envs] Event forwarding lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
