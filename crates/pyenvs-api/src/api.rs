//! The public operation surface.
//!
//! [`PythonEnvironmentApi`] never discovers anything itself. Every call is
//! routed through the [`ManagerRegistry`] to the manager serving the scope.
//! Mutating calls fail with [`EnvError`] when no manager resolves; read
//! calls degrade to `None` or an empty list.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use log::{error, info};
use tokio::sync::broadcast;

use crate::error::{EnvError, IncompleteResolution};
use crate::events::{
    DidChangeEnvironmentEvent, DidChangeEnvironmentsEvent, DidChangePackagesEvent,
    DidChangeProjectsEvent,
};
use crate::manager::{EnvironmentManager, Notifier, PackageManager};
use crate::model::{
    CreateScope, EnvironmentId, GetEnvironmentsScope, Package, PackageId, PackageInfo, Project,
    PythonEnvironment, PythonEnvironmentInfo,
};
use crate::projects::ProjectRegistry;
use crate::registry::{ManagerLookup, ManagerRegistration, ManagerRegistry};

/// Message shown when a resolve comes back without execution info.
pub const INCOMPLETE_RESOLUTION_MESSAGE: &str =
    "The Python environment was not resolved correctly. See the log for details.";

pub struct PythonEnvironmentApi {
    managers: Arc<ManagerRegistry>,
    projects: Arc<ProjectRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl PythonEnvironmentApi {
    pub fn new(managers: Arc<ManagerRegistry>, notifier: Arc<dyn Notifier>) -> Self {
        let projects = managers.projects().clone();
        Self {
            managers,
            projects,
            notifier,
        }
    }

    pub fn managers(&self) -> &Arc<ManagerRegistry> {
        &self.managers
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub fn register_environment_manager(
        &self,
        manager: Arc<dyn EnvironmentManager>,
    ) -> Result<ManagerRegistration, EnvError> {
        self.managers.register_environment_manager(manager)
    }

    pub fn register_package_manager(
        &self,
        manager: Arc<dyn PackageManager>,
    ) -> Result<ManagerRegistration, EnvError> {
        self.managers.register_package_manager(manager)
    }

    // ------------------------------------------------------------------
    // Environments
    // ------------------------------------------------------------------

    /// Build an environment entity for `manager` with a freshly generated
    /// identity.
    ///
    /// Identities are `<name>-<random suffix>`; uniqueness here is
    /// probabilistic. Managers that keep a collection enforce it themselves.
    pub fn create_python_environment_item(
        &self,
        info: PythonEnvironmentInfo,
        manager: &dyn EnvironmentManager,
    ) -> Result<PythonEnvironment, EnvError> {
        if !self.managers.is_environment_manager_registered(manager) {
            return Err(EnvError::UnregisteredManager {
                id: manager.id().to_string(),
            });
        }
        let env_id = EnvironmentId::generate(&info.name, manager.id());
        Ok(PythonEnvironment::new(env_id, info))
    }

    pub async fn create_environment(
        &self,
        scope: &CreateScope,
    ) -> Result<Option<Arc<PythonEnvironment>>, EnvError> {
        let uri = scope.primary_uri();
        let manager = self
            .managers
            .get_environment_manager(ManagerLookup::scope(uri))
            .ok_or_else(|| EnvError::manager_not_found(uri))?;
        Ok(manager.create(scope).await)
    }

    pub async fn remove_environment(&self, environment: &PythonEnvironment) -> Result<(), EnvError> {
        let manager = self
            .managers
            .get_environment_manager(ManagerLookup::Environment(environment))
            .ok_or_else(|| EnvError::ManagerNotFound {
                scope: environment.env_id.to_string(),
            })?;
        manager.remove(environment).await;
        Ok(())
    }

    /// `None` refreshes every registered manager concurrently.
    pub async fn refresh_environments(&self, scope: Option<&Path>) -> Result<(), EnvError> {
        match scope {
            None => {
                let managers = self.managers.environment_managers();
                join_all(managers.iter().map(|m| m.refresh(None))).await;
                Ok(())
            }
            Some(uri) => {
                let manager = self
                    .managers
                    .get_environment_manager(ManagerLookup::Uri(uri))
                    .ok_or_else(|| EnvError::manager_not_found(Some(uri)))?;
                manager.refresh(Some(uri)).await;
                Ok(())
            }
        }
    }

    /// `All` and `Global` fan out to every manager and flatten; a location
    /// goes to its manager. Unresolved scopes yield an empty list.
    pub async fn get_environments(&self, scope: &GetEnvironmentsScope) -> Vec<Arc<PythonEnvironment>> {
        match scope {
            GetEnvironmentsScope::All | GetEnvironmentsScope::Global => {
                let managers = self.managers.environment_managers();
                join_all(managers.iter().map(|m| m.get_environments(scope)))
                    .await
                    .into_iter()
                    .flatten()
                    .collect()
            }
            GetEnvironmentsScope::Uri(uri) => {
                match self.managers.get_environment_manager(ManagerLookup::Uri(uri)) {
                    Some(manager) => manager.get_environments(scope).await,
                    None => Vec::new(),
                }
            }
        }
    }

    /// Associate `environment` with `scope`. When an environment is given it
    /// is routed to the manager that owns it; otherwise to the manager for
    /// the scope.
    pub async fn set_environment(
        &self,
        scope: Option<&Path>,
        environment: Option<&PythonEnvironment>,
    ) -> Result<(), EnvError> {
        let lookup = match environment {
            Some(env) => ManagerLookup::Environment(env),
            None => ManagerLookup::scope(scope),
        };
        let manager = self
            .managers
            .get_environment_manager(lookup)
            .ok_or_else(|| EnvError::manager_not_found(scope))?;
        manager.set(scope, environment).await?;
        Ok(())
    }

    pub async fn get_environment(&self, scope: Option<&Path>) -> Option<Arc<PythonEnvironment>> {
        let manager = self
            .managers
            .get_environment_manager(ManagerLookup::scope(scope))?;
        manager.get(scope).await
    }

    /// Resolve `context` into a complete environment.
    ///
    /// A result without execution info is logged, reported through the
    /// notifier, and turned into `None`.
    pub async fn resolve_environment(&self, context: &Path) -> Option<Arc<PythonEnvironment>> {
        let manager = self
            .managers
            .get_environment_manager(ManagerLookup::Uri(context))?;
        let environment = manager.resolve(context).await?;
        if !environment.has_exec_info() {
            let problem = IncompleteResolution {
                environment: environment.env_id.to_string(),
                manager_id: manager.id().to_string(),
            };
            error!("[envs] {}: {:?}", problem, environment);
            self.notifier.show_error(INCOMPLETE_RESOLUTION_MESSAGE);
            return None;
        }
        Some(environment)
    }

    // ------------------------------------------------------------------
    // Packages
    // ------------------------------------------------------------------

    pub fn create_package_item(
        &self,
        info: PackageInfo,
        environment: &PythonEnvironment,
        manager: &dyn PackageManager,
    ) -> Result<Package, EnvError> {
        if !self.managers.is_package_manager_registered(manager) {
            return Err(EnvError::UnregisteredManager {
                id: manager.id().to_string(),
            });
        }
        let pkg_id = PackageId::generate(&info.name, manager.id(), &environment.env_id);
        Ok(Package { pkg_id, info })
    }

    fn package_manager_for(
        &self,
        environment: &PythonEnvironment,
    ) -> Result<Arc<dyn PackageManager>, EnvError> {
        self.managers
            .get_package_manager(ManagerLookup::Environment(environment))
            .ok_or_else(|| EnvError::PackageManagerNotFound {
                environment: environment.env_id.to_string(),
            })
    }

    pub async fn install_packages(
        &self,
        environment: &PythonEnvironment,
        packages: &[String],
    ) -> Result<(), EnvError> {
        let manager = self.package_manager_for(environment)?;
        info!(
            "[envs] Installing {:?} into {} via {}",
            packages,
            environment.name(),
            manager.id()
        );
        manager.install(environment, packages).await?;
        Ok(())
    }

    pub async fn uninstall_packages(
        &self,
        environment: &PythonEnvironment,
        packages: &[String],
    ) -> Result<(), EnvError> {
        let manager = self.package_manager_for(environment)?;
        manager.uninstall(environment, packages).await?;
        Ok(())
    }

    pub async fn refresh_packages(&self, environment: &PythonEnvironment) -> Result<(), EnvError> {
        let manager = self.package_manager_for(environment)?;
        manager.refresh(environment).await?;
        Ok(())
    }

    pub async fn get_packages(&self, environment: &PythonEnvironment) -> Option<Vec<Arc<Package>>> {
        let manager = self.package_manager_for(environment).ok()?;
        manager.get_packages(environment).await
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    pub fn add_projects(&self, projects: Vec<Project>) {
        self.projects.add(projects)
    }

    pub fn remove_project(&self, project: &Project) -> bool {
        self.projects.remove(project)
    }

    pub fn get_projects(&self, uris: Option<&[PathBuf]>) -> Vec<Project> {
        self.projects.get_projects(uris)
    }

    pub fn get_project(&self, uri: &Path) -> Option<Project> {
        self.projects.get(uri)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn on_did_change_environments(&self) -> broadcast::Receiver<DidChangeEnvironmentsEvent> {
        self.managers.subscribe_environments()
    }

    pub fn on_did_change_environment(&self) -> broadcast::Receiver<DidChangeEnvironmentEvent> {
        self.managers.subscribe_environment()
    }

    pub fn on_did_change_packages(&self) -> broadcast::Receiver<DidChangePackagesEvent> {
        self.managers.subscribe_packages()
    }

    pub fn on_did_change_projects(&self) -> broadcast::Receiver<DidChangeProjectsEvent> {
        self.projects.subscribe()
    }
}
