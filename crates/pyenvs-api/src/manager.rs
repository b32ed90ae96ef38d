//! Contracts implemented by environment and package managers.
//!
//! Managers are registered with the [`ManagerRegistry`](crate::ManagerRegistry)
//! as `Arc<dyn EnvironmentManager>` / `Arc<dyn PackageManager>`. Identity
//! comparisons between managers always go through [`EnvironmentManager::equals`]
//! / [`PackageManager::equals`], never pointer identity.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use log::error;
use tokio::sync::broadcast;

use crate::events::{DidChangeEnvironmentEvent, DidChangeEnvironmentsEvent, DidChangePackagesEvent};
use crate::model::{CreateScope, GetEnvironmentsScope, Package, PythonEnvironment};

/// A backend that discovers, creates and selects Python environments.
#[async_trait]
pub trait EnvironmentManager: Send + Sync {
    /// Stable id; every environment this manager produces carries it as
    /// `env_id.manager_id`.
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn display_name(&self) -> &str {
        self.name()
    }

    /// Package manager used for this manager's environments.
    fn preferred_package_manager_id(&self) -> &str;

    /// Structural equality used for de-duplication and event filtering.
    fn equals(&self, other: &dyn EnvironmentManager) -> bool {
        self.id() == other.id()
    }

    /// Create a new environment. `None` when the backend cannot or did not
    /// create one; failures are logged by the manager.
    async fn create(&self, _scope: &CreateScope) -> Option<Arc<PythonEnvironment>> {
        None
    }

    async fn remove(&self, _environment: &PythonEnvironment) {}

    /// Rescan. `None` is a full refresh. Must complete even on internal
    /// failure.
    async fn refresh(&self, scope: Option<&Path>);

    /// Infallible by contract: a manager that fails internally returns an
    /// empty list.
    async fn get_environments(&self, scope: &GetEnvironmentsScope) -> Vec<Arc<PythonEnvironment>>;

    /// Associate `environment` with `scope` (`None` = global); `None`
    /// environment clears the association.
    async fn set(&self, scope: Option<&Path>, environment: Option<&PythonEnvironment>)
        -> Result<()>;

    /// Environment selected for `scope`, falling back to the manager's
    /// global default.
    async fn get(&self, scope: Option<&Path>) -> Option<Arc<PythonEnvironment>>;

    /// Complete a path into a fully detailed environment.
    async fn resolve(&self, context: &Path) -> Option<Arc<PythonEnvironment>>;

    async fn clear_cache(&self) {}

    fn subscribe_environments(&self) -> Option<broadcast::Receiver<DidChangeEnvironmentsEvent>> {
        None
    }

    fn subscribe_environment(&self) -> Option<broadcast::Receiver<DidChangeEnvironmentEvent>> {
        None
    }
}

/// A backend that lists and changes the packages of an environment.
#[async_trait]
pub trait PackageManager: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    fn display_name(&self) -> &str {
        self.name()
    }

    fn equals(&self, other: &dyn PackageManager) -> bool {
        self.id() == other.id()
    }

    async fn install(&self, environment: &PythonEnvironment, packages: &[String]) -> Result<()> {
        let _ = (environment, packages);
        bail!("{} does not support installing packages", self.display_name())
    }

    async fn uninstall(&self, environment: &PythonEnvironment, packages: &[String]) -> Result<()> {
        let _ = (environment, packages);
        bail!("{} does not support uninstalling packages", self.display_name())
    }

    async fn refresh(&self, environment: &PythonEnvironment) -> Result<()>;

    async fn get_packages(&self, environment: &PythonEnvironment) -> Option<Vec<Arc<Package>>>;

    async fn clear_cache(&self) {}

    fn subscribe_packages(&self) -> Option<broadcast::Receiver<DidChangePackagesEvent>> {
        None
    }
}

/// Channel for messages the user should see.
pub trait Notifier: Send + Sync {
    fn show_error(&self, message: &str);
}

/// Log-only notifier.
///
/// Writes user-facing messages to the `log` crate at error level.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn show_error(&self, message: &str) {
        error!("[envs] {message}");
    }
}
