//! Environment, package and project registry core for Python tooling hosts.
//!
//! A host (an editor extension, a CLI, a daemon) registers any number of
//! environment managers (conda, venv, ...) and package managers, then talks
//! only to [`PythonEnvironmentApi`]. The API routes every scope-qualified
//! call to the manager that serves it:
//!
//! - [`ManagerRegistry`] decides which manager owns a location, an
//!   environment, or the global scope, and fans manager events in.
//! - [`ProjectRegistry`] maps filesystem locations to projects.
//! - [`PersistentState`] is the key-value store managers persist user
//!   choices in.
//! - [`EnvContext`] hands the API to components that start before it exists.
//!
//! ```ignore
//! use pyenvs_api::{EnvContext, ManagerRegistry, ProjectRegistry, PythonEnvironmentApi};
//!
//! let settings = pyenvs_api::settings::load_settings();
//! let projects = Arc::new(ProjectRegistry::from_settings(&settings));
//! let managers = Arc::new(ManagerRegistry::new(settings, projects));
//! let api = Arc::new(PythonEnvironmentApi::new(managers, Arc::new(LogNotifier)));
//! let _conda = api.register_environment_manager(conda_manager)?;
//! let env = api.get_environment(Some(Path::new("/work/app"))).await;
//! ```

pub mod api;
pub mod context;
pub mod error;
pub mod events;
pub mod manager;
pub mod model;
pub mod projects;
pub mod registry;
pub mod settings;
pub mod state;

// Re-export key types
pub use api::PythonEnvironmentApi;
pub use context::EnvContext;
pub use error::{EnvError, IncompleteResolution};
pub use events::{
    ChangeKind, DidChangeEnvironmentEvent, DidChangeEnvironmentsEvent, DidChangePackagesEvent,
    DidChangeProjectsEvent, EnvironmentChange, EventChannel, PackageChange,
};
pub use manager::{EnvironmentManager, LogNotifier, Notifier, PackageManager};
pub use model::{
    CommandConfig, CreateScope, EnvironmentId, ExecInfo, GetEnvironmentsScope, Package, PackageId,
    PackageInfo, Project, PythonEnvironment, PythonEnvironmentInfo,
};
pub use projects::ProjectRegistry;
pub use registry::{ManagerLookup, ManagerRegistration, ManagerRegistry};
pub use settings::{EnvsSettings, ProjectSettings};
pub use state::PersistentState;
