//! Error types surfaced by the registry and the API facade.

/// Errors returned by mutating API operations.
///
/// Read-style operations never return these; they degrade to `None` or an
/// empty list instead.
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("No environment manager found for {scope}")]
    ManagerNotFound { scope: String },

    #[error("No package manager found for environment {environment}")]
    PackageManagerNotFound { environment: String },

    #[error("Manager {id} is not registered")]
    UnregisteredManager { id: String },

    #[error("Manager {id} is already registered")]
    DuplicateManager { id: String },

    /// A manager chose to propagate an internal failure.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl EnvError {
    pub(crate) fn manager_not_found(scope: Option<&std::path::Path>) -> Self {
        EnvError::ManagerNotFound {
            scope: scope
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "global scope".to_string()),
        }
    }
}

/// A `resolve` produced an environment without execution info.
#[derive(Debug, thiserror::Error)]
#[error("Environment {environment} resolved by {manager_id} has no execution info")]
pub struct IncompleteResolution {
    pub environment: String,
    pub manager_id: String,
}
