//! Conda backend for `pyenvs-api`.
//!
//! - [`CondaEnvManager`] discovers conda environments once, keeps them in a
//!   collection, and reconciles project associations with the paths the user
//!   picked in earlier sessions.
//! - [`CondaPackageManager`] lists installed packages from `conda-meta`.
//! - [`CondaTooling`] is everything that touches the conda executable;
//!   [`CondaCli`] is the real implementation.

pub mod manager;
pub mod packages;
pub mod paths;
pub mod tooling;

pub use manager::{CondaEnvManager, CONDA_MANAGER_ID};
pub use packages::CondaPackageManager;
pub use paths::CondaPathStore;
pub use tooling::{CondaCli, CondaTooling, CreateRequest};
