//! Installed packages of conda environments, read from `conda-meta`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{error, info};
use pyenvs_api::{
    ChangeKind, DidChangePackagesEvent, EnvironmentId, EventChannel, Package, PackageChange,
    PackageId, PackageInfo, PackageManager, PythonEnvironment,
};
use rattler_conda_types::PrefixRecord;
use tokio::sync::{broadcast, Mutex};

use crate::manager::CONDA_MANAGER_ID;

/// Lists what is installed in a conda prefix. Installing and uninstalling
/// are left to conda itself.
#[derive(Default)]
pub struct CondaPackageManager {
    cache: Mutex<HashMap<EnvironmentId, Vec<Arc<Package>>>>,
    packages_changed: EventChannel<DidChangePackagesEvent>,
}

impl CondaPackageManager {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Read the package records of `environment` sorted by name.
async fn read_packages(environment: &PythonEnvironment) -> Result<Vec<Arc<Package>>> {
    let prefix: PathBuf = environment.info.sys_prefix.clone();
    let records = tokio::task::spawn_blocking(move || {
        PrefixRecord::collect_from_prefix::<PrefixRecord>(Path::new(&prefix))
    })
    .await??;

    let mut packages = records
        .into_iter()
        .map(|record| {
            let package = record.repodata_record.package_record;
            let name = package.name.as_normalized().to_string();
            let info = PackageInfo::new(name.clone(), Some(package.version.to_string()));
            Arc::new(Package {
                pkg_id: PackageId::generate(&name, CONDA_MANAGER_ID, &environment.env_id),
                info,
            })
        })
        .collect::<Vec<_>>();
    packages.sort_by(|a, b| a.info.name.cmp(&b.info.name));
    Ok(packages)
}

#[async_trait]
impl PackageManager for CondaPackageManager {
    fn id(&self) -> &str {
        CONDA_MANAGER_ID
    }

    fn name(&self) -> &str {
        "conda"
    }

    fn display_name(&self) -> &str {
        "Conda"
    }

    async fn refresh(&self, environment: &PythonEnvironment) -> Result<()> {
        let packages = read_packages(environment).await?;
        info!(
            "[conda] {} has {} packages",
            environment.name(),
            packages.len()
        );

        let previous = self
            .cache
            .lock()
            .await
            .insert(environment.env_id.clone(), packages.clone())
            .unwrap_or_default();

        let changes = previous
            .into_iter()
            .map(|package| PackageChange {
                kind: ChangeKind::Remove,
                package,
            })
            .chain(packages.into_iter().map(|package| PackageChange {
                kind: ChangeKind::Add,
                package,
            }))
            .collect::<Vec<_>>();
        self.packages_changed.emit(DidChangePackagesEvent {
            environment: Arc::new(environment.clone()),
            manager_id: CONDA_MANAGER_ID.to_string(),
            changes,
        });
        Ok(())
    }

    async fn get_packages(&self, environment: &PythonEnvironment) -> Option<Vec<Arc<Package>>> {
        if let Some(cached) = self.cache.lock().await.get(&environment.env_id) {
            return Some(cached.clone());
        }
        match read_packages(environment).await {
            Ok(packages) => {
                self.cache
                    .lock()
                    .await
                    .insert(environment.env_id.clone(), packages.clone());
                Some(packages)
            }
            Err(e) => {
                error!(
                    "[conda] Failed to read packages of {} at {:?}: {:#}",
                    environment.name(),
                    environment.info.sys_prefix,
                    e
                );
                None
            }
        }
    }

    async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    fn subscribe_packages(&self) -> Option<broadcast::Receiver<DidChangePackagesEvent>> {
        Some(self.packages_changed.subscribe())
    }
}
