//! In-memory managers for exercising the registry and the API facade.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pyenvs_api::{
    CommandConfig, CreateScope, DidChangeEnvironmentEvent, DidChangeEnvironmentsEvent,
    DidChangePackagesEvent, EnvironmentId, EnvironmentManager, EnvsSettings, EventChannel,
    ExecInfo, GetEnvironmentsScope, ManagerRegistry, Notifier, Package, PackageId, PackageInfo,
    PackageManager, ProjectRegistry, PythonEnvironment, PythonEnvironmentApi,
    PythonEnvironmentInfo,
};
use tokio::sync::broadcast;

pub fn environment(manager_id: &str, name: &str, with_exec: bool) -> Arc<PythonEnvironment> {
    let prefix = PathBuf::from(format!("/envs/{manager_id}/{name}"));
    let python = prefix.join("bin").join("python");
    Arc::new(PythonEnvironment::new(
        EnvironmentId::generate(name, manager_id),
        PythonEnvironmentInfo {
            name: name.to_string(),
            display_name: name.to_string(),
            short_display_name: None,
            display_path: prefix.display().to_string(),
            version: "3.12.1".to_string(),
            environment_path: python.clone(),
            sys_prefix: prefix,
            description: None,
            group: None,
            exec_info: with_exec.then(|| ExecInfo {
                run: CommandConfig::new(python),
                activated_run: None,
                activation: Vec::new(),
                deactivation: Vec::new(),
            }),
        },
    ))
}

pub struct MockEnvManager {
    id: String,
    pub envs: Mutex<Vec<Arc<PythonEnvironment>>>,
    pub selected: Mutex<HashMap<Option<PathBuf>, Arc<PythonEnvironment>>>,
    pub resolve_result: Mutex<Option<Arc<PythonEnvironment>>>,
    pub created: Mutex<Option<Arc<PythonEnvironment>>>,
    pub removed: Mutex<Vec<String>>,
    pub refresh_calls: AtomicUsize,
    pub environments_changed: EventChannel<DidChangeEnvironmentsEvent>,
    pub environment_changed: EventChannel<DidChangeEnvironmentEvent>,
}

impl MockEnvManager {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            envs: Mutex::new(Vec::new()),
            selected: Mutex::new(HashMap::new()),
            resolve_result: Mutex::new(None),
            created: Mutex::new(None),
            removed: Mutex::new(Vec::new()),
            refresh_calls: AtomicUsize::new(0),
            environments_changed: EventChannel::default(),
            environment_changed: EventChannel::default(),
        })
    }

    pub fn with_envs(id: &str, names: &[&str]) -> Arc<Self> {
        let manager = Self::new(id);
        {
            let mut envs = manager.envs.lock().unwrap();
            for name in names {
                envs.push(environment(id, name, true));
            }
        }
        manager
    }

    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EnvironmentManager for MockEnvManager {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.id
    }

    fn preferred_package_manager_id(&self) -> &str {
        "mock-pip"
    }

    async fn create(&self, _scope: &CreateScope) -> Option<Arc<PythonEnvironment>> {
        let env = self.created.lock().unwrap().clone()?;
        self.envs.lock().unwrap().push(env.clone());
        self.environments_changed
            .emit(DidChangeEnvironmentsEvent::added(env.clone()));
        Some(env)
    }

    async fn remove(&self, environment: &PythonEnvironment) {
        self.envs
            .lock()
            .unwrap()
            .retain(|e| e.env_id != environment.env_id);
        self.removed
            .lock()
            .unwrap()
            .push(environment.env_id.id.clone());
    }

    async fn refresh(&self, _scope: Option<&Path>) {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn get_environments(&self, _scope: &GetEnvironmentsScope) -> Vec<Arc<PythonEnvironment>> {
        self.envs.lock().unwrap().clone()
    }

    async fn set(
        &self,
        scope: Option<&Path>,
        environment: Option<&PythonEnvironment>,
    ) -> anyhow::Result<()> {
        let key = scope.map(Path::to_path_buf);
        let mut selected = self.selected.lock().unwrap();
        let old = selected.get(&key).cloned();
        match environment {
            Some(env) => {
                selected.insert(key.clone(), Arc::new(env.clone()));
            }
            None => {
                selected.remove(&key);
            }
        }
        self.environment_changed.emit(DidChangeEnvironmentEvent {
            uri: key,
            old,
            new: environment.map(|e| Arc::new(e.clone())),
        });
        Ok(())
    }

    async fn get(&self, scope: Option<&Path>) -> Option<Arc<PythonEnvironment>> {
        let selected = self.selected.lock().unwrap();
        selected
            .get(&scope.map(Path::to_path_buf))
            .or_else(|| selected.get(&None))
            .cloned()
    }

    async fn resolve(&self, _context: &Path) -> Option<Arc<PythonEnvironment>> {
        self.resolve_result.lock().unwrap().clone()
    }

    fn subscribe_environments(&self) -> Option<broadcast::Receiver<DidChangeEnvironmentsEvent>> {
        Some(self.environments_changed.subscribe())
    }

    fn subscribe_environment(&self) -> Option<broadcast::Receiver<DidChangeEnvironmentEvent>> {
        Some(self.environment_changed.subscribe())
    }
}

pub struct MockPackageManager {
    id: String,
    pub installed: Mutex<HashMap<String, Vec<String>>>,
    pub packages_changed: EventChannel<DidChangePackagesEvent>,
}

impl MockPackageManager {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            installed: Mutex::new(HashMap::new()),
            packages_changed: EventChannel::default(),
        })
    }
}

#[async_trait]
impl PackageManager for MockPackageManager {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.id
    }

    async fn install(&self, environment: &PythonEnvironment, packages: &[String]) -> anyhow::Result<()> {
        self.installed
            .lock()
            .unwrap()
            .entry(environment.env_id.id.clone())
            .or_default()
            .extend(packages.iter().cloned());
        Ok(())
    }

    async fn refresh(&self, _environment: &PythonEnvironment) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_packages(&self, environment: &PythonEnvironment) -> Option<Vec<Arc<Package>>> {
        let installed = self.installed.lock().unwrap();
        let names = installed.get(&environment.env_id.id)?;
        Some(
            names
                .iter()
                .map(|name| {
                    Arc::new(Package {
                        pkg_id: PackageId::generate(name, &self.id, &environment.env_id),
                        info: PackageInfo::new(name.clone(), None),
                    })
                })
                .collect(),
        )
    }

    fn subscribe_packages(&self) -> Option<broadcast::Receiver<DidChangePackagesEvent>> {
        Some(self.packages_changed.subscribe())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub errors: Mutex<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn show_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
}

pub struct Harness {
    pub api: PythonEnvironmentApi,
    pub notifier: Arc<RecordingNotifier>,
}

/// API with default settings (`conda` as the default manager).
pub fn harness(settings: EnvsSettings) -> Harness {
    let projects = Arc::new(ProjectRegistry::from_settings(&settings));
    let managers = Arc::new(ManagerRegistry::new(settings, projects));
    let notifier = Arc::new(RecordingNotifier::default());
    Harness {
        api: PythonEnvironmentApi::new(managers, notifier.clone()),
        notifier,
    }
}
