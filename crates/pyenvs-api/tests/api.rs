//! Routing, failure policy and event fan-in of the environment API.

mod common;

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{environment, harness, MockEnvManager, MockPackageManager};
use pyenvs_api::{
    api::INCOMPLETE_RESOLUTION_MESSAGE, ChangeKind, CreateScope, EnvError, EnvironmentManager,
    EnvsSettings, GetEnvironmentsScope, PackageInfo, Project, ProjectSettings,
};
use tokio::time::timeout;

const NO_EVENT: Duration = Duration::from_millis(100);
const EVENT: Duration = Duration::from_secs(2);

fn settings_with_venv_project() -> EnvsSettings {
    let mut settings = EnvsSettings::default();
    let mut project = ProjectSettings::new("/work/venv-app");
    project.env_manager = Some("venv".to_string());
    settings.projects.push(project);
    settings.projects.push(ProjectSettings::new("/work/conda-app"));
    settings
}

// =============================================================================
// Environment routing
// =============================================================================

#[tokio::test]
async fn test_get_environments_all_fans_out_and_flattens() {
    let h = harness(EnvsSettings::default());
    let conda = MockEnvManager::with_envs("conda", &["base", "ml"]);
    let venv = MockEnvManager::with_envs("venv", &[".venv"]);
    let _c = h.api.register_environment_manager(conda).unwrap();
    let _v = h.api.register_environment_manager(venv).unwrap();

    let all = h.api.get_environments(&GetEnvironmentsScope::All).await;
    let mut names = all.iter().map(|e| e.name().to_string()).collect::<Vec<_>>();
    names.sort();
    assert_eq!(names, vec![".venv", "base", "ml"]);
}

#[tokio::test]
async fn test_get_environments_keeps_results_when_one_manager_has_none() {
    let h = harness(EnvsSettings::default());
    // A manager whose discovery failed reports an empty list.
    let broken = MockEnvManager::new("broken");
    let venv = MockEnvManager::with_envs("venv", &[".venv"]);
    let _b = h.api.register_environment_manager(broken).unwrap();
    let _v = h.api.register_environment_manager(venv).unwrap();

    let all = h.api.get_environments(&GetEnvironmentsScope::Global).await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].name(), ".venv");
}

#[tokio::test]
async fn test_get_environments_for_unresolved_uri_is_empty() {
    let h = harness(EnvsSettings::default());
    let venv = MockEnvManager::with_envs("venv", &[".venv"]);
    let _v = h.api.register_environment_manager(venv).unwrap();

    // Default manager is "conda", which is not registered.
    let envs = h
        .api
        .get_environments(&GetEnvironmentsScope::Uri(PathBuf::from("/work/x")))
        .await;
    assert!(envs.is_empty());
}

#[tokio::test]
async fn test_get_environments_for_uri_uses_project_manager() {
    let h = harness(settings_with_venv_project());
    let conda = MockEnvManager::with_envs("conda", &["base"]);
    let venv = MockEnvManager::with_envs("venv", &[".venv"]);
    let _c = h.api.register_environment_manager(conda).unwrap();
    let _v = h.api.register_environment_manager(venv).unwrap();

    let envs = h
        .api
        .get_environments(&GetEnvironmentsScope::Uri(PathBuf::from(
            "/work/venv-app/main.py",
        )))
        .await;
    assert_eq!(envs.len(), 1);
    assert_eq!(envs[0].name(), ".venv");
}

#[tokio::test]
async fn test_refresh_all_calls_every_manager_once() {
    let h = harness(EnvsSettings::default());
    let conda = MockEnvManager::new("conda");
    let venv = MockEnvManager::new("venv");
    let _c = h.api.register_environment_manager(conda.clone()).unwrap();
    let _v = h.api.register_environment_manager(venv.clone()).unwrap();

    h.api.refresh_environments(None).await.unwrap();
    assert_eq!(conda.refresh_count(), 1);
    assert_eq!(venv.refresh_count(), 1);

    h.api
        .refresh_environments(Some(Path::new("/work/x")))
        .await
        .unwrap();
    assert_eq!(conda.refresh_count(), 2);
    assert_eq!(venv.refresh_count(), 1);
}

#[tokio::test]
async fn test_refresh_scoped_without_manager_fails() {
    let h = harness(EnvsSettings::default());
    let result = h.api.refresh_environments(Some(Path::new("/work/x"))).await;
    assert!(matches!(result, Err(EnvError::ManagerNotFound { .. })));
    // Refreshing everything with nothing registered is fine.
    h.api.refresh_environments(None).await.unwrap();
}

#[tokio::test]
async fn test_create_environment_without_manager_fails() {
    let h = harness(EnvsSettings::default());
    let result = h.api.create_environment(&CreateScope::Global).await;
    assert!(matches!(result, Err(EnvError::ManagerNotFound { .. })));
}

#[tokio::test]
async fn test_create_environment_delegates_to_default_manager() {
    let h = harness(EnvsSettings::default());
    let conda = MockEnvManager::new("conda");
    *conda.created.lock().unwrap() = Some(environment("conda", "fresh", true));
    let _c = h.api.register_environment_manager(conda).unwrap();

    let created = h
        .api
        .create_environment(&CreateScope::Uris(vec![PathBuf::from("/proj")]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(created.name(), "fresh");

    let all = h.api.get_environments(&GetEnvironmentsScope::All).await;
    assert!(all.iter().any(|e| e.env_id == created.env_id));
}

#[tokio::test]
async fn test_remove_environment_with_unknown_manager_fails() {
    let h = harness(EnvsSettings::default());
    let conda = MockEnvManager::with_envs("conda", &["base"]);
    let _c = h.api.register_environment_manager(conda.clone()).unwrap();

    let orphan = environment("poetry", "orphan", true);
    assert!(h
        .api
        .managers()
        .get_environment_manager(pyenvs_api::ManagerLookup::Environment(orphan.as_ref()))
        .is_none());
    let result = h.api.remove_environment(&orphan).await;
    assert!(matches!(result, Err(EnvError::ManagerNotFound { .. })));
    assert!(conda.removed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_environment_routes_to_owner() {
    let h = harness(EnvsSettings::default());
    let conda = MockEnvManager::new("conda");
    let venv = MockEnvManager::with_envs("venv", &[".venv"]);
    let _c = h.api.register_environment_manager(conda.clone()).unwrap();
    let _v = h.api.register_environment_manager(venv.clone()).unwrap();

    let target = venv.envs.lock().unwrap()[0].clone();
    h.api.remove_environment(&target).await.unwrap();
    assert_eq!(venv.removed.lock().unwrap().as_slice(), &[target.env_id.id.clone()]);
    assert!(conda.removed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_set_and_get_environment() {
    let h = harness(EnvsSettings::default());
    let conda = MockEnvManager::with_envs("conda", &["base"]);
    let _c = h.api.register_environment_manager(conda.clone()).unwrap();

    let base = conda.envs.lock().unwrap()[0].clone();
    h.api.set_environment(None, Some(base.as_ref())).await.unwrap();
    let current = h.api.get_environment(Some(Path::new("/anywhere"))).await.unwrap();
    assert_eq!(current.env_id, base.env_id);
}

#[tokio::test]
async fn test_set_environment_without_manager_fails_and_get_is_none() {
    let h = harness(EnvsSettings::default());
    let result = h.api.set_environment(Some(Path::new("/work/x")), None).await;
    assert!(matches!(result, Err(EnvError::ManagerNotFound { .. })));
    assert!(h.api.get_environment(None).await.is_none());
}

// =============================================================================
// Resolution
// =============================================================================

#[tokio::test]
async fn test_resolve_without_exec_info_returns_none_and_notifies() {
    let h = harness(EnvsSettings::default());
    let conda = MockEnvManager::new("conda");
    *conda.resolve_result.lock().unwrap() = Some(environment("conda", "partial", false));
    let _c = h.api.register_environment_manager(conda).unwrap();

    let resolved = h.api.resolve_environment(Path::new("/work/app")).await;
    assert!(resolved.is_none());
    assert_eq!(
        h.notifier.errors.lock().unwrap().as_slice(),
        &[INCOMPLETE_RESOLUTION_MESSAGE.to_string()]
    );
}

#[tokio::test]
async fn test_resolve_complete_environment() {
    let h = harness(EnvsSettings::default());
    let conda = MockEnvManager::new("conda");
    let full = environment("conda", "full", true);
    *conda.resolve_result.lock().unwrap() = Some(full.clone());
    let _c = h.api.register_environment_manager(conda).unwrap();

    let resolved = h.api.resolve_environment(Path::new("/work/app")).await.unwrap();
    assert_eq!(resolved.env_id, full.env_id);
    assert!(h.notifier.errors.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_resolve_without_manager_is_none() {
    let h = harness(EnvsSettings::default());
    assert!(h.api.resolve_environment(Path::new("/work/app")).await.is_none());
    assert!(h.notifier.errors.lock().unwrap().is_empty());
}

// =============================================================================
// Item construction
// =============================================================================

#[tokio::test]
async fn test_create_item_requires_registered_manager() {
    let h = harness(EnvsSettings::default());
    let conda = MockEnvManager::new("conda");
    let info = environment("conda", "x", true).info.clone();

    let result = h.api.create_python_environment_item(info.clone(), conda.as_ref());
    assert!(matches!(result, Err(EnvError::UnregisteredManager { .. })));

    let _c = h.api.register_environment_manager(conda.clone()).unwrap();
    // A different instance with the same identity counts as registered.
    let twin = MockEnvManager::new("conda");
    let item = h
        .api
        .create_python_environment_item(info, twin.as_ref())
        .unwrap();
    assert_eq!(item.manager_id(), "conda");
    assert!(item.env_id.id.starts_with("x-"));
}

// =============================================================================
// Packages
// =============================================================================

#[tokio::test]
async fn test_package_operations_without_manager() {
    let h = harness(EnvsSettings::default());
    let conda = MockEnvManager::with_envs("conda", &["base"]);
    let _c = h.api.register_environment_manager(conda.clone()).unwrap();
    let base = conda.envs.lock().unwrap()[0].clone();

    let result = h.api.install_packages(&base, &["numpy".to_string()]).await;
    assert!(matches!(result, Err(EnvError::PackageManagerNotFound { .. })));
    let result = h.api.refresh_packages(&base).await;
    assert!(matches!(result, Err(EnvError::PackageManagerNotFound { .. })));
    assert!(h.api.get_packages(&base).await.is_none());
}

#[tokio::test]
async fn test_package_operations_route_to_preferred_manager() {
    let h = harness(EnvsSettings::default());
    let conda = MockEnvManager::with_envs("conda", &["base"]);
    let pip = MockPackageManager::new("mock-pip");
    let _c = h.api.register_environment_manager(conda.clone()).unwrap();
    let _p = h.api.register_package_manager(pip.clone()).unwrap();
    let base = conda.envs.lock().unwrap()[0].clone();

    h.api
        .install_packages(&base, &["numpy".to_string(), "pandas".to_string()])
        .await
        .unwrap();
    let packages = h.api.get_packages(&base).await.unwrap();
    let names = packages.iter().map(|p| p.info.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["numpy", "pandas"]);

    let unsupported = h.api.uninstall_packages(&base, &["numpy".to_string()]).await;
    assert!(matches!(unsupported, Err(EnvError::Backend(_))));
}

#[tokio::test]
async fn test_create_package_item_requires_registered_manager() {
    let h = harness(EnvsSettings::default());
    let pip = MockPackageManager::new("mock-pip");
    let env = environment("conda", "base", true);

    let result = h
        .api
        .create_package_item(PackageInfo::new("numpy", None), &env, pip.as_ref());
    assert!(matches!(result, Err(EnvError::UnregisteredManager { .. })));

    let _p = h.api.register_package_manager(pip.clone()).unwrap();
    let item = h
        .api
        .create_package_item(PackageInfo::new("numpy", Some("1.26".into())), &env, pip.as_ref())
        .unwrap();
    assert_eq!(item.pkg_id.environment_id, env.env_id.id);
    assert!(item.pkg_id.id.starts_with("numpy-"));
}

// =============================================================================
// Events
// =============================================================================

#[tokio::test]
async fn test_environment_list_events_are_forwarded() {
    let h = harness(EnvsSettings::default());
    let mut rx = h.api.on_did_change_environments();
    let venv = MockEnvManager::new("venv");
    let _v = h.api.register_environment_manager(venv.clone()).unwrap();

    let env = environment("venv", ".venv", true);
    venv.environments_changed
        .emit(pyenvs_api::DidChangeEnvironmentsEvent::added(env.clone()));

    let event = timeout(EVENT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.changes.len(), 1);
    assert_eq!(event.changes[0].kind, ChangeKind::Add);
    assert_eq!(event.changes[0].environment.env_id, env.env_id);
}

#[tokio::test]
async fn test_current_environment_events_only_from_active_manager() {
    let h = harness(settings_with_venv_project());
    let mut rx = h.api.on_did_change_environment();
    let conda = MockEnvManager::with_envs("conda", &["base"]);
    let venv = MockEnvManager::with_envs("venv", &[".venv"]);
    let _c = h.api.register_environment_manager(conda.clone()).unwrap();
    let _v = h.api.register_environment_manager(venv.clone()).unwrap();

    // venv is not the manager for the global scope: dropped.
    let dot_venv = venv.envs.lock().unwrap()[0].clone();
    venv.set(None, Some(dot_venv.as_ref())).await.unwrap();
    assert!(timeout(NO_EVENT, rx.recv()).await.is_err());

    // venv owns /work/venv-app: forwarded.
    venv.set(Some(Path::new("/work/venv-app")), Some(dot_venv.as_ref()))
        .await
        .unwrap();
    let event = timeout(EVENT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.uri.as_deref(), Some(Path::new("/work/venv-app")));

    // conda owns the global scope: forwarded.
    let base = conda.envs.lock().unwrap()[0].clone();
    conda.set(None, Some(base.as_ref())).await.unwrap();
    let event = timeout(EVENT, rx.recv()).await.unwrap().unwrap();
    assert!(event.uri.is_none());
    assert_eq!(event.new.unwrap().env_id, base.env_id);
}

#[tokio::test]
async fn test_disposed_manager_stops_forwarding() {
    let h = harness(EnvsSettings::default());
    let mut rx = h.api.on_did_change_environments();
    let conda = MockEnvManager::new("conda");
    let registration = h.api.register_environment_manager(conda.clone()).unwrap();
    registration.dispose();

    conda
        .environments_changed
        .emit(pyenvs_api::DidChangeEnvironmentsEvent::added(environment(
            "conda", "late", true,
        )));
    assert!(timeout(NO_EVENT, rx.recv()).await.is_err());
    assert!(h.api.get_environments(&GetEnvironmentsScope::All).await.is_empty());
}

#[tokio::test]
async fn test_package_events_are_forwarded() {
    let h = harness(EnvsSettings::default());
    let mut rx = h.api.on_did_change_packages();
    let pip = MockPackageManager::new("mock-pip");
    let _p = h.api.register_package_manager(pip.clone()).unwrap();

    let env = environment("conda", "base", true);
    pip.packages_changed.emit(pyenvs_api::DidChangePackagesEvent {
        environment: env.clone(),
        manager_id: "mock-pip".to_string(),
        changes: Vec::new(),
    });
    let event = timeout(EVENT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.manager_id, "mock-pip");
    assert_eq!(event.environment.env_id, env.env_id);
}

// =============================================================================
// Projects
// =============================================================================

#[tokio::test]
async fn test_project_operations_delegate() {
    let h = harness(EnvsSettings::default());
    let mut rx = h.api.on_did_change_projects();

    let project = Project::from_path("/work/demo");
    h.api.add_projects(vec![project.clone()]);
    let event = timeout(EVENT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.added, vec![project.clone()]);

    assert_eq!(
        h.api.get_project(Path::new("/work/demo/src/app.py")),
        Some(project.clone())
    );
    assert_eq!(h.api.get_projects(None), vec![project.clone()]);

    assert!(h.api.remove_project(&project));
    assert!(h.api.get_projects(None).is_empty());
}
