//! pyenvs CLI entry point.
//!
//! Wires the conda backend into the environment API and exposes the API's
//! operations as subcommands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use pyenvs_api::settings::{load_settings_from, save_settings_to, settings_path, state_path};
use pyenvs_api::{
    CreateScope, EnvContext, GetEnvironmentsScope, LogNotifier, ManagerRegistration,
    ManagerRegistry, PersistentState, Project, ProjectRegistry, PythonEnvironment,
    PythonEnvironmentApi,
};
use pyenvs_conda::{CondaCli, CondaEnvManager, CondaPackageManager};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "pyenvs")]
#[command(about = "Manage Python environments, packages and projects")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Settings file (default: <config dir>/pyenvs/settings.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List environments
    List {
        /// `all`, `global`, or a path
        #[arg(long, default_value = "all")]
        scope: String,
    },

    /// Show the environment selected for a path (global when omitted)
    Get { path: Option<PathBuf> },

    /// Select an environment for a path, or clear the selection
    Set {
        /// Path to select for (global when omitted)
        #[arg(long)]
        scope: Option<PathBuf>,

        /// Environment prefix or interpreter; clears the selection when omitted
        environment: Option<PathBuf>,
    },

    /// Resolve a prefix or interpreter into an environment
    Resolve { path: PathBuf },

    /// Rescan every environment manager
    Refresh,

    /// Create an environment, inside the project at `path` if given
    Create { path: Option<PathBuf> },

    /// Delete an environment
    Remove { environment: PathBuf },

    /// List packages installed in an environment
    Packages {
        environment: PathBuf,

        /// Re-read the package records first
        #[arg(long)]
        refresh: bool,
    },

    /// Manage projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Print the JSON schema of the settings file
    Schema,
}

#[derive(Subcommand, Debug)]
enum ProjectCommands {
    /// Register a project
    Add {
        path: PathBuf,

        /// Environment manager for this project
        #[arg(long)]
        env_manager: Option<String>,

        /// Package manager for this project
        #[arg(long)]
        package_manager: Option<String>,
    },

    /// Forget a project
    Remove { path: PathBuf },

    /// List projects
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let settings_file = cli.settings.clone().unwrap_or_else(settings_path);
    if let Commands::Schema = cli.command {
        println!(
            "{}",
            serde_json::to_string_pretty(&pyenvs_api::settings::settings_schema())?
        );
        return Ok(());
    }

    let context = EnvContext::new();
    let _registrations = start(&context, &settings_file).await?;
    let api = context.api().await;

    match cli.command {
        Commands::List { scope } => {
            let scope = match scope.as_str() {
                "all" => GetEnvironmentsScope::All,
                "global" => GetEnvironmentsScope::Global,
                path => GetEnvironmentsScope::Uri(absolute(Path::new(path))?),
            };
            let envs = api.get_environments(&scope).await;
            print_environments(&envs, cli.json)
        }
        Commands::Get { path } => {
            let path = path.as_deref().map(absolute).transpose()?;
            let env = api.get_environment(path.as_deref()).await;
            print_environment(env.as_deref(), cli.json)
        }
        Commands::Set { scope, environment } => {
            let scope = scope.as_deref().map(absolute).transpose()?;
            let env = match environment {
                Some(path) => Some(find_environment(&api, &path).await?),
                None => None,
            };
            api.set_environment(scope.as_deref(), env.as_deref()).await?;
            match env {
                Some(env) => println!("Selected {}", env.info.display_name),
                None => println!("Selection cleared"),
            }
            Ok(())
        }
        Commands::Resolve { path } => {
            let env = api.resolve_environment(&absolute(&path)?).await;
            print_environment(env.as_deref(), cli.json)
        }
        Commands::Refresh => {
            api.refresh_environments(None).await?;
            let envs = api.get_environments(&GetEnvironmentsScope::All).await;
            println!("Found {} environments", envs.len());
            Ok(())
        }
        Commands::Create { path } => {
            let scope = match path {
                Some(path) => CreateScope::Uris(vec![absolute(&path)?]),
                None => CreateScope::Global,
            };
            match api.create_environment(&scope).await? {
                Some(env) => print_environment(Some(env.as_ref()), cli.json),
                None => Err(anyhow!("Environment creation failed; see the log for details")),
            }
        }
        Commands::Remove { environment } => {
            let env = find_environment(&api, &environment).await?;
            api.remove_environment(&env).await?;
            println!("Removed {}", env.info.display_name);
            Ok(())
        }
        Commands::Packages {
            environment,
            refresh,
        } => {
            let env = find_environment(&api, &environment).await?;
            if refresh {
                api.refresh_packages(&env).await?;
            }
            let packages = api
                .get_packages(&env)
                .await
                .ok_or_else(|| anyhow!("Could not list packages of {}", env.name()))?;
            if cli.json {
                return print_json(&packages);
            }
            for package in packages {
                println!(
                    "{:<32} {}",
                    package.info.name,
                    package.info.version.as_deref().unwrap_or("")
                );
            }
            Ok(())
        }
        Commands::Project { command } => project(&api, &settings_file, command, cli.json),
        Commands::Schema => Ok(()),
    }
}

/// Build the API, register the conda backend and publish the API.
async fn start(context: &EnvContext, settings_file: &Path) -> Result<Vec<ManagerRegistration>> {
    let settings = load_settings_from(settings_file);
    info!("Settings: {:?}", settings_file);

    let state = Arc::new(PersistentState::open(state_path()).await?);
    let projects = Arc::new(ProjectRegistry::from_settings(&settings));
    let managers = Arc::new(ManagerRegistry::new(settings, projects.clone()));
    let api = Arc::new(PythonEnvironmentApi::new(managers, Arc::new(LogNotifier)));

    let conda = CondaCli::from_env();
    info!("Conda: {:?}", conda.executable());
    let registrations = vec![
        api.register_environment_manager(Arc::new(CondaEnvManager::new(
            Arc::new(conda),
            state,
            projects,
        )))?,
        api.register_package_manager(Arc::new(CondaPackageManager::new()))?,
    ];

    context.initialize(api)?;
    Ok(registrations)
}

fn project(
    api: &PythonEnvironmentApi,
    settings_file: &Path,
    command: ProjectCommands,
    json: bool,
) -> Result<()> {
    match command {
        ProjectCommands::Add {
            path,
            env_manager,
            package_manager,
        } => {
            let path = absolute(&path)?;
            let mut settings = load_settings_from(settings_file);
            let entry = settings.project_mut(&path);
            entry.env_manager = env_manager.clone();
            entry.package_manager = package_manager.clone();
            let project = entry.to_project();
            save_settings_to(settings_file, &settings)?;

            api.add_projects(vec![project.clone()]);
            api.managers().set_project_managers(
                &path,
                env_manager.as_deref(),
                package_manager.as_deref(),
            );
            println!("Added project {} at {}", project.name, project.uri.display());
            Ok(())
        }
        ProjectCommands::Remove { path } => {
            let path = absolute(&path)?;
            let mut settings = load_settings_from(settings_file);
            if !settings.remove_project(&path) {
                return Err(anyhow!("{} is not a project", path.display()));
            }
            save_settings_to(settings_file, &settings)?;
            api.remove_project(&Project::from_path(&path));
            println!("Removed project {}", path.display());
            Ok(())
        }
        ProjectCommands::List => {
            let projects = api.get_projects(None);
            if json {
                return print_json(&projects);
            }
            for project in projects {
                println!("{:<24} {}", project.name, project.uri.display());
            }
            Ok(())
        }
    }
}

/// The environment at `path` (prefix or interpreter).
async fn find_environment(api: &PythonEnvironmentApi, path: &Path) -> Result<Arc<PythonEnvironment>> {
    let path = absolute(path)?;
    api.resolve_environment(&path)
        .await
        .ok_or_else(|| anyhow!("No environment found at {}", path.display()))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read the current directory")?;
    Ok(pyenvs_api::model::normalize_path(&cwd.join(path)))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_environment(env: Option<&PythonEnvironment>, json: bool) -> Result<()> {
    if json {
        return print_json(&env);
    }
    match env {
        Some(env) => {
            println!("{}", env.info.display_name);
            println!("  Manager: {}", env.manager_id());
            println!("  Path:    {}", env.environment_path().display());
            println!("  Prefix:  {}", env.info.sys_prefix.display());
            if !env.info.version.is_empty() {
                println!("  Python:  {}", env.info.version);
            }
        }
        None => println!("No environment"),
    }
    Ok(())
}

fn print_environments(envs: &[Arc<PythonEnvironment>], json: bool) -> Result<()> {
    if json {
        return print_json(envs);
    }
    if envs.is_empty() {
        println!("No environments");
    }
    for env in envs {
        println!(
            "{:<32} {:<8} {}",
            env.info.display_name,
            env.manager_id(),
            env.info.display_path
        );
    }
    Ok(())
}
