//! Change notifications.
//!
//! Every stream is a [`tokio::sync::broadcast`] channel. Emitting never
//! blocks; with no subscribers the event is dropped. Each call to
//! [`EventChannel::subscribe`] is one subscription and dropping the returned
//! receiver cancels exactly that subscription.

use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{Package, Project, PythonEnvironment};

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Remove,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentChange {
    pub kind: ChangeKind,
    pub environment: Arc<PythonEnvironment>,
}

/// Batch of additions/removals to a manager's environment list.
#[derive(Debug, Clone, Serialize)]
pub struct DidChangeEnvironmentsEvent {
    pub changes: Vec<EnvironmentChange>,
}

impl DidChangeEnvironmentsEvent {
    pub fn added(environment: Arc<PythonEnvironment>) -> Self {
        Self {
            changes: vec![EnvironmentChange {
                kind: ChangeKind::Add,
                environment,
            }],
        }
    }

    pub fn removed(environment: Arc<PythonEnvironment>) -> Self {
        Self {
            changes: vec![EnvironmentChange {
                kind: ChangeKind::Remove,
                environment,
            }],
        }
    }
}

/// The environment selected for a scope changed. `uri == None` is the
/// global scope.
#[derive(Debug, Clone, Serialize)]
pub struct DidChangeEnvironmentEvent {
    pub uri: Option<PathBuf>,
    pub old: Option<Arc<PythonEnvironment>>,
    pub new: Option<Arc<PythonEnvironment>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageChange {
    pub kind: ChangeKind,
    pub package: Arc<Package>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DidChangePackagesEvent {
    pub environment: Arc<PythonEnvironment>,
    pub manager_id: String,
    pub changes: Vec<PackageChange>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DidChangeProjectsEvent {
    pub added: Vec<Project>,
    pub removed: Vec<Project>,
}

/// A single broadcast stream of `T`.
#[derive(Debug, Clone)]
pub struct EventChannel<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone> EventChannel<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: T) {
        if self.sender.send(event).is_err() {
            debug!("[envs] Dropped event with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Clone> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
