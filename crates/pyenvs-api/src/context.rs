//! Application context: built once at startup and passed by reference.
//!
//! Components that need the API before it exists await
//! [`EnvContext::api`], which resolves as soon as [`EnvContext::initialize`]
//! runs.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::watch;

use crate::api::PythonEnvironmentApi;

pub struct EnvContext {
    api: watch::Sender<Option<Arc<PythonEnvironmentApi>>>,
}

impl Default for EnvContext {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvContext {
    pub fn new() -> Self {
        let (api, _) = watch::channel(None);
        Self { api }
    }

    /// Publish the API. A second call is rejected.
    pub fn initialize(&self, api: Arc<PythonEnvironmentApi>) -> Result<()> {
        let mut installed = false;
        self.api.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(api);
            installed = true;
            true
        });
        if installed {
            Ok(())
        } else {
            Err(anyhow!("Environment API is already initialized"))
        }
    }

    /// The API if it has been published.
    pub fn try_api(&self) -> Option<Arc<PythonEnvironmentApi>> {
        (*self.api.borrow()).clone()
    }

    /// Wait until the API is published.
    pub async fn api(&self) -> Arc<PythonEnvironmentApi> {
        let mut rx = self.api.subscribe();
        loop {
            if let Some(api) = (*rx.borrow_and_update()).clone() {
                return api;
            }
            // The sender lives in `self`, so the channel cannot close while
            // we are borrowed.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
