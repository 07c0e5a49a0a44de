//! SUT adapters
//!
//! An adapter is the worker's client for the system under test. The worker builds
//! exactly one when the master sends `init` and uses it for every round after
//! that.
//!
//! Adapters are looked up by SUT name in an [`AdapterRegistry`]. The registry
//! ships with `mock`; real SUT clients register their own factory at startup.

pub mod mock;

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Client for one system under test
#[async_trait]
pub trait SutAdapter: Send + Sync {
    /// SUT name this adapter talks to
    fn sut(&self) -> &str;

    /// Get ready for `round` (install contracts, open accounts, warm caches)
    async fn prepare_round(&self, round: usize, settings: &Value) -> Result<()>;

    /// Execute `round` and return its result
    async fn run_round(&self, round: usize, settings: &Value) -> Result<Value>;
}

/// Builds adapters for one SUT
pub trait AdapterFactory: Send + Sync {
    fn create(
        &self,
        network_config_path: &Path,
        workspace_path: &Path,
        worker_id: &str,
    ) -> Result<Arc<dyn SutAdapter>>;
}

impl<F> AdapterFactory for F
where
    F: Fn(&Path, &Path, &str) -> Result<Arc<dyn SutAdapter>> + Send + Sync,
{
    fn create(
        &self,
        network_config_path: &Path,
        workspace_path: &Path,
        worker_id: &str,
    ) -> Result<Arc<dyn SutAdapter>> {
        self(network_config_path, workspace_path, worker_id)
    }
}

/// Adapter factories by SUT name
#[derive(Clone)]
pub struct AdapterRegistry {
    factories: HashMap<String, Arc<dyn AdapterFactory>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding the `mock` adapter
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry
            .factories
            .insert(mock::SUT_NAME.to_string(), Arc::new(mock::MockFactory::default()));
        registry
    }

    pub fn register(&mut self, sut: impl Into<String>, factory: Arc<dyn AdapterFactory>) -> Result<()> {
        let sut = sut.into();
        if self.factories.contains_key(&sut) {
            anyhow::bail!("An adapter factory for SUT '{}' is already registered", sut);
        }
        self.factories.insert(sut, factory);
        Ok(())
    }

    pub fn get(&self, sut: &str) -> Result<Arc<dyn AdapterFactory>> {
        match self.factories.get(sut) {
            Some(factory) => Ok(factory.clone()),
            None => anyhow::bail!(
                "Unknown SUT '{}' (available: {})",
                sut,
                self.names().join(", ")
            ),
        }
    }

    pub fn contains(&self, sut: &str) -> bool {
        self.factories.contains_key(sut)
    }

    /// Registered SUT names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
