//! Mock SUT adapter for testing
//!
//! Simulates a system under test without any network traffic, making worker and
//! master tests fast and deterministic.
//!
//! # Features
//!
//! - Records every `prepare_round` / `run_round` call
//! - Can be switched to fail on demand
//! - Factory can refuse to build adapters, to exercise `init` failures

use super::{AdapterFactory, SutAdapter};
use crate::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const SUT_NAME: &str = "mock";

/// Call made on a [`MockAdapter`]
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterCall {
    Prepare { round: usize },
    Run { round: usize },
}

/// Mock adapter
#[derive(Clone)]
pub struct MockAdapter {
    worker_id: String,
    network_config_path: PathBuf,
    workspace_path: PathBuf,
    calls: Arc<Mutex<Vec<AdapterCall>>>,
    should_fail: Arc<AtomicBool>,
}

impl MockAdapter {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            network_config_path: PathBuf::new(),
            workspace_path: PathBuf::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
            should_fail: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_paths(mut self, network_config_path: &Path, workspace_path: &Path) -> Self {
        self.network_config_path = network_config_path.to_path_buf();
        self.workspace_path = workspace_path.to_path_buf();
        self
    }

    /// Make subsequent calls fail
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    /// Calls made so far, in order
    pub fn calls(&self) -> Vec<AdapterCall> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn network_config_path(&self) -> &Path {
        &self.network_config_path
    }

    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    fn record(&self, call: AdapterCall) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(call.clone());

        if self.should_fail.load(Ordering::SeqCst) {
            anyhow::bail!("Mock adapter failure on {:?}", call);
        }
        Ok(())
    }
}

#[async_trait]
impl SutAdapter for MockAdapter {
    fn sut(&self) -> &str {
        SUT_NAME
    }

    async fn prepare_round(&self, round: usize, _settings: &Value) -> Result<()> {
        self.record(AdapterCall::Prepare { round })
    }

    async fn run_round(&self, round: usize, settings: &Value) -> Result<Value> {
        self.record(AdapterCall::Run { round })?;

        let submitted = settings.get("txNumber").and_then(Value::as_u64).unwrap_or(0);
        Ok(json!({
            "worker_id": self.worker_id,
            "round": round,
            "submitted": submitted,
            "succeeded": submitted,
            "failed": 0,
        }))
    }
}

/// Factory for [`MockAdapter`]
///
/// Keeps every adapter it built so tests can inspect them afterwards.
#[derive(Default)]
pub struct MockFactory {
    fail_create: AtomicBool,
    fail_rounds: AtomicBool,
    created: Mutex<Vec<MockAdapter>>,
}

impl MockFactory {
    /// Refuse to build adapters
    pub fn failing() -> Self {
        let factory = Self::default();
        factory.fail_create.store(true, Ordering::SeqCst);
        factory
    }

    /// Build adapters that fail every call
    pub fn with_failing_rounds() -> Self {
        let factory = Self::default();
        factory.fail_rounds.store(true, Ordering::SeqCst);
        factory
    }

    /// Adapters built so far
    pub fn created(&self) -> Vec<MockAdapter> {
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl AdapterFactory for MockFactory {
    fn create(
        &self,
        network_config_path: &Path,
        workspace_path: &Path,
        worker_id: &str,
    ) -> Result<Arc<dyn SutAdapter>> {
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("Mock factory refused to build an adapter for {}", worker_id);
        }

        let adapter = MockAdapter::new(worker_id).with_paths(network_config_path, workspace_path);
        adapter.set_should_fail(self.fail_rounds.load(Ordering::SeqCst));

        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(adapter.clone());

        Ok(Arc::new(adapter))
    }
}
