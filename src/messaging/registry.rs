//! Transport type resolution
//!
//! Maps a transport type identifier to a factory. Resolution order:
//!
//! 1. Built-in identifiers (`process-master`, `process-worker`, `tcp-master`, `tcp-worker`)
//! 2. Plugin modules registered by path, which must export a `create_messenger` factory
//!
//! Plugins are compiled into the binary and registered at startup; there is no
//! runtime library loading. A module registered without a factory models a
//! plugin that forgot its entry point and fails construction with a
//! configuration error.

use super::messenger::MessengerConfig;
use super::process::ProcessTransport;
use super::tcp::TcpTransport;
use super::transport::{Role, Transport};
use crate::error::{MessagingError, MessagingResult};
use std::collections::HashMap;
use std::sync::Arc;

/// Plugin factory: builds a transport from the full messenger configuration
pub type TransportFactory =
    Arc<dyn Fn(&MessengerConfig) -> MessagingResult<Box<dyn Transport>> + Send + Sync>;

/// Name of the entry point a plugin module must export
pub const FACTORY_ENTRY_POINT: &str = "create_messenger";

/// A compiled-in transport plugin module
#[derive(Clone)]
pub struct PluginModule {
    path: String,
    create_messenger: Option<TransportFactory>,
}

impl PluginModule {
    /// Module without an entry point
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: normalize_module_path(&path.into()).to_string(),
            create_messenger: None,
        }
    }

    /// Attach the `create_messenger` entry point
    pub fn with_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&MessengerConfig) -> MessagingResult<Box<dyn Transport>> + Send + Sync + 'static,
    {
        self.create_messenger = Some(Arc::new(factory));
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn exports_factory(&self) -> bool {
        self.create_messenger.is_some()
    }
}

/// Registry of built-in transports and plugin modules
#[derive(Clone)]
pub struct TransportRegistry {
    builtins: HashMap<String, TransportFactory>,
    modules: HashMap<String, PluginModule>,
}

impl TransportRegistry {
    /// Registry without any transports
    pub fn empty() -> Self {
        Self {
            builtins: HashMap::new(),
            modules: HashMap::new(),
        }
    }

    /// Registry holding the built-in transports
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        for role in [Role::Master, Role::Worker] {
            registry.builtins.insert(
                role.qualify("process"),
                Arc::new(
                    move |config: &MessengerConfig| -> MessagingResult<Box<dyn Transport>> {
                        Ok(Box::new(ProcessTransport::new(role, config)))
                    },
                ),
            );
            registry.builtins.insert(
                role.qualify("tcp"),
                Arc::new(
                    move |config: &MessengerConfig| -> MessagingResult<Box<dyn Transport>> {
                        Ok(Box::new(TcpTransport::new(role, config)?))
                    },
                ),
            );
        }
        registry
    }

    /// Register a plugin module under its path
    ///
    /// Paths must be unique and may not shadow a built-in identifier.
    pub fn register_module(&mut self, module: PluginModule) -> MessagingResult<()> {
        if self.builtins.contains_key(module.path()) {
            return Err(MessagingError::Configuration(format!(
                "plugin module '{}' shadows a built-in transport",
                module.path()
            )));
        }
        if self.modules.contains_key(module.path()) {
            return Err(MessagingError::Configuration(format!(
                "plugin module '{}' is already registered",
                module.path()
            )));
        }
        self.modules.insert(module.path().to_string(), module);
        Ok(())
    }

    pub fn is_builtin(&self, type_id: &str) -> bool {
        self.builtins.contains_key(type_id)
    }

    /// Identifiers of the built-in transports, sorted
    pub fn builtin_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.builtins.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Resolve a transport type identifier to its factory
    pub fn resolve(&self, type_id: &str) -> MessagingResult<TransportFactory> {
        if let Some(factory) = self.builtins.get(type_id) {
            return Ok(factory.clone());
        }

        let module = self
            .modules
            .get(normalize_module_path(type_id))
            .ok_or_else(|| {
                MessagingError::Configuration(format!("unknown transport type '{}'", type_id))
            })?;

        module.create_messenger.clone().ok_or_else(|| {
            MessagingError::Configuration(format!(
                "{} does not export the mandatory factory function '{}'",
                type_id, FACTORY_ENTRY_POINT
            ))
        })
    }

    /// Resolve and invoke the factory for `config.transport_type`
    pub fn create(&self, config: &MessengerConfig) -> MessagingResult<Box<dyn Transport>> {
        let factory = self.resolve(&config.transport_type)?;
        factory(config)
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn normalize_module_path(path: &str) -> &str {
    let trimmed = path.trim();
    trimmed.strip_prefix("./").unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::envelope::Envelope;
    use crate::messaging::transport::Dispatch;
    use async_trait::async_trait;

    struct NullTransport {
        identity: String,
    }

    #[async_trait]
    impl Transport for NullTransport {
        async fn initialize(&self) -> MessagingResult<()> {
            Ok(())
        }

        async fn configure(&self, _dispatcher: Arc<dyn Dispatch>) -> MessagingResult<()> {
            Ok(())
        }

        fn send(&self, _envelope: Envelope) -> MessagingResult<()> {
            Ok(())
        }

        fn identity(&self) -> &str {
            &self.identity
        }
    }

    fn null_module(path: &str) -> PluginModule {
        PluginModule::new(path).with_factory(|config: &MessengerConfig| {
            Ok(Box::new(NullTransport {
                identity: config.identity.clone().unwrap_or_else(|| "null".to_string()),
            }) as Box<dyn Transport>)
        })
    }

    #[test]
    fn test_builtins_registered() {
        let registry = TransportRegistry::with_builtins();
        assert_eq!(
            registry.builtin_types(),
            vec!["process-master", "process-worker", "tcp-master", "tcp-worker"]
        );
        for type_id in registry.builtin_types() {
            assert!(registry.resolve(type_id).is_ok(), "{} should resolve", type_id);
        }
    }

    #[test]
    fn test_unknown_type_is_configuration_error() {
        let registry = TransportRegistry::with_builtins();
        match registry.resolve("no-such-transport") {
            Err(MessagingError::Configuration(msg)) => {
                assert!(msg.contains("no-such-transport"));
            }
            Err(other) => panic!("Wrong error: {}", other),
            Ok(_) => panic!("Unknown type resolved"),
        }
    }

    #[test]
    fn test_module_without_factory_is_configuration_error() {
        let mut registry = TransportRegistry::with_builtins();
        registry
            .register_module(PluginModule::new("./plugins/broken"))
            .unwrap();

        match registry.resolve("./plugins/broken") {
            Err(MessagingError::Configuration(msg)) => {
                assert!(msg.contains("create_messenger"), "unclear message: {}", msg);
            }
            Err(other) => panic!("Wrong error: {}", other),
            Ok(_) => panic!("Module without factory resolved"),
        }
    }

    #[test]
    fn test_module_with_factory_resolves_by_path() {
        let mut registry = TransportRegistry::with_builtins();
        registry.register_module(null_module("plugins/null")).unwrap();

        // Leading "./" is ignored
        let config = MessengerConfig::new("./plugins/null").with_identity("n1");
        let transport = registry.create(&config).unwrap();
        assert_eq!(transport.identity(), "n1");
    }

    #[test]
    fn test_duplicate_and_shadowing_modules_rejected() {
        let mut registry = TransportRegistry::with_builtins();
        registry.register_module(null_module("plugins/null")).unwrap();

        assert!(matches!(
            registry.register_module(null_module("./plugins/null")),
            Err(MessagingError::Configuration(_))
        ));
        assert!(matches!(
            registry.register_module(null_module("tcp-worker")),
            Err(MessagingError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_registry_has_no_builtins() {
        let registry = TransportRegistry::empty();
        assert!(!registry.is_builtin("process-worker"));
        assert!(registry.resolve("process-worker").is_err());
    }
}
