//! Static registry mapping module names to adapter constructors

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::{EchoIntegration, Integration, IntegrationError};

/// Prefix accepted in front of built-in module names
const BUILTIN_PREFIX: &str = "homeline/integrations/";

/// One configured integration instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationDescriptor {
    pub id: String,
    pub module: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

pub type Factory =
    Box<dyn Fn(&IntegrationDescriptor) -> Result<Arc<dyn Integration>, IntegrationError> + Send + Sync>;

/// Adapter constructors known at compile time, keyed by module name
#[derive(Default)]
pub struct Registry {
    factories: HashMap<String, Factory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every adapter shipped in this crate
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(EchoIntegration::NAME, |descriptor| {
            let adapter = EchoIntegration::from_descriptor(descriptor)?;
            Ok(Arc::new(adapter) as Arc<dyn Integration>)
        });
        registry
    }

    pub fn register<F>(&mut self, module: &str, factory: F) -> &mut Self
    where
        F: Fn(&IntegrationDescriptor) -> Result<Arc<dyn Integration>, IntegrationError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(module.to_string(), Box::new(factory));
        self
    }

    pub fn contains(&self, module: &str) -> bool {
        self.factories.contains_key(Self::resolve(module))
    }

    /// Strips the built-in prefix: `homeline/integrations/echo` → `echo`
    pub fn resolve(module: &str) -> &str {
        module.strip_prefix(BUILTIN_PREFIX).unwrap_or(module)
    }

    pub fn build(&self, descriptor: &IntegrationDescriptor) -> Result<Arc<dyn Integration>, IntegrationError> {
        let module = Self::resolve(&descriptor.module);
        let factory = self
            .factories
            .get(module)
            .ok_or_else(|| IntegrationError::UnknownModule(descriptor.module.clone()))?;
        info!("Registering integration {} ({})", descriptor.id, module);
        factory(descriptor)
    }
}
