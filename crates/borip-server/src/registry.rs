//! Device registry: resolves a hint to a constructed, opened device.
//!
//! A hint goes through the [`HintParser`] to obtain a [`DeviceSpec`]; the
//! spec's module id selects a [`DeviceFactory`] registered under that key.
//! Keys are case-insensitive.
//!
//! # Example
//!
//! ```
//! use borip_server::{DeviceRegistry, sim};
//!
//! let mut registry = DeviceRegistry::new(28888);
//! sim::register(&mut registry);
//! assert!(registry.contains("rtl"));
//! assert_eq!(registry.parse("rtl").module_id, "RTL");
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use borip_core::error::{Error, Result};
use borip_core::hint::{DeviceSpec, HintMapper, HintParser};
use borip_core::transport::StreamDevice;

/// Environment handed to a factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryContext {
    /// Default UDP destination port for the device's transport.
    pub data_port: u16,
}

/// Constructs devices for one module id.
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    /// Build an unopened device from a parsed hint.
    async fn create(&self, spec: &DeviceSpec, ctx: &FactoryContext)
    -> Result<Arc<dyn StreamDevice>>;
}

/// Static module id to factory mapping.
pub struct DeviceRegistry {
    factories: HashMap<String, Arc<dyn DeviceFactory>>,
    parser: HintParser,
    ctx: FactoryContext,
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut modules: Vec<_> = self.factories.keys().collect();
        modules.sort();
        f.debug_struct("DeviceRegistry")
            .field("modules", &modules)
            .field("parser", &self.parser)
            .field("ctx", &self.ctx)
            .finish()
    }
}

impl DeviceRegistry {
    /// An empty registry whose devices default to `data_port`.
    pub fn new(data_port: u16) -> Self {
        Self {
            factories: HashMap::new(),
            parser: HintParser::new(),
            ctx: FactoryContext { data_port },
        }
    }

    pub fn register(&mut self, module_id: &str, factory: Arc<dyn DeviceFactory>) {
        let key = module_id.to_ascii_uppercase();
        tracing::debug!(module = %key, "Registering device module");
        self.factories.insert(key, factory);
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.factories.contains_key(&module_id.to_ascii_uppercase())
    }

    /// Registered module ids, sorted.
    pub fn modules(&self) -> Vec<String> {
        let mut modules: Vec<String> = self.factories.keys().cloned().collect();
        modules.sort();
        modules
    }

    pub fn set_hint_mapper(&mut self, mapper: Arc<dyn HintMapper>) {
        self.parser.set_mapper(mapper);
    }

    pub fn set_default_module(&mut self, module: Option<String>) {
        self.parser.set_default_module(module);
    }

    pub fn parser(&self) -> &HintParser {
        &self.parser
    }

    pub fn parse(&self, hint: &str) -> DeviceSpec {
        self.parser.parse(hint)
    }

    pub fn context(&self) -> &FactoryContext {
        &self.ctx
    }

    /// Parse `hint`, construct the device, and open it.
    ///
    /// A device that fails to open is closed before the error is returned.
    pub async fn create(&self, hint: &str) -> Result<Arc<dyn StreamDevice>> {
        let spec = self.parse(hint);
        let factory = self
            .factories
            .get(&spec.module_id)
            .ok_or_else(|| Error::Config(format!("No such module: {}", spec.module_id)))?;

        tracing::info!(module = %spec.module_id, hint = %spec, "Creating device");
        let device = factory.create(&spec, &self.ctx).await?;

        let failure = match device.open().await {
            Ok(true) => None,
            Ok(false) => Some(Error::Device(
                device
                    .last_error()
                    .unwrap_or_else(|| "Failed to open device".to_string()),
            )),
            Err(e) => Some(e),
        };
        if let Some(e) = failure {
            tracing::warn!(module = %spec.module_id, error = %e, "Device failed to open");
            if let Err(close_err) = device.close().await {
                tracing::debug!(error = %close_err, "Close after failed open also failed");
            }
            return Err(e);
        }

        tracing::info!(name = %device.name(), serial = %device.serial(), "Device opened");
        Ok(device)
    }
}
