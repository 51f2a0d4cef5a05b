//! Shared dependencies of the orchestrator components

use std::sync::Arc;

use stride_common::config::{ConfigSource, OrchestratorConfig, StaticConfigSource};
use stride_common::Result;
use stride_store::StoreManager;

use crate::configurator::NodeConfigurator;
use crate::execution::ExecutionService;
use crate::health::{HealthReporter, TracingHealthReporter};
use crate::package::PackageStore;

/// Everything the orchestrator talks to
///
/// External services are held as trait objects so tests can substitute
/// mocks or scripted fakes.
pub struct Context {
    /// Typed access to the persisted records
    pub store: StoreManager,
    /// Cluster execution service
    pub execution: Arc<dyn ExecutionService>,
    /// Code package source
    pub packages: Arc<dyn PackageStore>,
    /// Health sink
    pub health: Arc<dyn HealthReporter>,
    /// Machine setup for node addition; None disables node addition
    pub configurator: Option<Arc<dyn NodeConfigurator>>,
    /// Configuration, re-read every cycle
    pub config: Arc<dyn ConfigSource>,
}

impl Context {
    /// Create a builder for a context
    pub fn builder(
        store: StoreManager,
        execution: Arc<dyn ExecutionService>,
        packages: Arc<dyn PackageStore>,
    ) -> ContextBuilder {
        ContextBuilder::new(store, execution, packages)
    }

    /// Load and validate the current configuration
    pub fn load_config(&self) -> Result<OrchestratorConfig> {
        let config = self.config.load()?;
        config.validate()?;
        Ok(config)
    }

    /// Create a context for testing with mock services and defaults elsewhere
    #[cfg(test)]
    pub fn for_testing(
        store: StoreManager,
        execution: Arc<dyn ExecutionService>,
        packages: Arc<dyn PackageStore>,
        health: Arc<dyn HealthReporter>,
    ) -> Self {
        Self {
            store,
            execution,
            packages,
            health,
            configurator: None,
            config: Arc::new(StaticConfigSource::default()),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    store: StoreManager,
    execution: Arc<dyn ExecutionService>,
    packages: Arc<dyn PackageStore>,
    health: Option<Arc<dyn HealthReporter>>,
    configurator: Option<Arc<dyn NodeConfigurator>>,
    config: Option<Arc<dyn ConfigSource>>,
}

impl ContextBuilder {
    /// Create a new builder with the required services
    pub fn new(
        store: StoreManager,
        execution: Arc<dyn ExecutionService>,
        packages: Arc<dyn PackageStore>,
    ) -> Self {
        Self {
            store,
            execution,
            packages,
            health: None,
            configurator: None,
            config: None,
        }
    }

    /// Override the health sink (defaults to logging)
    pub fn health(mut self, health: Arc<dyn HealthReporter>) -> Self {
        self.health = Some(health);
        self
    }

    /// Enable node addition through `configurator`
    pub fn configurator(mut self, configurator: Arc<dyn NodeConfigurator>) -> Self {
        self.configurator = Some(configurator);
        self
    }

    /// Override the configuration source (defaults to built-in defaults)
    pub fn config_source(mut self, config: Arc<dyn ConfigSource>) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the context
    pub fn build(self) -> Context {
        Context {
            store: self.store,
            execution: self.execution,
            packages: self.packages,
            health: self
                .health
                .unwrap_or_else(|| Arc::new(TracingHealthReporter)),
            configurator: self.configurator,
            config: self
                .config
                .unwrap_or_else(|| Arc::new(StaticConfigSource::default())),
        }
    }
}
