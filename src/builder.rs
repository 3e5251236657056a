//! Fluent builder for the process-wide dispatch runtime.
//!
//! The runtime (worker pool, timer thread, reactor thread, main queue thread)
//! is started lazily. A builder lets an application pick its settings before
//! that happens.

use crate::config::{self, DispatchConfig, GraphState};
use crate::error::Result;

use std::time::Duration;

/// Builder for the global runtime configuration.
///
/// Starts from [`DispatchConfig::from_env`], so environment overrides still
/// apply to every setting the builder does not touch.
///
/// # Example
/// ```ignore
/// DispatchBuilder::new()
///     .max_threads(32)
///     .queue_graph(GraphState::WithLabels)
///     .check_cycles_on_sync(true)
///     .install()?;
/// ```
pub struct DispatchBuilder {
    config: DispatchConfig,
}

impl Default for DispatchBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchBuilder {
    /// Creates a builder seeded from the environment.
    pub fn new() -> Self {
        Self {
            config: DispatchConfig::from_env(),
        }
    }

    /// Sets the number of workers kept alive while idle.
    pub fn min_threads(mut self, n: usize) -> Self {
        self.config.min_threads = n.max(1);
        self
    }

    /// Sets the upper bound for workers spawned on demand.
    pub fn max_threads(mut self, n: usize) -> Self {
        self.config.max_threads = n.max(1);
        self
    }

    /// Sets how long surplus workers idle before exiting.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Selects the initial queue graph state.
    pub fn queue_graph(mut self, state: GraphState) -> Self {
        self.config.queue_graph = state;
        self
    }

    /// Checks the dependency graph for cycles whenever a synchronous
    /// dispatch or wait starts.
    pub fn check_cycles_on_sync(mut self, enabled: bool) -> Self {
        self.config.check_cycles_on_sync = enabled;
        self
    }

    /// Enables or disables panicking programmer-error assertions.
    pub fn assertions(mut self, enabled: bool) -> Self {
        self.config.assertions = enabled;
        self
    }

    /// Returns the configuration built so far.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Installs the configuration for the process.
    ///
    /// # Errors
    /// Returns [`DispatchError::AlreadyConfigured`](crate::DispatchError::AlreadyConfigured)
    /// if the runtime has already resolved its configuration.
    pub fn install(mut self) -> Result<()> {
        self.config.max_threads = self.config.max_threads.max(self.config.min_threads);
        config::install(self.config)
    }
}
