use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::core::errors::{GantryError, Result};

/// Worker node configuration with all tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    // Compute slots
    /// Size of the implicit "threads" compute pool.
    pub thread_slots: u64,
    /// Additional named resource pools (e.g. "gpu" -> 2).
    pub extra_slots: HashMap<String, u64>,

    // Memory
    /// Memory budget reservable by executing tasks, in bytes.
    pub memory_budget_bytes: u64,

    // Outbound fetch budgets
    /// Maximum concurrent outbound fetch connections.
    pub fetch_connections: u64,
    /// Cap on fetch bytes in flight across all connections.
    pub flight_byte_cap: u64,
    /// Per-batch byte target when bundling keys for one peer.
    pub fetch_batch_bytes: u64,
    /// Per-batch key-count cap when bundling keys for one peer.
    pub fetch_batch_keys: usize,
    /// Size assumed for a key whose byte size is not yet known.
    pub assumed_key_bytes: u64,

    // Fetch failure policy (operational tuning, not load-bearing for
    // correctness)
    /// How long a failed peer stays blacklisted for the affected keys.
    pub fetch_blacklist_window: Duration,
    /// Attempts per key before the fetch is surfaced as exhausted.
    pub fetch_retry_cap: u32,

    // Introspection
    /// Stimulus log entries retained before trimming from the head.
    pub stimulus_log_retention: usize,
    /// Run the invariant validator after every stimulus; violations are
    /// fatal. Meant for tests and debug deployments.
    pub validate_after_each: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_slots: num_cpus::get() as u64,
            extra_slots: HashMap::new(),
            memory_budget_bytes: 4 * 1024 * 1024 * 1024, // 4GB
            fetch_connections: 50,
            flight_byte_cap: 256 * 1024 * 1024, // 256MB
            fetch_batch_bytes: 64 * 1024 * 1024, // 64MB
            fetch_batch_keys: 100,
            assumed_key_bytes: 1024 * 1024, // 1MB until a size is announced
            fetch_blacklist_window: Duration::from_secs(15),
            fetch_retry_cap: 3,
            stimulus_log_retention: 100_000,
            validate_after_each: false,
        }
    }
}

impl WorkerConfig {
    /// Create a new builder for WorkerConfig
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.thread_slots == 0 {
            return Err(GantryError::configuration_field(
                "must be greater than 0",
                "thread_slots",
            ));
        }
        if self.memory_budget_bytes == 0 {
            return Err(GantryError::configuration_field(
                "must be greater than 0",
                "memory_budget_bytes",
            ));
        }
        if self.fetch_connections == 0 {
            return Err(GantryError::configuration_field(
                "must be greater than 0",
                "fetch_connections",
            ));
        }
        if self.flight_byte_cap == 0 {
            return Err(GantryError::configuration_field(
                "must be greater than 0",
                "flight_byte_cap",
            ));
        }
        if self.fetch_batch_bytes > self.flight_byte_cap {
            return Err(GantryError::configuration_field(
                "cannot exceed flight_byte_cap",
                "fetch_batch_bytes",
            ));
        }
        if self.fetch_batch_keys == 0 {
            return Err(GantryError::configuration_field(
                "must be greater than 0",
                "fetch_batch_keys",
            ));
        }
        if self.assumed_key_bytes == 0 {
            return Err(GantryError::configuration_field(
                "must be greater than 0",
                "assumed_key_bytes",
            ));
        }
        if self.fetch_retry_cap == 0 {
            return Err(GantryError::configuration_field(
                "must be greater than 0",
                "fetch_retry_cap",
            ));
        }
        if self.stimulus_log_retention == 0 {
            return Err(GantryError::configuration_field(
                "must be greater than 0",
                "stimulus_log_retention",
            ));
        }
        if self.extra_slots.contains_key(super::limits::THREADS) {
            return Err(GantryError::configuration_field(
                "the threads pool is sized by thread_slots",
                "extra_slots",
            ));
        }
        Ok(())
    }

    /// Configuration for development and tests: tiny budgets so contention
    /// paths are exercised, validator on.
    pub fn development() -> Self {
        Self {
            thread_slots: 2,
            memory_budget_bytes: 64 * 1024 * 1024,
            fetch_connections: 2,
            flight_byte_cap: 8 * 1024 * 1024,
            fetch_batch_bytes: 4 * 1024 * 1024,
            fetch_batch_keys: 10,
            fetch_blacklist_window: Duration::from_millis(100),
            stimulus_log_retention: 1_000,
            validate_after_each: true,
            ..Default::default()
        }
    }

    /// Configuration for production deployments.
    pub fn production() -> Self {
        Self {
            fetch_connections: 100,
            flight_byte_cap: 1024 * 1024 * 1024, // 1GB
            stimulus_log_retention: 500_000,
            ..Default::default()
        }
    }
}

/// Builder for WorkerConfig
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: WorkerConfig::default(),
        }
    }

    /// Set the size of the implicit threads pool
    pub fn thread_slots(mut self, slots: u64) -> Self {
        self.config.thread_slots = slots;
        self
    }

    /// Add a named resource pool
    pub fn resource(mut self, name: impl Into<String>, quantity: u64) -> Self {
        self.config.extra_slots.insert(name.into(), quantity);
        self
    }

    /// Set the memory budget in bytes
    pub fn memory_budget(mut self, bytes: u64) -> Self {
        self.config.memory_budget_bytes = bytes;
        self
    }

    /// Set the outbound fetch budgets
    pub fn fetch_budgets(mut self, connections: u64, flight_byte_cap: u64) -> Self {
        self.config.fetch_connections = connections;
        self.config.flight_byte_cap = flight_byte_cap;
        self
    }

    /// Set the per-peer batching caps
    pub fn fetch_batching(mut self, max_keys: usize, max_bytes: u64) -> Self {
        self.config.fetch_batch_keys = max_keys;
        self.config.fetch_batch_bytes = max_bytes;
        self
    }

    /// Set the fetch failure policy
    pub fn fetch_failure_policy(mut self, blacklist_window: Duration, retry_cap: u32) -> Self {
        self.config.fetch_blacklist_window = blacklist_window;
        self.config.fetch_retry_cap = retry_cap;
        self
    }

    /// Set the stimulus log retention bound
    pub fn log_retention(mut self, entries: usize) -> Self {
        self.config.stimulus_log_retention = entries;
        self
    }

    /// Enable/disable the after-every-stimulus validator
    pub fn validate_after_each(mut self, enabled: bool) -> Self {
        self.config.validate_after_each = enabled;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<WorkerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for WorkerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
