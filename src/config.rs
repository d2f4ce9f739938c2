// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

/// Operational configuration of one runtime instance.
///
/// All fields have defaults so a query can be registered for tests without
/// specifying anything. `RuntimeConfig::validate` is called from
/// `QueryManager::register_query` and turns inconsistent values into
/// `RuntimeError::InvalidConfig` before a query is ever started.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Size in bytes of each pooled tuple buffer.
    #[serde(default = "RuntimeConfig::default_buffer_size")]
    pub buffer_size: usize,

    /// Number of buffers in the global pool, shared across pipelines.
    #[serde(default = "RuntimeConfig::default_global_pool_capacity")]
    pub global_pool_capacity: usize,

    /// Number of buffers in each worker thread's local pool.
    #[serde(default = "RuntimeConfig::default_local_pool_capacity")]
    pub local_pool_capacity: usize,

    /// Byte alignment of pooled buffers.
    #[serde(default = "RuntimeConfig::default_alignment")]
    pub alignment: usize,

    /// Number of OS worker threads in the query manager's pool.
    #[serde(default = "RuntimeConfig::default_worker_threads")]
    pub worker_threads: usize,

    /// Ring size of the sequence shredder, in in-flight sequence numbers.
    /// Must be a power of two and at least as large as the expected window
    /// of concurrently in-flight raw buffers, or producers busy-wait
    /// (spec.md §4.3 "Failure").
    #[serde(default = "RuntimeConfig::default_shredder_ring_size")]
    pub shredder_ring_size: usize,

    /// Allowed lateness for slice retention (spec.md §4.7 "Failure",
    /// §9 Open Questions — a tunable with documented, not invariant, behavior).
    #[serde(default)]
    pub allowed_lateness_ms: u64,

    /// Target load factor used to size a slice's hashmap at construction.
    #[serde(default = "RuntimeConfig::default_hashmap_target_load_factor")]
    pub hashmap_target_load_factor: f64,

    /// Entries per page for paged vectors used in slice state.
    #[serde(default = "RuntimeConfig::default_paged_vector_page_entries")]
    pub paged_vector_page_entries: usize,
}

impl RuntimeConfig {
    pub fn default_buffer_size() -> usize {
        4 * 1024
    }

    pub fn default_global_pool_capacity() -> usize {
        256
    }

    pub fn default_local_pool_capacity() -> usize {
        32
    }

    pub fn default_alignment() -> usize {
        64
    }

    pub fn default_worker_threads() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    pub fn default_shredder_ring_size() -> usize {
        1024
    }

    pub fn default_hashmap_target_load_factor() -> f64 {
        0.75
    }

    pub fn default_paged_vector_page_entries() -> usize {
        1024
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.buffer_size == 0 {
            return Err(RuntimeError::InvalidConfig(
                "buffer_size must be > 0".into(),
            ));
        }
        if !self.shredder_ring_size.is_power_of_two() {
            return Err(RuntimeError::InvalidConfig(
                "shredder_ring_size must be a power of two".into(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(RuntimeError::InvalidConfig(
                "worker_threads must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.hashmap_target_load_factor) {
            return Err(RuntimeError::InvalidConfig(
                "hashmap_target_load_factor must be in [0, 1)".into(),
            ));
        }
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(RuntimeError::InvalidConfig(
                "alignment must be a power of two".into(),
            ));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            buffer_size: Self::default_buffer_size(),
            global_pool_capacity: Self::default_global_pool_capacity(),
            local_pool_capacity: Self::default_local_pool_capacity(),
            alignment: Self::default_alignment(),
            worker_threads: Self::default_worker_threads(),
            shredder_ring_size: Self::default_shredder_ring_size(),
            allowed_lateness_ms: 0,
            hashmap_target_load_factor: Self::default_hashmap_target_load_factor(),
            paged_vector_page_entries: Self::default_paged_vector_page_entries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_ring_size() {
        let mut cfg = RuntimeConfig::default();
        cfg.shredder_ring_size = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn round_trips_through_yaml() {
        let cfg = RuntimeConfig::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: RuntimeConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.buffer_size, cfg.buffer_size);
    }
}
