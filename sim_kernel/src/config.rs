//! Kernel configuration
//!
//! Every bound the kernel enforces lives here, so tests can shrink a table
//! or a pool to hit its limit in a handful of calls.
//!
//! ## Example
//!
//! ```
//! use sim_kernel::config::KernelConfig;
//!
//! let config = KernelConfig::default().with_capability_slots(4);
//! assert_eq!(config.capability_slots, 4);
//!
//! let config = KernelConfig::from_json(r#"{"swap_max_blocks": 2}"#).unwrap();
//! assert_eq!(config.swap_max_blocks, 2);
//! assert_eq!(config.stack_size, 2 * 1024 * 1024);
//! ```

use core_types::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Malformed configuration: {0}")]
    Malformed(String),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Lowest user address
    pub user_min: u64,
    /// One past the highest user address
    pub user_max: u64,
    /// Virtual size reserved per user stack, guard page included
    pub stack_size: u64,
    /// Capacity of each process's capability table
    pub capability_slots: u32,
    /// Capacity of the global upcall proxy table
    pub upcall_slots: u32,
    /// Slots per swap block
    pub swap_slots_per_block: u32,
    /// Upper bound on swap blocks
    pub swap_max_blocks: u32,
    /// Upper bound on a single marshalled string or buffer
    pub max_marshal_bytes: u64,
    /// Number of scheduling cores
    pub cores: usize,
    /// Ticks a thread runs before it is preempted
    pub quantum_ticks: u64,
    /// Upcall records a server process may create
    pub max_upcall_records: usize,
    /// Longest wait-for chain followed by priority propagation
    pub max_priority_chain: usize,
    /// Default base of the user interface table
    pub interface_base: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            user_min: 0x1000,
            user_max: 0x7FE0_0000,
            stack_size: 2 * 1024 * 1024,
            capability_slots: 100,
            upcall_slots: 100,
            swap_slots_per_block: 1018,
            swap_max_blocks: 64,
            max_marshal_bytes: PAGE_SIZE,
            cores: 1,
            quantum_ticks: 10,
            max_upcall_records: 8,
            max_priority_chain: 64,
            interface_base: 0x7FE0_0000,
        }
    }
}

impl KernelConfig {
    /// Parses a configuration from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: KernelConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_user_range(mut self, user_min: u64, user_max: u64) -> Self {
        self.user_min = user_min;
        self.user_max = user_max;
        self
    }

    pub fn with_stack_size(mut self, stack_size: u64) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_capability_slots(mut self, slots: u32) -> Self {
        self.capability_slots = slots;
        self
    }

    pub fn with_upcall_slots(mut self, slots: u32) -> Self {
        self.upcall_slots = slots;
        self
    }

    pub fn with_swap(mut self, slots_per_block: u32, max_blocks: u32) -> Self {
        self.swap_slots_per_block = slots_per_block;
        self.swap_max_blocks = max_blocks;
        self
    }

    pub fn with_max_marshal_bytes(mut self, bytes: u64) -> Self {
        self.max_marshal_bytes = bytes;
        self
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores;
        self
    }

    pub fn with_quantum_ticks(mut self, ticks: u64) -> Self {
        self.quantum_ticks = ticks;
        self
    }

    pub fn with_max_upcall_records(mut self, records: usize) -> Self {
        self.max_upcall_records = records;
        self
    }

    /// Checks the bounds against each other
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_min % PAGE_SIZE != 0 || self.user_max % PAGE_SIZE != 0 {
            return Err(ConfigError::Invalid("user range must be page aligned"));
        }
        if self.user_max <= self.user_min {
            return Err(ConfigError::Invalid("empty user range"));
        }
        if self.stack_size <= PAGE_SIZE || self.stack_size % PAGE_SIZE != 0 {
            return Err(ConfigError::Invalid("stack size must be pages plus a guard page"));
        }
        if self.capability_slots == 0 || self.upcall_slots == 0 {
            return Err(ConfigError::Invalid("tables need at least one slot"));
        }
        if self.swap_slots_per_block == 0 {
            return Err(ConfigError::Invalid("swap blocks need at least one slot"));
        }
        if self.cores == 0 {
            return Err(ConfigError::Invalid("at least one core is required"));
        }
        if self.interface_base % core_types::WORD_SIZE != 0 {
            return Err(ConfigError::Invalid("interface base must be word aligned"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = KernelConfig::from_json(r#"{"capability_slots": 8, "cores": 2}"#).unwrap();
        assert_eq!(config.capability_slots, 8);
        assert_eq!(config.cores, 2);
        assert_eq!(config.upcall_slots, 100);
    }

    #[test]
    fn test_invalid_configs_rejected() {
        assert!(KernelConfig::from_json(r#"{"cores": 0}"#).is_err());
        assert!(KernelConfig::from_json(r#"{"user_min": 123}"#).is_err());
        assert!(KernelConfig::from_json("[").is_err());
        let config = KernelConfig::default().with_stack_size(PAGE_SIZE);
        assert!(config.validate().is_err());
    }
}
