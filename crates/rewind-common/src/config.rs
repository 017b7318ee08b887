//! Configuration structures for rewind.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, interruption)
//! - [`ExecutionConfig`]: Per-instance execution limits (fuel, timeout)
//! - [`AsyncifyConfig`]: Control export names and save-area defaults
//! - [`HostConfig`]: Which standard host imports are registered

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::RuntimeError;

/// Size in bytes of the save-area descriptor (two 32-bit offsets).
pub const DESCRIPTOR_SIZE: u32 = 8;

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for rewind.
/// It can be loaded from TOML or JSON files.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-instance execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Asyncify symbol names and save-area defaults.
    #[serde(default)]
    pub asyncify: AsyncifyConfig,

    /// Standard host imports.
    #[serde(default)]
    pub host: HostConfig,
}

/// Wasmtime engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for faster instantiation.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Enable epoch-based interruption.
    ///
    /// The deadline is re-armed before every synchronous segment of a call,
    /// so time spent awaiting host values is not charged to the module.
    #[serde(default = "defaults::epoch_interruption")]
    pub epoch_interruption: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            epoch_interruption: defaults::epoch_interruption(),
        }
    }
}

/// Per-instance execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Maximum fuel for the lifetime of an instance.
    #[serde(default = "defaults::max_fuel")]
    pub max_fuel: u64,

    /// Enable fuel metering.
    #[serde(default = "defaults::fuel_metering")]
    pub fuel_metering: bool,

    /// Epoch ticks allowed for each synchronous segment of an export call.
    ///
    /// With one tick per millisecond this is a timeout in milliseconds.
    #[serde(default = "defaults::segment_timeout_ticks")]
    pub segment_timeout_ticks: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_fuel: defaults::max_fuel(),
            fuel_metering: defaults::fuel_metering(),
            segment_timeout_ticks: defaults::segment_timeout_ticks(),
        }
    }
}

/// Asyncify symbol names and save-area defaults.
///
/// The defaults match what Binaryen's `--asyncify` pass and `wasm-ld` emit.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AsyncifyConfig {
    /// Prefix shared by the control exports; exports with this prefix are
    /// never wrapped.
    #[serde(default = "defaults::control_prefix")]
    pub control_prefix: String,

    /// Name of the exported linear memory holding the save area.
    #[serde(default = "defaults::memory_export")]
    pub memory_export: String,

    /// Export giving the descriptor address explicitly.
    #[serde(default = "defaults::data_addr_export")]
    pub data_addr_export: String,

    /// Export holding the low-stack mark.
    #[serde(default = "defaults::stack_low_export")]
    pub stack_low_export: String,

    /// Export holding the live stack pointer.
    #[serde(default = "defaults::stack_pointer_export")]
    pub stack_pointer_export: String,

    /// Descriptor address used when the module does not export one.
    #[serde(default = "defaults::default_data_addr")]
    pub default_data_addr: u32,

    /// End of the save area used when seeding without stack symbols.
    #[serde(default = "defaults::default_save_area_end")]
    pub default_save_area_end: u32,
}

impl Default for AsyncifyConfig {
    fn default() -> Self {
        Self {
            control_prefix: defaults::control_prefix(),
            memory_export: defaults::memory_export(),
            data_addr_export: defaults::data_addr_export(),
            stack_low_export: defaults::stack_low_export(),
            stack_pointer_export: defaults::stack_pointer_export(),
            default_data_addr: defaults::default_data_addr(),
            default_save_area_end: defaults::default_save_area_end(),
        }
    }
}

impl AsyncifyConfig {
    /// Name of a control export, e.g. `get_state` -> `asyncify_get_state`.
    pub fn control_export(&self, operation: &str) -> String {
        format!("{}{operation}", self.control_prefix)
    }

    /// Returns `true` if `name` is reserved for the control surface.
    pub fn is_reserved(&self, name: &str) -> bool {
        name.starts_with(&self.control_prefix)
    }

    /// Default save-area start: immediately after the descriptor.
    pub fn default_save_area_start(&self, data_addr: u32) -> u32 {
        data_addr.saturating_add(DESCRIPTOR_SIZE)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the control prefix is empty.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.control_prefix.is_empty() {
            return Err(RuntimeError::invalid_config(
                "asyncify.control_prefix must not be empty",
            ));
        }

        let start = self.default_save_area_start(self.default_data_addr);
        if self.default_save_area_end <= start {
            warn!(
                start = start,
                end = self.default_save_area_end,
                "Default save area is empty; modules without stack symbols cannot suspend"
            );
        }

        Ok(())
    }
}

/// Standard host import configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// Register `env.log`.
    #[serde(default = "defaults::logging_enabled")]
    pub logging_enabled: bool,

    /// Register `env.sleep_ms`.
    #[serde(default = "defaults::timers_enabled")]
    pub timers_enabled: bool,

    /// Longest sleep a guest may request, in milliseconds.
    #[serde(default = "defaults::max_sleep_ms")]
    pub max_sleep_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            logging_enabled: defaults::logging_enabled(),
            timers_enabled: defaults::timers_enabled(),
            max_sleep_ms: defaults::max_sleep_ms(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn epoch_interruption() -> bool {
        true
    }

    pub const fn max_fuel() -> u64 {
        10_000_000
    }

    pub const fn fuel_metering() -> bool {
        true
    }

    pub const fn segment_timeout_ticks() -> u64 {
        100
    }

    pub fn control_prefix() -> String {
        "asyncify_".to_string()
    }

    pub fn memory_export() -> String {
        "memory".to_string()
    }

    pub fn data_addr_export() -> String {
        "asyncify_data_addr".to_string()
    }

    pub fn stack_low_export() -> String {
        "__stack_low".to_string()
    }

    pub fn stack_pointer_export() -> String {
        "__stack_pointer".to_string()
    }

    pub const fn default_data_addr() -> u32 {
        16
    }

    pub const fn default_save_area_end() -> u32 {
        1024
    }

    pub const fn logging_enabled() -> bool {
        true
    }

    pub const fn timers_enabled() -> bool {
        true
    }

    pub const fn max_sleep_ms() -> u64 {
        60_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(config.engine.pooling_allocator);
        assert_eq!(config.engine.max_instances, 1000);
        assert!(config.engine.epoch_interruption);

        assert_eq!(config.execution.max_fuel, 10_000_000);
        assert_eq!(config.execution.segment_timeout_ticks, 100);
        assert!(config.execution.fuel_metering);

        assert_eq!(config.asyncify.control_prefix, "asyncify_");
        assert_eq!(config.asyncify.default_data_addr, 16);
        assert_eq!(config.asyncify.default_save_area_end, 1024);

        assert!(config.host.logging_enabled);
        assert!(config.host.timers_enabled);
    }

    #[test]
    fn test_control_export_names() {
        let config = AsyncifyConfig::default();

        assert_eq!(config.control_export("get_state"), "asyncify_get_state");
        assert_eq!(
            config.control_export("start_unwind"),
            "asyncify_start_unwind"
        );
        assert!(config.is_reserved("asyncify_stop_rewind"));
        // The data address export is reserved too, it is part of the control surface.
        assert!(config.is_reserved(&config.data_addr_export));
        assert!(!config.is_reserved("main"));
    }

    #[test]
    fn test_default_save_area_start() {
        let config = AsyncifyConfig::default();
        assert_eq!(config.default_save_area_start(16), 24);
        assert_eq!(config.default_save_area_start(u32::MAX), u32::MAX);
    }

    #[test]
    fn test_validate_rejects_empty_prefix() {
        let config = AsyncifyConfig {
            control_prefix: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(AsyncifyConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(
            config.engine.max_instances,
            deserialized.engine.max_instances
        );
        assert_eq!(
            config.asyncify.stack_pointer_export,
            deserialized.asyncify.stack_pointer_export
        );
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"asyncify": {"default_data_addr": 64}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        // Explicitly set value
        assert_eq!(config.asyncify.default_data_addr, 64);
        // Default values for unspecified fields
        assert_eq!(config.asyncify.memory_export, "memory");
        assert!(config.engine.pooling_allocator);
        assert_eq!(config.execution.max_fuel, 10_000_000);
    }
}
