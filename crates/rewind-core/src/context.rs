//! Per-instance store data.
//!
//! This module provides:
//! - [`AsyncifyContext`]: Store data reachable from every wrapped import
//! - [`LogEntry`] and [`LogLevel`]: Structured logging from guest code
//! - [`ExecutionMetrics`]: Transition counters and timings

use std::time::{Duration, Instant};

use wasmtime::Store;

use crate::WasmEngine;
use crate::controller::Controller;
use rewind_common::{ExecutionConfig, ProtocolStateError, RuntimeError};

/// Per-instance execution context.
///
/// This struct is the data of the instance's [`Store`]. Wrapped imports
/// reach the [`Controller`] through it via [`wasmtime::Caller`], which keeps
/// all suspend/resume state scoped to exactly one instance.
pub struct AsyncifyContext {
    /// Unique instance identifier for tracing.
    pub instance_id: String,

    /// Logs collected from guest code.
    pub logs: Vec<LogEntry>,

    /// Execution metrics.
    pub metrics: ExecutionMetrics,

    /// Installed once the instance has been wired.
    controller: Option<Controller>,

    created_at: Instant,
}

/// A single log entry from guest code.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level (debug, info, warn, error).
    pub level: LogLevel,

    /// Log message content.
    pub message: String,

    /// Timestamp when the log was recorded.
    pub timestamp: Instant,
}

/// Log level for guest logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level messages.
    Debug,
    /// Informational messages.
    Info,
    /// Warning messages.
    Warn,
    /// Error messages.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Execution metrics accumulated over the lifetime of an instance.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetrics {
    /// Completed logical export calls.
    pub calls: u64,

    /// Number of `start_unwind` transitions triggered by imports.
    pub unwinds: u64,

    /// Number of `start_rewind` transitions issued by exports.
    pub rewinds: u64,

    /// Fuel consumed by all calls.
    pub fuel_consumed: u64,

    /// Time spent awaiting suspended host values.
    pub suspended: Duration,
}

impl AsyncifyContext {
    /// Create a new context with the given instance ID.
    pub fn new(instance_id: String) -> Self {
        Self {
            instance_id,
            logs: Vec::new(),
            metrics: ExecutionMetrics::default(),
            controller: None,
            created_at: Instant::now(),
        }
    }

    /// Add a log entry.
    pub fn log(&mut self, level: LogLevel, message: String) {
        self.logs.push(LogEntry {
            level,
            message,
            timestamp: Instant::now(),
        });
    }

    /// Time since the instance was created.
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Returns `true` once the controller has been installed.
    pub fn is_wired(&self) -> bool {
        self.controller.is_some()
    }

    pub(crate) fn install(&mut self, controller: Controller) {
        self.controller = Some(controller);
    }

    pub(crate) fn controller(&self) -> Result<&Controller, ProtocolStateError> {
        self.controller
            .as_ref()
            .ok_or(ProtocolStateError::NotInitialized)
    }

    pub(crate) fn controller_mut(&mut self) -> Result<&mut Controller, ProtocolStateError> {
        self.controller
            .as_mut()
            .ok_or(ProtocolStateError::NotInitialized)
    }
}

/// Create a new Wasmtime store for one instance.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    instance_id: String,
) -> Result<Store<AsyncifyContext>, RuntimeError> {
    let context = AsyncifyContext::new(instance_id);
    let mut store = Store::new(engine.inner(), context);

    // The engine always compiles fuel checks in, so an unmetered store gets
    // an effectively unlimited budget.
    let fuel = if config.fuel_metering {
        config.max_fuel
    } else {
        u64::MAX
    };
    store
        .set_fuel(fuel)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))?;

    if engine.is_epoch_enabled() {
        store.set_epoch_deadline(config.segment_timeout_ticks);
    }

    Ok(store)
}

/// Get remaining fuel from a store.
pub fn get_remaining_fuel(store: &Store<AsyncifyContext>) -> Option<u64> {
    store.get_fuel().ok()
}

/// Calculate fuel consumed.
pub fn calculate_fuel_consumed(initial_fuel: u64, store: &Store<AsyncifyContext>) -> u64 {
    let remaining = get_remaining_fuel(store).unwrap_or(0);
    initial_fuel.saturating_sub(remaining)
}
