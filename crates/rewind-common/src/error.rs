//! Error types for rewind.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors for the runtime
//! - [`ProtocolStateError`]: Violations of the Asyncify state machine
//! - [`HostFunctionError`]: Errors from host function implementations

use std::io;

use thiserror::Error;

use crate::state::ExecutionState;

/// Top-level runtime errors.
///
/// These errors represent failures that can occur during the lifecycle of an
/// instrumented module, from compilation through suspended export calls.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Instantiation of a compiled module failed.
    #[error("Instantiation failed: {reason}")]
    Instantiation {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// The requested export does not exist or is reserved.
    #[error("Export not found: {name}")]
    ExportNotFound {
        /// Name of the export.
        name: String,
    },

    /// One of the Asyncify control exports is missing or has the wrong type.
    #[error("Missing Asyncify control export: {name}")]
    MissingControlExport {
        /// Name of the control export.
        name: String,
    },

    /// The module does not export the linear memory holding the save area.
    #[error("Memory export not found: {name}")]
    MissingMemory {
        /// Name of the memory export.
        name: String,
    },

    /// The module imports a function the import map does not provide.
    #[error("Import not provided: {module}::{name}")]
    ImportNotProvided {
        /// Import module name.
        module: String,
        /// Import field name.
        name: String,
    },

    /// The module imports something other than a function.
    #[error("Unsupported import {module}::{name}: only functions can be provided")]
    UnsupportedImport {
        /// Import module name.
        module: String,
        /// Import field name.
        name: String,
    },

    /// The Asyncify protocol was violated.
    #[error("Protocol violation: {0}")]
    ProtocolState(#[from] ProtocolStateError),

    /// A host function returned an error.
    #[error("Host function error: {0}")]
    HostFunction(#[from] HostFunctionError),

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// Execution exhausted the configured fuel limit.
    #[error("Fuel exhausted: CPU limit exceeded")]
    FuelExhausted,

    /// Reading or writing the save-area descriptor failed.
    #[error("Memory access failed at {addr:#x}: {reason}")]
    Memory {
        /// Address that was accessed.
        addr: u32,
        /// Description of the failure.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Violations of the Asyncify suspend/resume protocol.
///
/// These are fatal: they signal misplaced instrumentation in the module or a
/// caller re-entering an instance that is mid-cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolStateError {
    /// An operation observed a state other than the one it requires.
    #[error("Invalid async state {actual} during {operation}, expected {expected}")]
    UnexpectedState {
        /// The operation that performed the check.
        operation: &'static str,
        /// The state the operation requires.
        expected: ExecutionState,
        /// The state that was observed.
        actual: ExecutionState,
    },

    /// `asyncify_get_state` returned a value outside the known states.
    #[error("Unknown async state value {0}")]
    UnknownState(i32),

    /// An import tried to suspend while another suspension is unresolved.
    #[error("A suspended host value is already pending")]
    PendingOccupied,

    /// The module unwound without an import having produced a pending value.
    #[error("Module unwound without a pending host value")]
    MissingPendingValue,

    /// An import was replayed but no resolved value was recorded for it.
    #[error("Import replayed without a resolved host value")]
    MissingResolvedValue,

    /// The replay finished without an import consuming the resolved value.
    #[error("Replay completed without consuming the resolved host value")]
    UnconsumedValue,

    /// A previous call was dropped while awaiting its host value.
    #[error("A previous call was abandoned while suspended")]
    StaleSuspension,

    /// An import tried to suspend before the instance was fully wired.
    #[error("Suspension attempted before instance initialization completed")]
    NotInitialized,
}

/// Errors from host function implementations.
///
/// These errors occur when host functions (provided by the runtime to
/// WebAssembly modules) fail to complete their operations.
#[derive(Error, Debug)]
pub enum HostFunctionError {
    /// A host function failed, synchronously or after suspending.
    #[error("{module}::{name} failed: {reason}")]
    Failed {
        /// Import module name.
        module: String,
        /// Import field name.
        name: String,
        /// Description of the failure.
        reason: String,
    },

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },

    /// A host function produced values that do not match its signature.
    #[error("Invalid return value: {reason}")]
    InvalidReturn {
        /// Description of the mismatch.
        reason: String,
    },

    /// The requested operation was disabled by configuration.
    #[error("Permission denied: {resource}")]
    PermissionDenied {
        /// Description of the resource that access was denied to.
        resource: String,
    },
}

impl RuntimeError {
    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `Instantiation` error.
    pub fn instantiation(reason: impl Into<String>) -> Self {
        Self::Instantiation {
            reason: reason.into(),
        }
    }

    /// Create a new `ExportNotFound` error.
    pub fn export_not_found(name: impl Into<String>) -> Self {
        Self::ExportNotFound { name: name.into() }
    }

    /// Create a new `MissingControlExport` error.
    pub fn missing_control_export(name: impl Into<String>) -> Self {
        Self::MissingControlExport { name: name.into() }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `Memory` error.
    pub fn memory(addr: u32, reason: impl Into<String>) -> Self {
        Self::Memory {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error is an Asyncify protocol violation.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolState(_))
    }

    /// Returns `true` if this error indicates a resource limit was exceeded.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::FuelExhausted)
    }
}

impl HostFunctionError {
    /// Create a new `Failed` error for the given import.
    pub fn failed(
        module: impl Into<String>,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Failed {
            module: module.into(),
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}
