//! Common types, errors, and configuration for rewind.
//!
//! This crate provides shared functionality used across the rewind workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for engine, execution and Asyncify settings
//! - The Asyncify [`ExecutionState`] shared by every component

pub mod config;
pub mod config_file;
pub mod error;
pub mod state;

pub use config::{
    AsyncifyConfig, DESCRIPTOR_SIZE, EngineConfig, ExecutionConfig, HostConfig, RuntimeConfig,
};
pub use config_file::{ConfigFile, ConfigFileError, LoggingConfig};
pub use error::{HostFunctionError, ProtocolStateError, RuntimeError};
pub use state::ExecutionState;
