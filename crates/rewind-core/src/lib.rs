//! Asyncify suspend/resume bridge on top of Wasmtime.
//!
//! A module instrumented with Binaryen's Asyncify pass can unwind its call
//! stack into linear memory and later rewind it. This crate lets such a
//! module call host functions that answer with a future, while the host
//! awaits the module's exports:
//!
//! - [`WasmEngine`]: Configured Wasmtime engine shared by all instances
//! - [`CompiledModule`]: Compiled module with control-surface inspection
//! - [`AsyncInstance`]: One wired instance with awaitable exports
//! - [`HostFunc`] / [`ImportMap`]: Host functions that may suspend
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 AsyncInstance::call_export              │
//! │  - asserts idle, calls export, loops while unwinding    │
//! │  - awaits the pending host value between segments       │
//! └─────────────────────────────────────────────────────────┘
//!                 │ call            ▲ unwind / return
//!                 ▼                 │
//! ┌─────────────────────────────────────────────────────────┐
//! │              Guest code (synchronous segment)           │
//! └─────────────────────────────────────────────────────────┘
//!                 │ import          ▲ value / placeholder
//!                 ▼                 │
//! ┌─────────────────────────────────────────────────────────┐
//! │                   Import interceptor                    │
//! │  - rewinding: stop_rewind, hand back resolved value     │
//! │  - idle: call host; on a future, start_unwind           │
//! └─────────────────────────────────────────────────────────┘
//!                 │
//!                 ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          Controller (in Store<AsyncifyContext>)         │
//! │  - control exports, save-area descriptor, stack hook    │
//! │  - single pending-value slot                            │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod controller;
pub mod descriptor;
pub mod engine;
pub mod exports;
pub mod imports;
pub mod instance;
pub mod module;

pub use context::{AsyncifyContext, ExecutionMetrics, LogEntry, LogLevel};
pub use controller::{CONTROL_OPERATIONS, ControlOps, Controller, PendingValue};
pub use descriptor::{SaveArea, SaveAreaDescriptor, Seeding, StackHook};
pub use engine::WasmEngine;
pub use exports::WrappedExport;
pub use imports::{HostFunc, HostFuture, HostResult, ImportMap};
pub use instance::AsyncInstance;
pub use module::{CompiledModule, ItemKind};
