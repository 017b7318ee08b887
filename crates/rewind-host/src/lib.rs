//! Standard host functions for rewind.
//!
//! Guest modules import these from the `env` namespace:
//!
//! - [`logging`]: `env.log`, synchronous structured logging
//! - [`timer`]: `env.sleep_ms`, a suspending sleep
//!
//! [`linker::register_all`] adds every enabled function to an
//! [`ImportMap`](rewind_core::ImportMap).

pub mod linker;
pub mod logging;
pub mod timer;

pub use logging::LoggingHost;
pub use timer::TimerHost;
