//! Logging host function implementation.
//!
//! `env.log(level: i32, ptr: i32, len: i32)` lets guest code emit logs that
//! are captured by the instance. It never suspends, so it is safe to call
//! from any point of an instrumented module, including the start function.

use rewind_core::{AsyncifyContext, HostFunc, HostResult, LogLevel};
use tracing::{debug, error, info, warn};
use wasmtime::{Caller, Val};

/// Memory export the message is read from.
const MEMORY_EXPORT: &str = "memory";

/// Host implementation for guest logging.
///
/// Logs are both:
/// 1. Stored in the [`AsyncifyContext`] for later retrieval
/// 2. Emitted via the `tracing` crate for observability
pub struct LoggingHost;

impl LoggingHost {
    /// Log a message at the specified level.
    pub fn log(ctx: &mut AsyncifyContext, level: LogLevel, message: &str) {
        ctx.log(level, message.to_string());

        let instance_id = &ctx.instance_id;
        match level {
            LogLevel::Debug => debug!(instance_id, guest_log = true, "{}", message),
            LogLevel::Info => info!(instance_id, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(instance_id, guest_log = true, "{}", message),
            LogLevel::Error => error!(instance_id, guest_log = true, "{}", message),
        }
    }

    /// The `env.log` host function.
    ///
    /// Invalid pointers are reported through `tracing` and otherwise
    /// ignored; logging never fails the guest.
    pub fn host_func() -> HostFunc {
        HostFunc::new(|caller, params| {
            if let [Val::I32(level), Val::I32(ptr), Val::I32(len)] = params {
                if let Some(message) = read_message(caller, *ptr, *len) {
                    Self::log(caller.data_mut(), level_from_i32(*level), &message);
                }
            } else {
                warn!(params = params.len(), "env.log called with unexpected parameters");
            }
            Ok(HostResult::Ready(Vec::new()))
        })
    }
}

/// Copy a UTF-8 message out of guest memory.
fn read_message(caller: &mut Caller<'_, AsyncifyContext>, ptr: i32, len: i32) -> Option<String> {
    if ptr < 0 || len < 0 {
        warn!(ptr, len, "Invalid pointer or length (negative value)");
        return None;
    }

    let Some(memory) = caller
        .get_export(MEMORY_EXPORT)
        .and_then(wasmtime::Extern::into_memory)
    else {
        warn!("Memory export not found in guest module");
        return None;
    };

    #[allow(clippy::cast_sign_loss)]
    let (start, len) = (ptr as usize, len as usize);
    let data = memory.data(&*caller);
    let Some(end) = start.checked_add(len) else {
        warn!(ptr, len, "Pointer + length overflow");
        return None;
    };

    if end > data.len() {
        warn!(
            start,
            end,
            memory_size = data.len(),
            "Memory access out of bounds"
        );
        return None;
    }

    Some(String::from_utf8_lossy(&data[start..end]).into_owned())
}

/// Convert a numeric log level to [`LogLevel`].
///
/// Levels are 0=debug, 1=info, 2=warn, 3=error; unknown values map to info.
pub fn level_from_i32(level: i32) -> LogLevel {
    match level {
        0 => LogLevel::Debug,
        2 => LogLevel::Warn,
        3 => LogLevel::Error,
        _ => LogLevel::Info,
    }
}

/// Convert a [`LogLevel`] to a numeric value.
pub fn level_to_i32(level: LogLevel) -> i32 {
    match level {
        LogLevel::Debug => 0,
        LogLevel::Info => 1,
        LogLevel::Warn => 2,
        LogLevel::Error => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_stores_in_context() {
        let mut ctx = AsyncifyContext::new("test-123".into());

        LoggingHost::log(&mut ctx, LogLevel::Info, "Hello");
        LoggingHost::log(&mut ctx, LogLevel::Error, "World");

        assert_eq!(ctx.logs.len(), 2);
        assert_eq!(ctx.logs[0].message, "Hello");
        assert_eq!(ctx.logs[0].level, LogLevel::Info);
        assert_eq!(ctx.logs[1].message, "World");
        assert_eq!(ctx.logs[1].level, LogLevel::Error);
    }

    #[test]
    fn test_level_from_i32() {
        assert_eq!(level_from_i32(0), LogLevel::Debug);
        assert_eq!(level_from_i32(1), LogLevel::Info);
        assert_eq!(level_from_i32(2), LogLevel::Warn);
        assert_eq!(level_from_i32(3), LogLevel::Error);
        assert_eq!(level_from_i32(99), LogLevel::Info);
    }

    #[test]
    fn test_level_round_trip() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(level_from_i32(level_to_i32(level)), level);
        }
    }
}
