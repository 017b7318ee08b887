//! Timer host function implementation.
//!
//! `env.sleep_ms(ms: i32) -> i32` suspends the calling export for `ms`
//! milliseconds using `tokio::time::sleep`, then resumes it with `0`.

use std::time::Duration;

use rewind_common::HostFunctionError;
use rewind_core::{HostFunc, HostResult};
use tracing::debug;
use wasmtime::Val;

/// Host implementation for guest sleeps.
pub struct TimerHost;

impl TimerHost {
    /// Validate a requested sleep against the configured maximum.
    ///
    /// # Errors
    ///
    /// Returns [`HostFunctionError::InvalidArgument`] for negative values or
    /// values above `max_sleep_ms`.
    pub fn sleep_duration(ms: i32, max_sleep_ms: u64) -> Result<Duration, HostFunctionError> {
        let ms = u64::try_from(ms).map_err(|_| {
            HostFunctionError::invalid_argument(format!("sleep of {ms}ms is negative"))
        })?;

        if ms > max_sleep_ms {
            return Err(HostFunctionError::invalid_argument(format!(
                "sleep of {ms}ms exceeds the {max_sleep_ms}ms limit"
            )));
        }

        Ok(Duration::from_millis(ms))
    }

    /// The `env.sleep_ms` host function.
    ///
    /// Invalid durations fail synchronously, before the guest unwinds.
    pub fn host_func(max_sleep_ms: u64) -> HostFunc {
        HostFunc::new(move |_caller, params| {
            let [Val::I32(ms)] = params else {
                return Err(HostFunctionError::invalid_argument(
                    "sleep_ms expects a single i32",
                ));
            };

            let duration = Self::sleep_duration(*ms, max_sleep_ms)?;
            debug!(duration_ms = duration.as_millis(), "Guest sleeping");

            Ok(HostResult::pending(async move {
                tokio::time::sleep(duration).await;
                Ok(vec![Val::I32(0)])
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_duration() {
        assert_eq!(
            TimerHost::sleep_duration(250, 1000).unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(TimerHost::sleep_duration(0, 1000).unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_sleep_duration_rejects_negative() {
        let err = TimerHost::sleep_duration(-1, 1000).unwrap_err();
        assert_eq!(err.to_string(), "Invalid argument: sleep of -1ms is negative");
    }

    #[test]
    fn test_sleep_duration_rejects_over_limit() {
        let err = TimerHost::sleep_duration(1001, 1000).unwrap_err();
        assert!(matches!(err, HostFunctionError::InvalidArgument { .. }));
        assert!(err.to_string().contains("exceeds the 1000ms limit"));
    }
}
