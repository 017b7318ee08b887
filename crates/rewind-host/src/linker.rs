//! Host function registration.
//!
//! Standard host functions are added to an [`ImportMap`] and wrapped per
//! instance by [`AsyncInstance::new`](rewind_core::AsyncInstance::new).

use rewind_common::HostConfig;
use rewind_core::ImportMap;
use tracing::debug;

use crate::logging::LoggingHost;
use crate::timer::TimerHost;

/// Register all enabled standard host functions.
///
/// This registers the following host functions:
/// - `env::log` - Logging function for guest code
/// - `env::sleep_ms` - Suspending sleep
pub fn register_all(imports: &mut ImportMap, config: &HostConfig) {
    if config.logging_enabled {
        register_logging(imports);
    }
    if config.timers_enabled {
        register_timers(imports, config.max_sleep_ms);
    }
}

/// Register `env::log(level: i32, ptr: i32, len: i32)`.
///
/// # Memory Protocol
///
/// The guest passes:
/// - `level`: Log level (0=debug, 1=info, 2=warn, 3=error)
/// - `ptr`: Pointer to the message string in guest memory
/// - `len`: Length of the message in bytes (UTF-8)
pub fn register_logging(imports: &mut ImportMap) {
    imports.insert("env", "log", LoggingHost::host_func());
    debug!("Registered env::log");
}

/// Register `env::sleep_ms(ms: i32) -> i32`.
pub fn register_timers(imports: &mut ImportMap, max_sleep_ms: u64) {
    imports.insert("env", "sleep_ms", TimerHost::host_func(max_sleep_ms));
    debug!(max_sleep_ms, "Registered env::sleep_ms");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_all() {
        let mut imports = ImportMap::new();
        register_all(&mut imports, &HostConfig::default());

        assert_eq!(imports.len(), 2);
        assert!(imports.get("env", "log").is_some());
        assert!(imports.get("env", "sleep_ms").is_some());
    }

    #[test]
    fn test_register_respects_config() {
        let config = HostConfig {
            timers_enabled: false,
            ..Default::default()
        };
        let mut imports = ImportMap::new();
        register_all(&mut imports, &config);

        assert!(imports.get("env", "log").is_some());
        assert!(imports.get("env", "sleep_ms").is_none());
    }
}
