//! Driver configuration.
use bitflags::bitflags;
use std::path::PathBuf;

/// Environment variable holding a comma-separated list of debug flag names.
pub const DEBUG_ENV: &str = "PANCORE_DEBUG";
/// Environment variable holding the path of the capture dump written with `dump`.
pub const DUMP_PATH_ENV: &str = "PANCORE_DUMP_PATH";

/// Bottom of the GPU VA space kept out of reach of allocations.
pub const VA_RESERVE_BOTTOM: u64 = 0x200_0000;
pub const VA_END: u64 = 1 << 32;
pub const TILER_HEAP_SIZE: u64 = 128 * 1024 * 1024;
pub const POOL_SLAB_SIZE: u64 = 64 * 1024;

bitflags! {
    #[derive(Default)]
    pub struct DebugFlags: u32 {
        /// Log device selection and capabilities.
        const STARTUP = 1 << 0;
        /// Mirror buffer-object lifetimes and submitted chains in a capture context.
        const TRACE = 1 << 1;
        /// Wait for each batch to complete after submitting it.
        const SYNC = 1 << 2;
        /// Write the capture context to disk after each submission.
        const DUMP = 1 << 3;
    }
}

impl DebugFlags {
    /// Parses a comma-separated list of flag names. Unknown names are ignored with a warning.
    pub fn parse(s: &str) -> DebugFlags {
        let mut flags = DebugFlags::empty();
        for name in s.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match name {
                "startup" => flags |= DebugFlags::STARTUP,
                "trace" => flags |= DebugFlags::TRACE,
                "sync" => flags |= DebugFlags::SYNC,
                "dump" => flags |= DebugFlags::DUMP,
                "all" => flags = DebugFlags::all(),
                other => tracing::warn!("unknown debug flag `{}`", other),
            }
        }
        flags
    }
}

#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub debug: DebugFlags,
    pub tiler_heap_size: u64,
    pub va_reserve_bottom: u64,
    pub va_end: u64,
    /// Size of the buffer objects backing the per-command-buffer pools.
    pub pool_slab_size: u64,
    pub dump_path: PathBuf,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig {
            debug: DebugFlags::empty(),
            tiler_heap_size: TILER_HEAP_SIZE,
            va_reserve_bottom: VA_RESERVE_BOTTOM,
            va_end: VA_END,
            pool_slab_size: POOL_SLAB_SIZE,
            dump_path: PathBuf::from("pancore.dump.json"),
        }
    }
}

impl DriverConfig {
    /// Default configuration with overrides read from the environment.
    pub fn from_env() -> DriverConfig {
        let mut config = DriverConfig::default();
        if let Ok(s) = std::env::var(DEBUG_ENV) {
            config.debug = DebugFlags::parse(&s);
        }
        if let Ok(path) = std::env::var(DUMP_PATH_ENV) {
            config.dump_path = PathBuf::from(path);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_debug_flags() {
        assert_eq!(
            DebugFlags::parse("trace, sync"),
            DebugFlags::TRACE | DebugFlags::SYNC
        );
        assert_eq!(DebugFlags::parse("bogus,dump"), DebugFlags::DUMP);
        assert_eq!(DebugFlags::parse(""), DebugFlags::empty());
        assert_eq!(DebugFlags::parse("all"), DebugFlags::all());
    }
}
