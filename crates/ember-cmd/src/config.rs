//! # Engine Configuration
//!
//! Sizes and switches supplied when a command stream receiver is built.

use ember_core::{ByteSize, MemoryConstants};

// =============================================================================
// DISPATCH MODE
// =============================================================================

/// When recorded batches reach the hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Every flush is handed to the hardware at once
    #[default]
    Immediate,
    /// Flushes are recorded and handed over together later
    Batched,
}

impl DispatchMode {
    /// Parse `immediate` / `batched`
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("immediate") || value == "0" {
            Some(DispatchMode::Immediate)
        } else if value.eq_ignore_ascii_case("batched") || value == "1" {
            Some(DispatchMode::Batched)
        } else {
            None
        }
    }
}

// =============================================================================
// ENGINE CONFIG
// =============================================================================

/// Command stream receiver configuration
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Dispatch mode
    pub dispatch_mode: DispatchMode,
    /// Default size of the dynamic-state, indirect-object and general-state heaps
    pub default_heap_size: ByteSize,
    /// Default size of the surface-state heap
    pub default_ssh_size: ByteSize,
    /// Largest surface-state heap exposed to callers
    pub max_ssh_size: ByteSize,
    /// Slack past the end of a command stream the hardware may prefetch
    pub cs_overfetch_size: ByteSize,
    /// Space kept free at the end of a command stream for the terminator
    pub submission_reserve: ByteSize,
    /// Whether the indirect-object heap lives in the 32-bit internal window
    pub internal_heaps_supported: bool,
}

impl EngineConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            dispatch_mode: DispatchMode::Immediate,
            default_heap_size: ByteSize::KIB_64,
            default_ssh_size: ByteSize::KIB_64,
            max_ssh_size: ByteSize::KIB_64,
            cs_overfetch_size: ByteSize::KIB_4,
            submission_reserve: ByteSize::from_bytes(MemoryConstants::CACHE_LINE_SIZE),
            internal_heaps_supported: true,
        }
    }

    /// With a dispatch mode
    pub const fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.dispatch_mode = mode;
        self
    }

    /// Apply `EMBER_DISPATCH_MODE` and `EMBER_DEFAULT_HEAP_SIZE` from the environment
    #[cfg(feature = "std")]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("EMBER_DISPATCH_MODE") {
            match DispatchMode::parse(&value) {
                Some(mode) => self.dispatch_mode = mode,
                None => log::warn!("ignoring EMBER_DISPATCH_MODE={:?}", value),
            }
        }
        if let Ok(value) = std::env::var("EMBER_DEFAULT_HEAP_SIZE") {
            match value.trim().parse::<u64>() {
                Ok(bytes) if bytes > 0 => {
                    self.default_heap_size = ByteSize::from_bytes(bytes);
                }
                _ => log::warn!("ignoring EMBER_DEFAULT_HEAP_SIZE={:?}", value),
            }
        }
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.dispatch_mode, DispatchMode::Immediate);
        assert_eq!(config.default_heap_size, ByteSize::KIB_64);
        assert_eq!(config.submission_reserve.as_bytes(), 64);
        assert_eq!(config.cs_overfetch_size, ByteSize::KIB_4);
    }

    #[test]
    fn test_parse_dispatch_mode() {
        assert_eq!(DispatchMode::parse("Batched"), Some(DispatchMode::Batched));
        assert_eq!(DispatchMode::parse(" immediate "), Some(DispatchMode::Immediate));
        assert_eq!(DispatchMode::parse("eventually"), None);
    }
}
