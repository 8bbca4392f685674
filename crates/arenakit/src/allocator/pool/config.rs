//! Pool allocator configuration

/// Configuration for [`super::AtomicPoolAllocator`]
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Enable statistics tracking
    pub track_stats: bool,

    /// Fill patterns for debugging
    pub alloc_pattern: Option<u8>,
    pub dealloc_pattern: Option<u8>,

    /// Use exponential backoff between failed CAS attempts
    pub use_backoff: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            track_stats: cfg!(debug_assertions),
            alloc_pattern: if cfg!(debug_assertions) { Some(0xBB) } else { None },
            dealloc_pattern: if cfg!(debug_assertions) { Some(0xDD) } else { None },
            use_backoff: true,
        }
    }
}

impl PoolConfig {
    /// Production configuration - no fill patterns, no counters
    pub fn production() -> Self {
        Self {
            track_stats: false,
            alloc_pattern: None,
            dealloc_pattern: None,
            use_backoff: true,
        }
    }

    /// Debug configuration - fill patterns and counters on
    pub fn debug() -> Self {
        Self {
            track_stats: true,
            alloc_pattern: Some(0xBB),
            dealloc_pattern: Some(0xDD),
            use_backoff: false,
        }
    }

    /// Performance configuration - like production, without backoff, for
    /// pools with little contention
    pub fn performance() -> Self {
        Self {
            track_stats: false,
            alloc_pattern: None,
            dealloc_pattern: None,
            use_backoff: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let debug = PoolConfig::debug();
        assert!(debug.track_stats);
        assert_eq!(debug.alloc_pattern, Some(0xBB));
        assert_eq!(debug.dealloc_pattern, Some(0xDD));

        let production = PoolConfig::production();
        assert!(!production.track_stats);
        assert!(production.alloc_pattern.is_none());
        assert!(production.use_backoff);

        assert!(!PoolConfig::performance().use_backoff);
    }
}
