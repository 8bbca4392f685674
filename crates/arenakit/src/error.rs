//! Error types for arenakit
//!
//! Only resource exhaustion and bad construction parameters are recoverable.
//! Contract violations (double free, stale handles, LIFO breaks) never show up
//! here; they go through [`crate::assert`] instead.

use std::io;
use std::sync::Arc;

use thiserror::Error;

#[cfg(feature = "logging")]
use tracing::{error, warn};

// ============================================================================
// Recoverable Allocation Errors
// ============================================================================

/// Why a `try_*` allocator call or a constructor gave up
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum MemoryError {
    // --- Request Errors ---
    #[error("allocator could not provide {size} bytes aligned to {align}")]
    AllocationFailed { size: usize, align: usize },

    #[error("layout rejected: {reason}")]
    InvalidLayout { reason: String },

    #[error("size arithmetic overflowed in {operation}")]
    SizeOverflow { operation: String },

    #[error("alignment {alignment} is not a power of two")]
    InvalidAlignment { alignment: usize },

    #[error("request of {size} bytes is larger than the {max_size} byte limit")]
    ExceedsMaxSize { size: usize, max_size: usize },

    // --- Capacity Errors ---
    #[error("pool '{pool_id}' has no free block ({capacity} blocks in total)")]
    PoolExhausted { pool_id: String, capacity: usize },

    #[error("arena '{arena_id}' cannot fit {requested} bytes ({available} left)")]
    ArenaExhausted {
        arena_id: String,
        requested: usize,
        available: usize,
    },

    // --- Setup Errors ---
    #[error("bad allocator configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("virtual memory call '{operation}' failed: {source}")]
    Platform {
        operation: &'static str,
        #[source]
        source: Arc<io::Error>,
    },
}

impl MemoryError {
    /// True when freeing memory elsewhere may let the same request succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted { .. } | Self::ArenaExhausted { .. } | Self::AllocationFailed { .. }
        )
    }

    /// Stable `MEM:<area>:<kind>` code for logs and metrics
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AllocationFailed { .. } => "MEM:ALLOC:FAILED",
            Self::InvalidLayout { .. } => "MEM:ALLOC:LAYOUT",
            Self::SizeOverflow { .. } => "MEM:ALLOC:OVERFLOW",
            Self::InvalidAlignment { .. } => "MEM:ALLOC:ALIGN",
            Self::ExceedsMaxSize { .. } => "MEM:ALLOC:MAX",
            Self::PoolExhausted { .. } => "MEM:POOL:EXHAUSTED",
            Self::InvalidConfig { .. } => "MEM:CONFIG:INVALID",
            Self::ArenaExhausted { .. } => "MEM:ARENA:EXHAUSTED",
            Self::Platform { .. } => "MEM:SYSTEM:PLATFORM",
        }
    }

    // --- Constructors ---

    /// The allocator itself refused the request
    pub fn allocation_failed(size: usize, align: usize) -> Self {
        Self::AllocationFailed { size, align }
    }

    /// `size`/`align` do not form a valid layout
    pub fn invalid_layout(reason: &str) -> Self {
        Self::InvalidLayout {
            reason: reason.to_string(),
        }
    }

    /// Size computation for `operation` overflowed
    pub fn size_overflow(operation: &str) -> Self {
        Self::SizeOverflow {
            operation: operation.to_string(),
        }
    }

    /// `alignment` is zero or not a power of two
    pub fn invalid_alignment(alignment: usize) -> Self {
        Self::InvalidAlignment { alignment }
    }

    /// Request above a fixed per-allocation limit
    pub fn allocation_too_large(size: usize, max_size: usize) -> Self {
        Self::ExceedsMaxSize { size, max_size }
    }

    /// Every block of the pool is handed out
    pub fn pool_exhausted(pool_id: &str, capacity: usize) -> Self {
        #[cfg(feature = "logging")]
        warn!(pool = pool_id, capacity, "memory pool exhausted");

        Self::PoolExhausted {
            pool_id: pool_id.to_string(),
            capacity,
        }
    }

    /// Construction parameters rejected
    pub fn invalid_config(reason: &str) -> Self {
        Self::InvalidConfig {
            reason: reason.to_string(),
        }
    }

    /// Arena or ring has no room left for `requested` bytes
    pub fn arena_exhausted(arena_id: &str, requested: usize, available: usize) -> Self {
        Self::ArenaExhausted {
            arena_id: arena_id.to_string(),
            requested,
            available,
        }
    }

    /// Wrap a failed OS call
    pub fn platform(operation: &'static str, source: io::Error) -> Self {
        #[cfg(feature = "logging")]
        error!(operation, %source, "platform memory call failed");

        Self::Platform {
            operation,
            source: Arc::new(source),
        }
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Result type for memory operations
pub type MemoryResult<T> = core::result::Result<T, MemoryError>;

/// Generic result type alias
pub type Result<T> = MemoryResult<T>;

/// Allocator-facing names for the same types
pub type AllocError = MemoryError;
pub type AllocResult<T> = MemoryResult<T>;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_error_creation() {
        let error = MemoryError::allocation_failed(1024, 8);
        assert!(error.to_string().contains("1024"));
        assert_eq!(error.code(), "MEM:ALLOC:FAILED");
    }

    #[test]
    fn test_exhaustion_is_retryable() {
        assert!(MemoryError::pool_exhausted("blocks", 16).is_retryable());
        assert!(MemoryError::arena_exhausted("ring", 64, 0).is_retryable());
        assert!(!MemoryError::invalid_alignment(3).is_retryable());
        assert!(!MemoryError::invalid_config("chunk size").is_retryable());
    }

    #[test]
    fn test_platform_error_keeps_source() {
        let error = MemoryError::platform("mmap", io::Error::from(io::ErrorKind::OutOfMemory));
        assert_eq!(error.code(), "MEM:SYSTEM:PLATFORM");
        assert!(std::error::Error::source(&error).is_some());
        // Clone must not lose the source
        let cloned = error.clone();
        assert!(cloned.to_string().contains("mmap"));
    }

    #[test]
    fn test_codes_are_namespaced() {
        let errors = [
            MemoryError::invalid_layout("zero size"),
            MemoryError::size_overflow("block size calculation"),
            MemoryError::allocation_too_large(128, 64),
        ];
        for error in &errors {
            assert!(error.code().starts_with("MEM:"));
        }
    }
}
