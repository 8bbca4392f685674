//! Allocator toolkit for engines and long-running services
//!
//! This crate provides a family of allocation strategies behind one
//! object-safe [`Allocator`] trait, including:
//!
//! - Linear and stack arenas over caller-provided buffers
//! - A ring-buffer scratch allocator that falls back to a backing allocator
//! - A TLSF (two-level segregated fit) heap with O(1) alloc and free
//! - Arenas that reserve virtual address space and commit it on demand
//! - Lock-free bump and block-pool allocators
//! - A lock-free, handle-based object pool with generation checks
//!
//! Allocation failures come in two flavours. `try_*` operations return an
//! [`AllocError`] the caller can act on. Contract violations (double frees,
//! stale handles, frees out of stack order) and the non-`try` operations
//! failing go through the [`assert`] module's fatal handler, which aborts by
//! default and can be swapped per thread.
//!
//! # Features
//!
//! - `virtual` (default): virtual-memory layer and growing arenas
//! - `synced` (default): mutex adapters (`parking_lot`, `spin`)
//! - `logging` (default): `tracing` events on lifecycle and fallback paths
//!
//! # Example
//!
//! ```
//! use arenakit::prelude::*;
//!
//! let mut buffer = [0u8; 1024];
//! let arena = LinearAllocator::new(&mut buffer);
//! let allocator: &dyn Allocator = &arena;
//!
//! let ptr = allocator.alloc(64, 16);
//! assert_eq!(ptr.as_ptr() as usize % 16, 0);
//! assert!(allocator.try_alloc(4096, 8).is_err());
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(unsafe_code)]

// Core modules
pub mod assert;
pub mod error;
pub mod utils;

// Allocators
pub mod allocator;
pub mod linked_pool;

#[cfg(feature = "virtual")]
pub mod platform;

// Re-export common types for convenience
pub use allocator::{AllocError, AllocResult, Allocator, system_allocator};
pub use error::{MemoryError, MemoryResult, Result};
pub use linked_pool::{AtomicLinkedPool, Handle};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything needed to pick and use an allocator
pub mod prelude {
    pub use crate::allocator::{
        AtomicLinearAllocator, AtomicPoolAllocator, LinearAllocator, PoolConfig, ScratchAllocator,
        ScratchConfig, StackAllocator, SystemAllocator, TlsfAllocator,
    };
    #[cfg(feature = "synced")]
    pub use crate::allocator::{MutexSynced, SpinSynced, SyncedTlsfAllocator};
    #[cfg(feature = "virtual")]
    pub use crate::allocator::{VirtualConfig, VirtualLinearAllocator, VirtualStackAllocator};
    pub use crate::error::{AllocError, AllocResult, MemoryError, MemoryResult};
    pub use crate::linked_pool::{AtomicLinkedPool, Handle};
    pub use crate::{Allocator, system_allocator};
}
