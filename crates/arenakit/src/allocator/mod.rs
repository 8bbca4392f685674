//! Allocator strategies behind one trait
//!
//! Every allocator here implements [`Allocator`] and is used through
//! `&dyn Allocator`:
//!
//! - [`SystemAllocator`]: the process heap, always available
//! - [`LinearAllocator`], [`StackAllocator`]: bump and LIFO arenas over a
//!   caller buffer
//! - [`ScratchAllocator`]: ring of transient blocks with a backing fallback
//! - [`TlsfAllocator`]: O(1) segregated-fit heap over caller pools
//! - [`VirtualLinearAllocator`], [`VirtualStackAllocator`]: arenas that
//!   reserve address space up front and commit it in chunks
//! - [`AtomicLinearAllocator`], [`AtomicPoolAllocator`]: lock-free variants
//! - [`Synced`]: mutex adapter for everything else

// Core allocator types
mod system;
mod traits;

pub(crate) mod free_list;
pub(crate) mod header;

// Allocator implementations
pub mod atomic_linear;
pub mod linear;
pub mod pool;
pub mod scratch;
pub mod stack;
pub mod tlsf;

// Optional modules
#[cfg(feature = "synced")]
pub mod synced;
#[cfg(feature = "virtual")]
pub mod virtual_arena;

// Re-exports for convenience
pub use crate::error::{AllocError, AllocResult};
pub use atomic_linear::AtomicLinearAllocator;
pub use linear::LinearAllocator;
pub use pool::{AtomicPoolAllocator, PoolConfig, PoolStats};
pub use scratch::{ScratchAllocator, ScratchConfig};
pub use stack::StackAllocator;
#[cfg(all(feature = "synced", feature = "virtual"))]
pub use synced::SyncedVirtualLinearAllocator;
#[cfg(feature = "synced")]
pub use synced::{MutexSynced, SpinSynced, Synced, SyncedTlsfAllocator};
pub use system::{SystemAllocator, system_allocator};
pub use tlsf::{HeapUsage, TlsfAllocator};
pub use traits::Allocator;
#[cfg(feature = "virtual")]
pub use virtual_arena::{VirtualConfig, VirtualLinearAllocator, VirtualStackAllocator};
