//! Lock-free fixed-block pool
//!
//! Blocks of one size are handed out from a versioned free list, so
//! allocate and free are a single CAS each under contention.
//!
//! ## Modules
//! - `allocator` - [`AtomicPoolAllocator`] itself
//! - `config` - Configuration presets (production, debug, performance)
//! - `stats` - Statistics snapshot

pub mod allocator;
pub mod config;
pub mod stats;

pub use allocator::AtomicPoolAllocator;
pub use config::PoolConfig;
pub use stats::PoolStats;
