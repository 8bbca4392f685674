//! Handle-based object pool
//!
//! [`AtomicLinkedPool`] hands out pointer-stable slots through 32-bit
//! [`Handle`]s instead of references. With generation checks on (the
//! default) each handle also records the slot's generation, so a handle
//! kept after its slot was released is detected instead of silently
//! aliasing the next occupant.
//!
//! ```
//! use arenakit::linked_pool::AtomicLinkedPool;
//!
//! let pool: AtomicLinkedPool<'_, u32> = AtomicLinkedPool::new(8).unwrap();
//! let h = pool.acquire_with(7);
//! assert!(pool.is_alive(h));
//! pool.release(h);
//! assert!(!pool.is_alive(h));
//! ```

mod handle;
mod pool;

pub use handle::Handle;
pub use pool::AtomicLinkedPool;
