//! Pool allocator statistics

/// Statistics for [`super::AtomicPoolAllocator`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful allocations
    pub total_allocs: u32,
    /// Frees
    pub total_deallocs: u32,
    /// Highest number of bytes in use at once
    pub peak_usage: usize,
    /// Bytes in use right now
    pub current_usage: usize,
    /// Stride of each block
    pub block_size: usize,
    /// Total number of blocks
    pub block_count: usize,
    /// Currently free blocks
    pub free_blocks: usize,
}

impl PoolStats {
    /// Fraction of blocks in use, between 0 and 1
    pub fn utilization(&self) -> f64 {
        if self.block_count == 0 {
            return 0.0;
        }
        self.block_count.saturating_sub(self.free_blocks) as f64 / self.block_count as f64
    }
}
