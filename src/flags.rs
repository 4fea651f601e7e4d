//! Allocation flags and page-granularity helpers.

use bitflags::bitflags;

/// Granularity of all buffer allocations, in bytes.
///
/// Every requested length is rounded up to a multiple of this before it
/// reaches a heap backend.
pub const PAGE_SIZE: usize = 4096;

/// Round `len` up to the next multiple of [`PAGE_SIZE`].
pub fn page_align(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

bitflags! {
    /// Per-buffer allocation flags.
    ///
    /// These are fixed at allocation time and never change for the lifetime
    /// of the buffer.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct BufferFlags: u32 {
        /// The buffer is mapped cacheable on the CPU side.
        const CACHED = 1 << 0;
        /// The caller takes responsibility for explicit sync; user mappings
        /// are installed eagerly instead of on fault.
        const CACHED_NEEDS_SYNC = 1 << 1;
        /// The backend skipped zeroing the memory. Such buffers must never
        /// be handed out to untrusted user mappings.
        const NOZEROED = 1 << 2;
    }
}

bitflags! {
    /// Per-heap behavior flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct HeapFlags: u32 {
        /// Freeing through this heap is expensive; buffers are reclaimed
        /// asynchronously by a deferred-free worker instead of inline.
        const DEFER_FREE = 1 << 0;
    }
}

impl BufferFlags {
    /// Whether the buffer is CPU-cacheable.
    pub fn cached(&self) -> bool {
        self.contains(BufferFlags::CACHED)
    }

    /// Whether user mappings of this buffer are populated lazily on page
    /// fault rather than eagerly at map time.
    ///
    /// Cached buffers without explicit caller-managed sync get fault-driven
    /// mappings so dirty pages can be tracked per page.
    pub fn fault_user_mappings(&self) -> bool {
        self.contains(BufferFlags::CACHED) && !self.contains(BufferFlags::CACHED_NEEDS_SYNC)
    }
}
