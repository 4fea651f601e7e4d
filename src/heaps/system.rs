//! The system heap: paged memory from the host allocator.

use crate::error::{Error, Result};
use crate::flags::{page_align, BufferFlags, HeapFlags, PAGE_SIZE};
use crate::heap::{Allocation, DescriptorTable, Extent, Heap, MappedRange};
use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Backend state for one system-heap allocation.
struct SystemAllocation {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The pointer is owned by the allocation and only dereferenced through
// mappings the caller requests.
unsafe impl Send for SystemAllocation {}
unsafe impl Sync for SystemAllocation {}

/// A heap backed by the host allocator.
///
/// The default configuration is unbounded; [`with_capacity`] puts a byte
/// budget on it, after which allocations fail with [`Error::Exhausted`]
/// until enough memory is freed. [`with_deferred_free`] opts the heap into
/// asynchronous reclamation.
///
/// [`with_capacity`]: Self::with_capacity
/// [`with_deferred_free`]: Self::with_deferred_free
pub struct SystemHeap {
    id: u32,
    name: String,
    flags: HeapFlags,
    priority: Option<u32>,
    capacity: Option<usize>,
    used: Mutex<usize>,
    /// High-water mark, for diagnostics.
    peak: AtomicUsize,
}

impl SystemHeap {
    /// Create an unbounded system heap.
    pub fn new(id: u32, name: &str) -> Self {
        Self {
            id,
            name: name.to_owned(),
            flags: HeapFlags::empty(),
            priority: None,
            capacity: None,
            used: Mutex::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Cap the heap at `bytes` of live allocations.
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Reclaim freed buffers asynchronously.
    pub fn with_deferred_free(mut self) -> Self {
        self.flags |= HeapFlags::DEFER_FREE;
        self
    }

    /// Override the allocation priority (default: the heap id).
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Bytes currently allocated from this heap.
    pub fn bytes_in_use(&self) -> usize {
        *self.used.lock().unwrap()
    }

    fn reserve(&self, len: usize) -> Result<()> {
        let mut used = self.used.lock().unwrap();
        if let Some(capacity) = self.capacity {
            if capacity.saturating_sub(*used) < len {
                return Err(Error::Exhausted(format!(
                    "heap {}: {} of {} bytes in use, {} requested",
                    self.name, *used, capacity, len
                )));
            }
        }
        *used += len;
        self.peak.fetch_max(*used, Ordering::Relaxed);
        Ok(())
    }
}

impl Heap for SystemHeap {
    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn flags(&self) -> HeapFlags {
        self.flags
    }

    fn priority(&self) -> u32 {
        self.priority.unwrap_or(self.id)
    }

    fn allocate(&self, len: usize, align: usize, flags: BufferFlags) -> Result<Allocation> {
        let align = if align == 0 { PAGE_SIZE } else { align };
        if !align.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "alignment {align} is not a power of two"
            )));
        }
        let align = align.max(PAGE_SIZE);
        let len = page_align(len);
        if len == 0 {
            return Err(Error::InvalidArgument("zero-length allocation".into()));
        }

        self.reserve(len)?;

        let layout = Layout::from_size_align(len, align)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        // Fresh memory is handed out zeroed unless the caller waived it.
        let raw = if flags.contains(BufferFlags::NOZEROED) {
            unsafe { alloc(layout) }
        } else {
            unsafe { alloc_zeroed(layout) }
        };
        let Some(ptr) = NonNull::new(raw) else {
            *self.used.lock().unwrap() -= len;
            return Err(Error::Exhausted(format!(
                "heap {}: host allocator refused {len} bytes",
                self.name
            )));
        };

        Ok(Allocation::new(len, SystemAllocation { ptr, layout }))
    }

    fn free(&self, allocation: Allocation) {
        let len = allocation.len();
        let state = allocation
            .into_state::<SystemAllocation>()
            .expect("foreign allocation freed to system heap");
        unsafe { dealloc(state.ptr.as_ptr(), state.layout) };
        *self.used.lock().unwrap() -= len;
    }

    fn map_dma(&self, allocation: &Allocation) -> Result<DescriptorTable> {
        let state = allocation
            .state::<SystemAllocation>()
            .expect("foreign allocation mapped through system heap");
        let mut table = DescriptorTable::new();
        table.push(Extent {
            addr: state.ptr.as_ptr() as u64,
            len: allocation.len(),
        });
        Ok(table)
    }

    fn map_kernel(&self, allocation: &Allocation) -> Result<MappedRange> {
        let state = allocation
            .state::<SystemAllocation>()
            .expect("foreign allocation mapped through system heap");
        Ok(MappedRange::new(state.ptr, allocation.len()))
    }

    fn map_user(&self, _allocation: &Allocation, _offset: usize, _len: usize) -> Result<()> {
        // Host memory is directly mappable; there is nothing to install.
        Ok(())
    }

    fn debug_show(&self) -> Option<String> {
        let used = *self.used.lock().unwrap();
        let peak = self.peak.load(Ordering::Relaxed);
        Some(match self.capacity {
            Some(capacity) => format!(
                "{}: {used} / {capacity} bytes in use, peak {peak}",
                self.name
            ),
            None => format!("{}: {used} bytes in use, peak {peak}", self.name),
        })
    }
}
