//! The carveout heap: contiguous ranges from one reserved region.

use crate::error::{Error, Result};
use crate::flags::{page_align, BufferFlags, HeapFlags, PAGE_SIZE};
use crate::heap::{Allocation, DescriptorTable, Extent, Heap, MappedRange};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Mutex;

/// Backend state for one carveout allocation: a page range inside the
/// region.
struct CarveoutAllocation {
    page_offset: usize,
    page_count: usize,
}

/// A heap that carves physically contiguous allocations out of one
/// pre-reserved region.
///
/// Every allocation is a single contiguous run of pages, so the heap
/// supports [`phys`](Heap::phys) and single-extent descriptor tables. A
/// first-fit page bitmap tracks the region; exhaustion means no free run is
/// large enough, even if enough total pages are free.
pub struct CarveoutHeap {
    id: u32,
    name: String,
    flags: HeapFlags,
    priority: Option<u32>,
    base: NonNull<u8>,
    layout: Layout,
    /// One entry per page; true = in use. First-fit allocation.
    pages: Mutex<Vec<bool>>,
}

// The region pointer is owned by the heap; page ownership is handed out
// through the bitmap.
unsafe impl Send for CarveoutHeap {}
unsafe impl Sync for CarveoutHeap {}

impl CarveoutHeap {
    /// Reserve a region of `capacity` bytes (rounded up to page
    /// granularity) and create the heap over it.
    pub fn new(id: u32, name: &str, capacity: usize) -> Result<Self> {
        let capacity = page_align(capacity.max(1));
        let layout = Layout::from_size_align(capacity, PAGE_SIZE)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or_else(|| {
            Error::Exhausted(format!("carveout {name}: cannot reserve {capacity} bytes"))
        })?;

        Ok(Self {
            id,
            name: name.to_owned(),
            flags: HeapFlags::empty(),
            priority: None,
            base,
            layout,
            pages: Mutex::new(vec![false; capacity / PAGE_SIZE]),
        })
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

    /// Total size of the reserved region in bytes.
    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes currently allocated from the region.
    pub fn bytes_in_use(&self) -> usize {
        self.pages.lock().unwrap().iter().filter(|&&p| p).count() * PAGE_SIZE
    }

    fn page_addr(&self, page_offset: usize) -> u64 {
        self.base.as_ptr() as u64 + (page_offset * PAGE_SIZE) as u64
    }

    fn range_state<'a>(&self, allocation: &'a Allocation) -> &'a CarveoutAllocation {
        allocation
            .state::<CarveoutAllocation>()
            .expect("foreign allocation passed to carveout heap")
    }

    /// First-fit search for `count` free pages whose start satisfies
    /// `align_pages`.
    fn find_run(pages: &[bool], count: usize, align_pages: usize) -> Option<usize> {
        let mut start = 0;
        while start + count <= pages.len() {
            if start % align_pages != 0 {
                start += align_pages - start % align_pages;
                continue;
            }
            match pages[start..start + count].iter().position(|&used| used) {
                None => return Some(start),
                Some(used_at) => start += used_at + 1,
            }
        }
        None
    }
}

impl Drop for CarveoutHeap {
    fn drop(&mut self) {
        let leaked = self.bytes_in_use();
        if leaked != 0 {
            tracing::warn!(
                heap = self.name,
                bytes = leaked,
                "carveout region dropped with live allocations"
            );
        }
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl Heap for CarveoutHeap {
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
        let align_pages = (align.max(PAGE_SIZE)) / PAGE_SIZE;
        // Reservations are page-granular; a short length must still claim
        // the page it occupies.
        let len = page_align(len);
        if len == 0 {
            return Err(Error::InvalidArgument("zero-length allocation".into()));
        }
        let page_count = len / PAGE_SIZE;

        let page_offset = {
            let mut pages = self.pages.lock().unwrap();
            let offset = Self::find_run(&pages, page_count, align_pages).ok_or_else(|| {
                Error::Exhausted(format!(
                    "carveout {}: no free run of {page_count} pages",
                    self.name
                ))
            })?;
            pages[offset..offset + page_count].fill(true);
            offset
        };

        // The range may hold stale data from a previous owner.
        if !flags.contains(BufferFlags::NOZEROED) {
            unsafe {
                std::ptr::write_bytes(
                    self.base.as_ptr().add(page_offset * PAGE_SIZE),
                    0,
                    page_count * PAGE_SIZE,
                );
            }
        }

        Ok(Allocation::new(
            len,
            CarveoutAllocation {
                page_offset,
                page_count,
            },
        ))
    }

    fn free(&self, allocation: Allocation) {
        let state = allocation
            .into_state::<CarveoutAllocation>()
            .expect("foreign allocation freed to carveout heap");
        let mut pages = self.pages.lock().unwrap();
        pages[state.page_offset..state.page_offset + state.page_count].fill(false);
    }

    fn map_dma(&self, allocation: &Allocation) -> Result<DescriptorTable> {
        let state = self.range_state(allocation);
        let mut table = DescriptorTable::new();
        table.push(Extent {
            addr: self.page_addr(state.page_offset),
            len: state.page_count * PAGE_SIZE,
        });
        Ok(table)
    }

    fn map_kernel(&self, allocation: &Allocation) -> Result<MappedRange> {
        let state = self.range_state(allocation);
        let addr = unsafe { self.base.as_ptr().add(state.page_offset * PAGE_SIZE) };
        // Non-null because base is non-null and the offset is in range.
        Ok(MappedRange::new(
            NonNull::new(addr).expect("offset pointer into live region"),
            allocation.len(),
        ))
    }

    fn map_user(&self, _allocation: &Allocation, _offset: usize, _len: usize) -> Result<()> {
        Ok(())
    }

    fn phys(&self, allocation: &Allocation) -> Result<(u64, usize)> {
        let state = self.range_state(allocation);
        Ok((self.page_addr(state.page_offset), allocation.len()))
    }

    fn debug_show(&self) -> Option<String> {
        Some(format!(
            "{}: {} / {} bytes in use",
            self.name,
            self.bytes_in_use(),
            self.capacity()
        ))
    }
}
