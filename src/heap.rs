//! The abstract heap backend interface.
//!
//! A [`Heap`] is a pluggable allocator for one class of memory (paged,
//! physically contiguous, carved-out region, ...). The core never touches
//! backend memory directly: it asks the heap for an [`Allocation`], a
//! [`DescriptorTable`] describing its extents, and optional kernel/user
//! mappings. Multiple heaps register with a
//! [`Device`](crate::device::Device) and are tried in descending priority
//! order during allocation.
//!
//! Heaps flagged [`HeapFlags::DEFER_FREE`](crate::flags::HeapFlags) get a
//! [`DeferredFreeQueue`]: buffers whose last reference drops are pushed to
//! the queue and reclaimed by a background worker (or by an on-demand drain
//! when an allocation on the same heap runs out of memory).

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::flags::{BufferFlags, HeapFlags, PAGE_SIZE};
use std::any::Any;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Direction of a DMA transfer, from the CPU's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataDirection {
    /// CPU produced the data, a device will read it.
    ToDevice,
    /// A device produced the data, the CPU will read it.
    FromDevice,
    /// Both directions.
    Bidirectional,
}

/// One physically-backed run of memory inside a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    /// Backing address of the run. For host-memory heaps this is the
    /// kernel-visible address doubling as the DMA address.
    pub addr: u64,
    /// Length of the run in bytes. Always a multiple of the page size.
    pub len: usize,
}

/// The backend-provided description of a buffer's backing extents.
///
/// This is the scatter/descriptor table external device mappers consume.
#[derive(Clone, Debug, Default)]
pub struct DescriptorTable {
    extents: Vec<Extent>,
}

impl DescriptorTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an extent to the table.
    pub fn push(&mut self, extent: Extent) {
        self.extents.push(extent);
    }

    /// The extents in backing order.
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Total number of bytes described.
    pub fn total_len(&self) -> usize {
        self.extents.iter().map(|e| e.len).sum()
    }

    /// Number of pages described.
    pub fn page_count(&self) -> usize {
        self.total_len() / PAGE_SIZE
    }

    /// Iterate the page addresses of every page in the table, in order.
    pub fn pages(&self) -> impl Iterator<Item = u64> + '_ {
        self.extents
            .iter()
            .flat_map(|e| (0..e.len / PAGE_SIZE).map(move |i| e.addr + (i * PAGE_SIZE) as u64))
    }
}

/// A cached kernel-side mapping of a buffer.
#[derive(Clone, Copy, Debug)]
pub struct MappedRange {
    addr: NonNull<u8>,
    len: usize,
}

impl MappedRange {
    /// Wrap a mapped address range.
    pub fn new(addr: NonNull<u8>, len: usize) -> Self {
        Self { addr, len }
    }

    /// Start of the mapping.
    pub fn addr(&self) -> NonNull<u8> {
        self.addr
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// The mapping is only a (address, length) pair; accessing the memory behind
// it is the caller's unsafe business.
unsafe impl Send for MappedRange {}
unsafe impl Sync for MappedRange {}

/// Heap-private allocation state, owned by a buffer for its lifetime.
///
/// The core treats the state as opaque; the owning heap downcasts it back
/// in `free`/`map_dma`/`map_kernel`.
pub struct Allocation {
    len: usize,
    state: Box<dyn Any + Send + Sync>,
}

impl Allocation {
    /// Create an allocation of `len` bytes with backend-private `state`.
    pub fn new(len: usize, state: impl Any + Send + Sync) -> Self {
        Self {
            len,
            state: Box::new(state),
        }
    }

    /// Length of the allocation in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the allocation is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the backend state, if it is of type `T`.
    pub fn state<T: Any>(&self) -> Option<&T> {
        self.state.downcast_ref::<T>()
    }

    /// Consume the allocation and recover the backend state.
    pub fn into_state<T: Any>(self) -> Option<Box<T>> {
        self.state.downcast::<T>().ok()
    }
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation").field("len", &self.len).finish()
    }
}

/// A pluggable memory backend.
///
/// Required operations are `allocate`, `free` and `map_dma`; everything
/// else is an optional capability that defaults to
/// [`Error::NotSupported`] or a no-op.
///
/// The heap is responsible for its own internal serialization: the device
/// only holds its heap-list lock for reading during allocation, so
/// `allocate` may be called concurrently from many threads.
pub trait Heap: Send + Sync {
    /// Heap id, also the bit position selecting this heap in an allocation
    /// heap mask. Must be below 32 and unique per device.
    fn id(&self) -> u32;

    /// Human-readable name, used in diagnostics.
    fn name(&self) -> &str;

    /// Behavior flags.
    fn flags(&self) -> HeapFlags {
        HeapFlags::empty()
    }

    /// Allocation priority. Heaps are tried in descending priority order;
    /// by default higher-id heaps are tried first.
    fn priority(&self) -> u32 {
        self.id()
    }

    /// Allocate `len` bytes aligned to `align`.
    fn allocate(&self, len: usize, align: usize, flags: BufferFlags) -> Result<Allocation>;

    /// Release an allocation back to the heap.
    fn free(&self, allocation: Allocation);

    /// Build the descriptor table for an allocation.
    fn map_dma(&self, allocation: &Allocation) -> Result<DescriptorTable>;

    /// Tear down DMA state for an allocation. Called exactly once, right
    /// before `free`.
    fn unmap_dma(&self, _allocation: &Allocation) {}

    /// Map the allocation into the kernel address space.
    fn map_kernel(&self, _allocation: &Allocation) -> Result<MappedRange> {
        Err(Error::NotSupported("map_kernel"))
    }

    /// Undo `map_kernel`.
    fn unmap_kernel(&self, _allocation: &Allocation) {}

    /// Eagerly install a user mapping covering `[offset, offset + len)`.
    fn map_user(&self, _allocation: &Allocation, _offset: usize, _len: usize) -> Result<()> {
        Err(Error::NotSupported("map_user"))
    }

    /// Physical base address and length, for physically contiguous heaps.
    fn phys(&self, _allocation: &Allocation) -> Result<(u64, usize)> {
        Err(Error::NotSupported("phys"))
    }

    /// Extra backend-specific diagnostic text.
    fn debug_show(&self) -> Option<String> {
        None
    }
}

struct QueueState {
    queue: VecDeque<Arc<Buffer>>,
    /// Buffers popped for reclamation but not yet freed back to the heap.
    in_flight: usize,
    shutdown: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    /// Wakes the worker: work queued or shutdown requested.
    work: Condvar,
    /// Wakes drainers: an in-flight reclamation completed.
    reclaimed: Condvar,
    bytes: AtomicUsize,
}

impl QueueInner {
    /// Destroy a popped buffer and retire its accounting. The byte count
    /// drops only after the backend free completes, so queued pressure
    /// stays visible until the memory is actually allocatable again.
    fn reclaim(&self, buffer: Arc<Buffer>) {
        let size = buffer.size();
        buffer.destroy();
        drop(buffer);
        self.bytes.fetch_sub(size, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        drop(state);
        self.reclaimed.notify_all();
    }

    /// Reclaim until the queue is empty and nothing is mid-reclamation.
    fn drain(&self) -> usize {
        let mut reclaimed = 0;
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(buffer) = state.queue.pop_front() {
                state.in_flight += 1;
                drop(state);
                self.reclaim(buffer);
                reclaimed += 1;
                state = self.state.lock().unwrap();
            } else if state.in_flight > 0 {
                // The worker holds a buffer it has not freed yet; its
                // memory is not allocatable until that free completes.
                state = self.reclaimed.wait(state).unwrap();
            } else {
                return reclaimed;
            }
        }
    }
}

/// A buffer's route into its heap's reclamation queue.
///
/// Cheap to clone and safe to hold past queue shutdown: it references the
/// shared queue state but never the worker thread.
#[derive(Clone)]
pub(crate) struct DeferredFreeHandle {
    inner: Arc<QueueInner>,
}

impl DeferredFreeHandle {
    /// Queue a buffer for asynchronous reclamation. After the queue has
    /// shut down the buffer is reclaimed inline instead.
    pub(crate) fn enqueue(&self, buffer: Arc<Buffer>) {
        let mut state = self.inner.state.lock().unwrap();
        if state.shutdown {
            drop(state);
            buffer.destroy();
            return;
        }
        self.inner.bytes.fetch_add(buffer.size(), Ordering::Relaxed);
        state.queue.push_back(buffer);
        drop(state);
        self.inner.work.notify_one();
    }

    /// Reclaim every pending buffer now, on the calling thread.
    pub(crate) fn drain(&self) -> usize {
        self.inner.drain()
    }
}

/// Asynchronous reclamation queue for one deferred-free heap.
///
/// Buffers land here when their last reference drops. A dedicated worker
/// thread drains the queue in the background; [`drain`](Self::drain)
/// reclaims everything synchronously and is used by the allocation path as
/// a retry-under-pressure step.
pub struct DeferredFreeQueue {
    inner: Arc<QueueInner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DeferredFreeQueue {
    /// Start the queue and its worker thread.
    pub(crate) fn start(heap_name: &str) -> Self {
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                in_flight: 0,
                shutdown: false,
            }),
            work: Condvar::new(),
            reclaimed: Condvar::new(),
            bytes: AtomicUsize::new(0),
        });

        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name(format!("{heap_name}-deferred-free"))
            .spawn(move || worker_loop(worker_inner))
            .expect("failed to spawn deferred-free worker");

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// The enqueue/drain handle buffers keep for their lifetime.
    pub(crate) fn handle(&self) -> DeferredFreeHandle {
        DeferredFreeHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Reclaim every pending buffer now, on the calling thread.
    ///
    /// Returns the number of buffers reclaimed by this call. When it
    /// returns, every buffer queued before the call has been freed back to
    /// its heap and its memory is allocatable again, including buffers the
    /// worker had already picked up.
    pub fn drain(&self) -> usize {
        self.inner.drain()
    }

    /// Bytes awaiting reclamation, in-flight reclamations included.
    pub fn queued_bytes(&self) -> usize {
        self.inner.bytes.load(Ordering::Relaxed)
    }
}

impl Drop for DeferredFreeQueue {
    fn drop(&mut self) {
        self.inner.state.lock().unwrap().shutdown = true;
        self.inner.work.notify_all();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
        // Anything the worker had not picked up yet.
        self.inner.drain();
    }
}

fn worker_loop(inner: Arc<QueueInner>) {
    loop {
        let buffer = {
            let mut state = inner.state.lock().unwrap();
            loop {
                if let Some(buffer) = state.queue.pop_front() {
                    state.in_flight += 1;
                    break Some(buffer);
                }
                if state.shutdown {
                    break None;
                }
                state = inner.work.wait(state).unwrap();
            }
        };

        match buffer {
            Some(buffer) => {
                tracing::trace!(buffer = %buffer.id(), "deferred-free worker reclaiming buffer");
                inner.reclaim(buffer);
            }
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_table_pages() {
        let mut table = DescriptorTable::new();
        table.push(Extent {
            addr: 0x1000,
            len: 2 * PAGE_SIZE,
        });
        table.push(Extent {
            addr: 0x10000,
            len: PAGE_SIZE,
        });

        assert_eq!(table.total_len(), 3 * PAGE_SIZE);
        assert_eq!(table.page_count(), 3);

        let pages: Vec<u64> = table.pages().collect();
        assert_eq!(pages, vec![0x1000, 0x1000 + PAGE_SIZE as u64, 0x10000]);
    }

    #[test]
    fn test_allocation_state_roundtrip() {
        struct FakeState(u32);

        let allocation = Allocation::new(PAGE_SIZE, FakeState(7));
        assert_eq!(allocation.len(), PAGE_SIZE);
        assert_eq!(allocation.state::<FakeState>().unwrap().0, 7);
        assert!(allocation.state::<String>().is_none());

        let state = allocation.into_state::<FakeState>().unwrap();
        assert_eq!(state.0, 7);
    }
}
