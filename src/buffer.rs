//! Buffers: refcounted, heap-backed memory regions.
//!
//! A [`Buffer`] is the unit of actual allocation. It is bound to exactly
//! one heap for its lifetime, carries an explicit atomic reference count,
//! and tracks everything that can be layered on top of the raw allocation:
//! the cached kernel mapping, the number of handles referencing it,
//! cross-device address mappings, and user-mapping records with per-page
//! dirty state for fault-driven mappings.
//!
//! # Reference counting
//!
//! The reference count is the sole authority on lifetime. A buffer is
//! created with one reference (owned by the allocation path), each handle
//! referencing it holds one more, and each share token holds one more.
//! When the count reaches zero the buffer is removed from the registry and
//! destroyed — inline, or through the owning heap's deferred-free queue.
//! Releasing more references than were acquired panics: that is corrupted
//! shared state, not a recoverable condition.

use crate::device::HeapEntry;
use crate::error::{Error, Result};
use crate::flags::{BufferFlags, PAGE_SIZE};
use crate::heap::{
    Allocation, DataDirection, DeferredFreeHandle, DescriptorTable, Heap, MappedRange,
};
use crate::registry::BufferRegistry;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Stable identity of a buffer, unique for the lifetime of the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub(crate) u64);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one user-mapping record on a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserMappingId(u64);

/// A device-side address handed out by a [`DeviceMapper`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceAddr(pub u64);

/// External mapping service for one device address space.
///
/// Collaborator trait: the core asks a mapper to translate a buffer's
/// descriptor table into an address usable by that device, and caches the
/// result on the buffer keyed by (mapper identity, region id).
pub trait DeviceMapper: Send + Sync {
    /// Stable identity of the device address space.
    fn id(&self) -> u64;

    /// Human-readable name, used in diagnostics.
    fn name(&self) -> &str;

    /// Map the described extents, returning the device-visible address.
    fn map(
        &self,
        table: &DescriptorTable,
        len: usize,
        direction: DataDirection,
        region: u32,
    ) -> Result<DeviceAddr>;

    /// Unmap a previously mapped address.
    fn unmap(&self, addr: DeviceAddr);
}

/// Task identity recorded for post-orphan diagnostics.
#[derive(Clone, Debug)]
pub struct TaskInfo {
    /// Name of the last thread that held a handle to the buffer.
    pub task: String,
    /// Process id of that task.
    pub pid: u32,
}

impl TaskInfo {
    fn current() -> Self {
        Self {
            task: std::thread::current().name().unwrap_or("<unnamed>").to_owned(),
            pid: std::process::id(),
        }
    }
}

/// One cached cross-device mapping.
pub(crate) struct IovmMapping {
    mapper: Arc<dyn DeviceMapper>,
    mapper_id: u64,
    region: u32,
    addr: DeviceAddr,
    use_count: usize,
}

/// Residency of one page of a fault-mapped buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PageResidency {
    /// Not installed in any user mapping.
    Unmapped,
    /// Installed; `dirty` marks CPU writes not yet visible to devices.
    Resident { dirty: bool },
}

pub(crate) struct PageEntry {
    pub(crate) addr: u64,
    pub(crate) residency: PageResidency,
}

/// One registered user-space mapping of the buffer.
pub(crate) struct UserMapping {
    id: UserMappingId,
    page_offset: usize,
    page_count: usize,
    faulting: bool,
}

/// Mutable buffer state, guarded by the buffer lock.
pub(crate) struct BufferState {
    /// Backend allocation; taken exactly once, at destroy time.
    allocation: Option<Allocation>,
    table: Option<DescriptorTable>,
    /// Number of outstanding kernel-mapping requests across all handles
    /// and CPU-access sessions.
    kmap_count: usize,
    kernel_map: Option<MappedRange>,
    handle_count: usize,
    last_owner: Option<TaskInfo>,
    iovm_maps: SmallVec<[IovmMapping; 2]>,
    user_maps: SmallVec<[UserMapping; 2]>,
    /// Per-page residency, present only for fault-mapped buffers.
    pages: Option<Vec<PageEntry>>,
    next_user_map: u64,
    /// One-shot preparation state: set by the first CPU-visible use.
    ready: bool,
}

/// A refcounted memory region allocated from one heap.
pub struct Buffer {
    id: BufferId,
    size: usize,
    flags: BufferFlags,
    refs: AtomicUsize,
    heap: Arc<dyn Heap>,
    /// Route into the heap's reclamation queue, if the heap defers frees.
    /// Deliberately not the heap entry itself: the last buffer reference
    /// can drop on the reclamation worker, which must never end up owning
    /// its own queue.
    deferred: Option<DeferredFreeHandle>,
    registry: Arc<BufferRegistry>,
    state: Mutex<BufferState>,
}

impl Buffer {
    /// Allocate a buffer from the given heap and register it.
    ///
    /// On backend failure the heap's deferred-free queue (if any) is
    /// drained once and the allocation retried before giving up. The
    /// returned buffer holds one reference, owned by the caller.
    pub(crate) fn create(
        heap_entry: &Arc<HeapEntry>,
        registry: &Arc<BufferRegistry>,
        id: BufferId,
        len: usize,
        align: usize,
        flags: BufferFlags,
    ) -> Result<Arc<Buffer>> {
        let heap = &heap_entry.heap;
        let allocation = match heap.allocate(len, align, flags) {
            Ok(allocation) => allocation,
            Err(err) => {
                let Some(queue) = &heap_entry.deferred else {
                    return Err(err);
                };
                // Only exhaustion can be relieved by reclaiming queued
                // buffers; anything else fails the same way on retry.
                if !matches!(err, Error::Exhausted(_)) {
                    return Err(err);
                }
                tracing::debug!(
                    heap = heap.name(),
                    error = %err,
                    "allocation failed, draining deferred-free queue and retrying"
                );
                queue.drain();
                heap.allocate(len, align, flags)?
            }
        };

        let table = match heap.map_dma(&allocation) {
            Ok(table) => table,
            Err(err) => {
                heap.free(allocation);
                return Err(err);
            }
        };

        // Fault-mapped buffers need a page table for later fault servicing.
        let pages = flags.fault_user_mappings().then(|| {
            table
                .pages()
                .map(|addr| PageEntry {
                    addr,
                    residency: PageResidency::Unmapped,
                })
                .collect()
        });

        let buffer = Arc::new(Buffer {
            id,
            size: len,
            flags,
            refs: AtomicUsize::new(1),
            heap: Arc::clone(heap),
            deferred: heap_entry.deferred.as_ref().map(|q| q.handle()),
            registry: Arc::clone(registry),
            state: Mutex::new(BufferState {
                allocation: Some(allocation),
                table: Some(table),
                kmap_count: 0,
                kernel_map: None,
                handle_count: 0,
                last_owner: None,
                iovm_maps: SmallVec::new(),
                user_maps: SmallVec::new(),
                pages,
                next_user_map: 1,
                ready: false,
            }),
        });

        registry.insert(Arc::clone(&buffer));
        Ok(buffer)
    }

    /// Buffer identity.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Size of the allocation in bytes (page aligned).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocation flags.
    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    /// The owning heap.
    pub fn heap(&self) -> &Arc<dyn Heap> {
        &self.heap
    }

    /// Number of handles currently referencing the buffer.
    pub fn handle_count(&self) -> usize {
        self.state.lock().unwrap().handle_count
    }

    /// Current reference count. Diagnostic only; stale by the time the
    /// caller looks at it.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Relaxed)
    }

    /// Last task that held a handle, recorded when the handle count
    /// dropped to zero.
    pub fn last_owner(&self) -> Option<TaskInfo> {
        self.state.lock().unwrap().last_owner.clone()
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap()
    }

    /// Take one reference.
    pub(crate) fn acquire(&self) {
        let previous = self.refs.fetch_add(1, Ordering::Relaxed);
        assert!(previous > 0, "buffer {} acquired after its last release", self.id);
    }

    /// Drop one reference. At zero the buffer leaves the registry and is
    /// destroyed, inline or through the heap's deferred-free queue.
    pub(crate) fn release(self: &Arc<Self>) {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "buffer {} over-released", self.id);
        if previous != 1 {
            return;
        }

        self.registry.remove(self.id);
        match &self.deferred {
            Some(queue) => queue.enqueue(Arc::clone(self)),
            None => self.destroy(),
        }
    }

    /// Reclaim the backend allocation. Runs exactly once per buffer, after
    /// the last reference is gone, either inline or on the deferred-free
    /// worker.
    pub(crate) fn destroy(&self) {
        let (allocation, iovm_maps) = {
            let mut state = self.state.lock().unwrap();
            assert_eq!(
                state.kmap_count, 0,
                "buffer {} destroyed with {} active kernel mappings",
                self.id, state.kmap_count
            );
            let allocation = state
                .allocation
                .take()
                .unwrap_or_else(|| panic!("buffer {} destroyed twice", self.id));
            state.table = None;
            state.pages = None;
            (allocation, std::mem::take(&mut state.iovm_maps))
        };

        for mapping in iovm_maps {
            mapping.mapper.unmap(mapping.addr);
        }

        let heap = self.heap();
        heap.unmap_dma(&allocation);
        heap.free(allocation);
        tracing::trace!(buffer = %self.id, heap = heap.name(), "buffer destroyed");
    }

    /// Attach the buffer to a new handle.
    pub(crate) fn attach_handle(&self) {
        self.state.lock().unwrap().handle_count += 1;
    }

    /// Detach the buffer from a destroyed handle. When the last handle
    /// goes away the current task is recorded: from here on the buffer
    /// only exists behind share tokens, and the record is the remaining
    /// hint as to who was using it.
    pub(crate) fn detach_handle(&self) {
        let mut state = self.state.lock().unwrap();
        assert!(state.handle_count > 0, "buffer {} handle count underflow", self.id);
        state.handle_count -= 1;
        if state.handle_count == 0 {
            state.last_owner = Some(TaskInfo::current());
        }
    }

    /// One-time preparation pass, run at the first CPU-visible use of the
    /// buffer (mapping, descriptor-table export, physical-address query).
    /// Cache maintenance itself is the backend's concern.
    pub(crate) fn make_ready_locked(&self, state: &mut BufferState) {
        if !state.ready {
            tracing::trace!(buffer = %self.id, "preparing buffer for first use");
            state.ready = true;
        }
    }

    pub(crate) fn mark_ready(&self) {
        self.state.lock().unwrap().ready = true;
    }

    /// Clone the descriptor table for export.
    pub(crate) fn descriptor_table(&self) -> DescriptorTable {
        let mut state = self.state.lock().unwrap();
        self.make_ready_locked(&mut state);
        state.table.clone().expect("live buffer without descriptor table")
    }

    /// Physical address of the buffer, where the heap supports it.
    pub(crate) fn phys(&self) -> Result<(u64, usize)> {
        let mut state = self.state.lock().unwrap();
        self.make_ready_locked(&mut state);
        let allocation = state.allocation.as_ref().expect("live buffer without allocation");
        self.heap().phys(allocation)
    }

    // --- kernel mapping cache -------------------------------------------

    /// Take a kernel-mapping reference. The first request maps through the
    /// heap backend and caches the address; later requests bump the count.
    pub(crate) fn kmap_get_locked(&self, state: &mut BufferState) -> Result<MappedRange> {
        if state.kmap_count > 0 {
            state.kmap_count += 1;
            return Ok(state.kernel_map.expect("kernel mapping cache out of sync"));
        }

        let allocation = state.allocation.as_ref().expect("live buffer without allocation");
        let range = self.heap().map_kernel(allocation)?;
        state.kernel_map = Some(range);
        state.kmap_count = 1;
        self.make_ready_locked(state);
        Ok(range)
    }

    /// The cached kernel mapping. Only valid while `kmap_count > 0`.
    pub(crate) fn cached_kmap_locked(&self, state: &BufferState) -> MappedRange {
        debug_assert!(state.kmap_count > 0);
        state.kernel_map.expect("kernel mapping cache out of sync")
    }

    /// Drop a kernel-mapping reference; the last one unmaps and clears the
    /// cached address.
    pub(crate) fn kmap_put_locked(&self, state: &mut BufferState) {
        assert!(
            state.kmap_count > 0,
            "buffer {} kernel mapping released more times than requested",
            self.id
        );
        state.kmap_count -= 1;
        if state.kmap_count == 0 {
            let allocation = state.allocation.as_ref().expect("live buffer without allocation");
            self.heap().unmap_kernel(allocation);
            state.kernel_map = None;
        }
    }

    /// Take a buffer-level kernel-mapping reference (CPU-access session).
    pub(crate) fn kmap_get(&self) -> Result<MappedRange> {
        let mut state = self.state.lock().unwrap();
        self.kmap_get_locked(&mut state)
    }

    /// Drop a buffer-level kernel-mapping reference.
    pub(crate) fn kmap_put(&self) {
        let mut state = self.state.lock().unwrap();
        self.kmap_put_locked(&mut state);
    }

    /// Active kernel-mapping request count.
    pub fn kmap_count(&self) -> usize {
        self.state.lock().unwrap().kmap_count
    }

    // --- cross-device address mappings ----------------------------------

    /// Map the buffer into an external device address space.
    ///
    /// Mappings are cached per (mapper identity, region id): a repeated
    /// request bumps the entry's use count and returns the cached address.
    pub(crate) fn map_device(
        &self,
        mapper: &Arc<dyn DeviceMapper>,
        direction: DataDirection,
        region: u32,
    ) -> Result<DeviceAddr> {
        let mut state = self.state.lock().unwrap();

        for mapping in state.iovm_maps.iter_mut() {
            if mapping.mapper_id == mapper.id() && mapping.region == region {
                mapping.use_count += 1;
                return Ok(mapping.addr);
            }
        }

        let table = state.table.as_ref().expect("live buffer without descriptor table");
        let addr = mapper.map(table, self.size, direction, region)?;
        state.iovm_maps.push(IovmMapping {
            mapper: Arc::clone(mapper),
            mapper_id: mapper.id(),
            region,
            addr,
            use_count: 1,
        });
        Ok(addr)
    }

    /// Release one use of a cross-device mapping.
    ///
    /// The entry is only use-count-decremented, never torn down here; the
    /// device mapping stays cached until the buffer dies.
    // TODO: decide whether zero-use entries should be evicted eagerly
    // instead of living until buffer destruction.
    pub(crate) fn unmap_device(&self, mapper: &Arc<dyn DeviceMapper>, addr: DeviceAddr) {
        let mut state = self.state.lock().unwrap();

        for mapping in state.iovm_maps.iter_mut() {
            if mapping.mapper_id == mapper.id() && mapping.addr == addr {
                if mapping.use_count == 0 {
                    tracing::warn!(
                        buffer = %self.id,
                        mapper = mapper.name(),
                        "unbalanced cross-device unmap"
                    );
                } else {
                    mapping.use_count -= 1;
                }
                return;
            }
        }

        tracing::warn!(
            buffer = %self.id,
            mapper = mapper.name(),
            addr = addr.0,
            "cross-device unmap of unknown address"
        );
    }

    /// Cached device-mapping use count for (mapper, region). Diagnostic.
    pub fn device_map_use_count(&self, mapper_id: u64, region: u32) -> Option<usize> {
        let state = self.state.lock().unwrap();
        state
            .iovm_maps
            .iter()
            .find(|m| m.mapper_id == mapper_id && m.region == region)
            .map(|m| m.use_count)
    }

    // --- user mappings and fault servicing ------------------------------

    /// Register a user mapping covering `page_count` pages starting at
    /// `page_offset`.
    ///
    /// Fault-mapped buffers record the region and install pages lazily via
    /// [`fault_page`](Self::fault_page); other buffers are mapped eagerly
    /// through the heap's `map_user` capability.
    pub(crate) fn map_user(&self, page_offset: usize, page_count: usize) -> Result<UserMappingId> {
        if self.flags.contains(BufferFlags::NOZEROED) {
            return Err(Error::InvalidArgument(
                "mapping a non-zeroed buffer to user space is prohibited".into(),
            ));
        }
        if page_count == 0 {
            return Err(Error::InvalidArgument("empty user mapping".into()));
        }
        let total_pages = self.size / PAGE_SIZE;
        if page_offset >= total_pages || page_count > total_pages - page_offset {
            return Err(Error::InvalidArgument(format!(
                "user mapping [{page_offset}, +{page_count}) outside buffer of {total_pages} pages"
            )));
        }

        let faulting = self.flags.fault_user_mappings();
        let mut state = self.state.lock().unwrap();
        self.make_ready_locked(&mut state);

        if !faulting {
            let allocation = state.allocation.as_ref().expect("live buffer without allocation");
            self.heap()
                .map_user(allocation, page_offset * PAGE_SIZE, page_count * PAGE_SIZE)?;
        }

        let id = UserMappingId(state.next_user_map);
        state.next_user_map += 1;
        state.user_maps.push(UserMapping {
            id,
            page_offset,
            page_count,
            faulting,
        });
        Ok(id)
    }

    /// Drop a user-mapping record.
    pub(crate) fn unmap_user(&self, id: UserMappingId) {
        let mut state = self.state.lock().unwrap();
        let before = state.user_maps.len();
        state.user_maps.retain(|m| m.id != id);
        if state.user_maps.len() == before {
            tracing::warn!(buffer = %self.id, "unmap of unknown user mapping");
        }
    }

    /// Service a page fault on a fault-driven user mapping.
    ///
    /// Marks the page resident and dirty, and returns its backing address
    /// for the external mapping layer to install.
    pub(crate) fn fault_page(&self, mapping: UserMappingId, index: usize) -> Result<u64> {
        let mut state = self.state.lock().unwrap();

        let record = state
            .user_maps
            .iter()
            .find(|m| m.id == mapping)
            .ok_or_else(|| Error::NotFound("user mapping".into()))?;
        if !record.faulting {
            return Err(Error::InvalidArgument(
                "fault on an eagerly mapped region".into(),
            ));
        }
        if index >= record.page_count {
            return Err(Error::InvalidArgument(format!(
                "fault index {index} outside mapping of {} pages",
                record.page_count
            )));
        }
        let page_index = record.page_offset + index;

        let pages = state.pages.as_mut().expect("fault-mapped buffer without page table");
        let page = &mut pages[page_index];
        page.residency = PageResidency::Resident { dirty: true };
        Ok(page.addr)
    }

    /// Flush CPU writes ahead of device access.
    ///
    /// For fault-mapped buffers this is the per-page pass: dirty pages are
    /// written back and every resident page is unmapped from its region so
    /// the next CPU access faults in a clean page. Returns the number of
    /// pages written back.
    pub(crate) fn sync_for_device(&self, direction: DataDirection) -> usize {
        if !self.flags.cached() {
            return 0;
        }

        let mut state = self.state.lock().unwrap();
        self.make_ready_locked(&mut state);

        let Some(pages) = state.pages.as_mut() else {
            // Whole-buffer writeback is the backend's job; nothing to
            // track at page granularity.
            tracing::trace!(buffer = %self.id, ?direction, "sync for device");
            return 0;
        };

        let mut written = 0;
        for page in pages.iter_mut() {
            if page.residency == (PageResidency::Resident { dirty: true }) {
                written += 1;
            }
            page.residency = PageResidency::Unmapped;
        }
        tracing::trace!(
            buffer = %self.id,
            pages = written,
            "synced dirty pages for device"
        );
        written
    }

    /// Invalidate CPU caches after device writes. No-op for uncached and
    /// fault-mapped buffers; otherwise marks the buffer prepared.
    pub(crate) fn sync_for_cpu(&self, _direction: DataDirection) {
        if !self.flags.cached() || self.flags.fault_user_mappings() {
            return;
        }
        self.mark_ready();
    }

    /// Number of resident pages of a fault-mapped buffer. Diagnostic.
    pub fn resident_pages(&self) -> usize {
        let state = self.state.lock().unwrap();
        state
            .pages
            .as_ref()
            .map(|pages| {
                pages
                    .iter()
                    .filter(|p| matches!(p.residency, PageResidency::Resident { .. }))
                    .count()
            })
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("heap", &self.heap().name())
            .field("flags", &self.flags)
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeapEntry;
    use crate::flags::HeapFlags;
    use crate::heap::Extent;
    use crate::heaps::SystemHeap;
    use std::time::Duration;

    fn test_entry() -> (Arc<HeapEntry>, Arc<BufferRegistry>) {
        let heap = Arc::new(SystemHeap::new(0, "system"));
        (Arc::new(HeapEntry::new(heap)), Arc::new(BufferRegistry::new()))
    }

    fn make_buffer(flags: BufferFlags) -> (Arc<Buffer>, Arc<BufferRegistry>) {
        let (entry, registry) = test_entry();
        let buffer = Buffer::create(&entry, &registry, BufferId(1), PAGE_SIZE * 4, PAGE_SIZE, flags)
            .unwrap();
        (buffer, registry)
    }

    #[test]
    fn test_refcount_conservation() {
        let (buffer, registry) = make_buffer(BufferFlags::empty());
        assert_eq!(registry.len(), 1);

        buffer.acquire();
        buffer.acquire();
        buffer.release();
        buffer.release();
        assert_eq!(registry.len(), 1);

        // The creation reference.
        buffer.release();
        assert_eq!(registry.len(), 0);
    }

    #[test]
    #[should_panic(expected = "over-released")]
    fn test_release_past_zero_panics() {
        let (buffer, _registry) = make_buffer(BufferFlags::empty());
        buffer.release();
        buffer.release();
    }

    #[test]
    fn test_kernel_mapping_cache() {
        let (buffer, _registry) = make_buffer(BufferFlags::empty());

        let first = buffer.kmap_get().unwrap();
        let second = buffer.kmap_get().unwrap();
        assert_eq!(first.addr(), second.addr());
        assert_eq!(buffer.kmap_count(), 2);

        buffer.kmap_put();
        assert_eq!(buffer.kmap_count(), 1);

        buffer.kmap_put();
        assert_eq!(buffer.kmap_count(), 0);

        // A fresh request maps again.
        let third = buffer.kmap_get().unwrap();
        assert_eq!(third.len(), PAGE_SIZE * 4);
        buffer.kmap_put();

        buffer.release();
    }

    #[test]
    fn test_orphan_records_last_owner() {
        let (buffer, _registry) = make_buffer(BufferFlags::empty());
        assert!(buffer.last_owner().is_none());

        buffer.attach_handle();
        assert_eq!(buffer.handle_count(), 1);
        buffer.detach_handle();

        let owner = buffer.last_owner().unwrap();
        assert_eq!(owner.pid, std::process::id());

        buffer.release();
    }

    struct CountingMapper {
        id: u64,
        maps: AtomicUsize,
        unmaps: AtomicUsize,
    }

    impl DeviceMapper for CountingMapper {
        fn id(&self) -> u64 {
            self.id
        }

        fn name(&self) -> &str {
            "counting"
        }

        fn map(
            &self,
            table: &DescriptorTable,
            _len: usize,
            _direction: DataDirection,
            region: u32,
        ) -> Result<DeviceAddr> {
            self.maps.fetch_add(1, Ordering::Relaxed);
            Ok(DeviceAddr(table.extents()[0].addr + u64::from(region)))
        }

        fn unmap(&self, _addr: DeviceAddr) {
            self.unmaps.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_device_mapping_cached_by_identity_and_region() {
        let (buffer, _registry) = make_buffer(BufferFlags::empty());
        let mapper: Arc<dyn DeviceMapper> = Arc::new(CountingMapper {
            id: 9,
            maps: AtomicUsize::new(0),
            unmaps: AtomicUsize::new(0),
        });

        let a = buffer.map_device(&mapper, DataDirection::Bidirectional, 0).unwrap();
        let b = buffer.map_device(&mapper, DataDirection::Bidirectional, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(buffer.device_map_use_count(9, 0), Some(2));

        // Different region id gets its own mapping.
        let c = buffer.map_device(&mapper, DataDirection::ToDevice, 1).unwrap();
        assert_ne!(a, c);

        // Decrement-only unmap: the entry survives at zero uses.
        buffer.unmap_device(&mapper, a);
        buffer.unmap_device(&mapper, a);
        assert_eq!(buffer.device_map_use_count(9, 0), Some(0));

        // Underflow is logged, not fatal.
        buffer.unmap_device(&mapper, a);
        assert_eq!(buffer.device_map_use_count(9, 0), Some(0));

        buffer.release();
    }

    /// One-slot heap whose free path is slow, so a reclamation can be
    /// caught mid-flight on the worker.
    struct SlowFreeHeap {
        slot_taken: Mutex<bool>,
    }

    impl Heap for SlowFreeHeap {
        fn id(&self) -> u32 {
            3
        }

        fn name(&self) -> &str {
            "slow-free"
        }

        fn flags(&self) -> HeapFlags {
            HeapFlags::DEFER_FREE
        }

        fn allocate(&self, len: usize, _align: usize, _flags: BufferFlags) -> Result<Allocation> {
            let mut taken = self.slot_taken.lock().unwrap();
            if *taken {
                return Err(Error::Exhausted("slow-free heap full".into()));
            }
            *taken = true;
            Ok(Allocation::new(len, ()))
        }

        fn free(&self, _allocation: Allocation) {
            std::thread::sleep(Duration::from_millis(150));
            *self.slot_taken.lock().unwrap() = false;
        }

        fn map_dma(&self, allocation: &Allocation) -> Result<DescriptorTable> {
            let mut table = DescriptorTable::new();
            table.push(Extent {
                addr: 0x4000,
                len: allocation.len(),
            });
            Ok(table)
        }
    }

    #[test]
    fn test_retry_waits_for_in_flight_reclamation() {
        let entry = Arc::new(HeapEntry::new(Arc::new(SlowFreeHeap {
            slot_taken: Mutex::new(false),
        })));
        let registry = Arc::new(BufferRegistry::new());

        let first = Buffer::create(
            &entry,
            &registry,
            BufferId(1),
            PAGE_SIZE,
            0,
            BufferFlags::empty(),
        )
        .unwrap();
        first.release();

        // Give the worker time to pop the buffer and enter the slow free;
        // the slot only opens once that free completes.
        std::thread::sleep(Duration::from_millis(50));

        let second = Buffer::create(
            &entry,
            &registry,
            BufferId(2),
            PAGE_SIZE,
            0,
            BufferFlags::empty(),
        )
        .unwrap();
        second.release();
    }

    struct RejectingHeap {
        calls: AtomicUsize,
    }

    impl Heap for RejectingHeap {
        fn id(&self) -> u32 {
            4
        }

        fn name(&self) -> &str {
            "rejecting"
        }

        fn flags(&self) -> HeapFlags {
            HeapFlags::DEFER_FREE
        }

        fn allocate(&self, _len: usize, _align: usize, _flags: BufferFlags) -> Result<Allocation> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(Error::InvalidArgument("alignment unsupported".into()))
        }

        fn free(&self, _allocation: Allocation) {}

        fn map_dma(&self, _allocation: &Allocation) -> Result<DescriptorTable> {
            Ok(DescriptorTable::new())
        }
    }

    #[test]
    fn test_only_exhaustion_triggers_reclaim_retry() {
        let heap = Arc::new(RejectingHeap {
            calls: AtomicUsize::new(0),
        });
        let entry = Arc::new(HeapEntry::new(Arc::clone(&heap) as Arc<dyn Heap>));
        let registry = Arc::new(BufferRegistry::new());

        let result = Buffer::create(
            &entry,
            &registry,
            BufferId(1),
            PAGE_SIZE,
            0,
            BufferFlags::empty(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        // Draining cannot fix a malformed request; no second attempt.
        assert_eq!(heap.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_fault_mapping_state_machine() {
        let (buffer, _registry) = make_buffer(BufferFlags::CACHED);

        let mapping = buffer.map_user(0, 4).unwrap();
        assert_eq!(buffer.resident_pages(), 0);

        buffer.fault_page(mapping, 0).unwrap();
        buffer.fault_page(mapping, 2).unwrap();
        assert_eq!(buffer.resident_pages(), 2);

        // Sync writes back both dirty pages and unmaps everything.
        assert_eq!(buffer.sync_for_device(DataDirection::ToDevice), 2);
        assert_eq!(buffer.resident_pages(), 0);

        // Refault and sync again: only the refaulted page is dirty.
        buffer.fault_page(mapping, 1).unwrap();
        assert_eq!(buffer.sync_for_device(DataDirection::ToDevice), 1);

        buffer.unmap_user(mapping);
        buffer.release();
    }

    #[test]
    fn test_user_mapping_bounds_checked() {
        let (buffer, _registry) = make_buffer(BufferFlags::CACHED);

        assert!(matches!(
            buffer.map_user(3, 2),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(buffer.map_user(0, 0), Err(Error::InvalidArgument(_))));

        buffer.release();
    }

    #[test]
    fn test_nozeroed_user_mapping_prohibited() {
        let (buffer, _registry) = make_buffer(BufferFlags::NOZEROED);
        assert!(matches!(
            buffer.map_user(0, 1),
            Err(Error::InvalidArgument(_))
        ));
        buffer.release();
    }
}
