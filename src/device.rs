//! The device: process-wide allocator state.
//!
//! A [`Device`] owns the registered heaps, the buffer registry, and the set
//! of live clients. It is the root of the lock hierarchy: its
//! reader/writer topology lock guards heap-list and client-set membership
//! and is always taken before any client or buffer lock. Allocation only
//! takes it for reading, so concurrent allocations proceed in parallel;
//! heap and client registration take it for writing.

use crate::buffer::{Buffer, BufferId, TaskInfo};
use crate::client::Client;
use crate::error::{Error, Result};
use crate::flags::{page_align, BufferFlags, HeapFlags};
use crate::handle::Handle;
use crate::heap::{DeferredFreeQueue, Heap};
use crate::registry::BufferRegistry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Heap ids double as bit positions in allocation masks.
const MAX_HEAP_ID: u32 = 31;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Custom-operation dispatcher, invoked by [`Client::custom`].
pub type CustomHandler = Box<dyn Fn(&Arc<Client>, u32, u64) -> Result<i64> + Send + Sync>;

/// A registered heap plus its deferred-free machinery.
pub(crate) struct HeapEntry {
    pub(crate) heap: Arc<dyn Heap>,
    pub(crate) deferred: Option<DeferredFreeQueue>,
}

impl HeapEntry {
    pub(crate) fn new(heap: Arc<dyn Heap>) -> Self {
        let deferred = heap
            .flags()
            .contains(HeapFlags::DEFER_FREE)
            .then(|| DeferredFreeQueue::start(heap.name()));
        Self { heap, deferred }
    }
}

struct Topology {
    /// Heaps in descending priority order.
    heaps: Vec<Arc<HeapEntry>>,
    clients: BTreeMap<u64, Weak<Client>>,
}

/// Process-wide allocator state.
///
/// Created once at subsystem initialization and passed explicitly to
/// everything that needs it; heaps register into it dynamically.
///
/// # Example
///
/// ```rust
/// use quarry::device::Device;
/// use quarry::flags::BufferFlags;
/// use quarry::heaps::SystemHeap;
/// use std::sync::Arc;
///
/// let device = Device::new();
/// device.add_heap(Arc::new(SystemHeap::new(0, "system"))).unwrap();
///
/// let client = device.create_client("example");
/// let handle = client.allocate(4096, 4096, 0b1, BufferFlags::empty()).unwrap();
/// client.free(handle.id()).unwrap();
/// ```
pub struct Device {
    id: u64,
    topology: RwLock<Topology>,
    registry: Arc<BufferRegistry>,
    custom: Option<CustomHandler>,
    next_buffer: AtomicU64,
    next_client: AtomicU64,
}

impl Device {
    /// Create a device with no custom-operation dispatcher.
    pub fn new() -> Arc<Device> {
        Self::build(None)
    }

    /// Create a device with a custom-operation dispatcher for opcode
    /// passthrough.
    pub fn with_custom_handler(handler: CustomHandler) -> Arc<Device> {
        Self::build(Some(handler))
    }

    fn build(custom: Option<CustomHandler>) -> Arc<Device> {
        Arc::new(Device {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            topology: RwLock::new(Topology {
                heaps: Vec::new(),
                clients: BTreeMap::new(),
            }),
            registry: Arc::new(BufferRegistry::new()),
            custom,
            next_buffer: AtomicU64::new(1),
            next_client: AtomicU64::new(1),
        })
    }

    /// Identity of this device instance; tokens are stamped with it so an
    /// import can prove the token came from this allocator.
    pub fn device_id(&self) -> u64 {
        self.id
    }

    /// Register a heap.
    ///
    /// Heaps flagged `DEFER_FREE` get a deferred-free worker. Fails if the
    /// id is out of mask range or already taken.
    pub fn add_heap(&self, heap: Arc<dyn Heap>) -> Result<()> {
        if heap.id() > MAX_HEAP_ID {
            return Err(Error::InvalidArgument(format!(
                "heap id {} exceeds the mask range",
                heap.id()
            )));
        }

        let mut topology = self.topology.write().unwrap();
        if topology.heaps.iter().any(|e| e.heap.id() == heap.id()) {
            return Err(Error::InvalidArgument(format!(
                "heap id {} already registered",
                heap.id()
            )));
        }

        tracing::info!(heap = heap.name(), id = heap.id(), "registered heap");
        topology.heaps.push(Arc::new(HeapEntry::new(heap)));
        topology
            .heaps
            .sort_by(|a, b| b.heap.priority().cmp(&a.heap.priority()));
        Ok(())
    }

    /// Open a session: create a client namespace on this device.
    pub fn create_client(self: &Arc<Self>, name: &str) -> Arc<Client> {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let client = Client::new(Arc::clone(self), id, name);
        let mut topology = self.topology.write().unwrap();
        topology.clients.insert(id, Arc::downgrade(&client));
        client
    }

    pub(crate) fn remove_client(&self, id: u64) {
        self.topology.write().unwrap().clients.remove(&id);
    }

    /// Allocate a buffer for `client` and attach a handle to it.
    ///
    /// The length is rounded up to page granularity. Heaps selected by
    /// `heap_mask` are tried in descending priority order; a backend
    /// failure on a deferred-free heap drains that heap's queue and
    /// retries once before falling through to the next heap. On success
    /// the returned handle is the sole owner of the new buffer.
    pub fn allocate(
        &self,
        client: &Arc<Client>,
        len: usize,
        align: usize,
        heap_mask: u32,
        flags: BufferFlags,
    ) -> Result<Arc<Handle>> {
        if client.device().device_id() != self.id {
            return Err(Error::OwnershipMismatch(
                "client belongs to a different device".into(),
            ));
        }
        let len = page_align(len);
        if len == 0 {
            return Err(Error::InvalidArgument("zero-length allocation".into()));
        }

        tracing::debug!(len, align, heap_mask, ?flags, "allocation request");

        let buffer = self.create_buffer(len, align, heap_mask, flags)?;

        let handle = Handle::new(client, &buffer);
        // The buffer was created with one reference and the handle took a
        // second; the handle is the owner from here on.
        buffer.release();

        client.attach(handle)
    }

    fn create_buffer(
        &self,
        len: usize,
        align: usize,
        heap_mask: u32,
        flags: BufferFlags,
    ) -> Result<Arc<Buffer>> {
        let topology = self.topology.read().unwrap();

        let mut matched = false;
        let mut last_err = None;
        for entry in &topology.heaps {
            if heap_mask & (1 << entry.heap.id()) == 0 {
                continue;
            }
            matched = true;

            let id = BufferId(self.next_buffer.fetch_add(1, Ordering::Relaxed));
            match Buffer::create(entry, &self.registry, id, len, align, flags) {
                Ok(buffer) => return Ok(buffer),
                Err(err) => {
                    tracing::debug!(
                        heap = entry.heap.name(),
                        error = %err,
                        "heap failed, falling through"
                    );
                    last_err = Some(err);
                }
            }
        }
        drop(topology);

        if !matched {
            return Err(Error::NoMatchingHeap { mask: heap_mask });
        }

        let err = last_err.expect("matched a heap but recorded no error");
        if matches!(err, Error::Exhausted(_)) {
            self.log_usage();
        }
        Err(err)
    }

    /// Synchronously drain a deferred-free heap's reclamation queue.
    ///
    /// Returns the number of buffers reclaimed.
    pub fn drain_deferred(&self, heap_id: u32) -> Result<usize> {
        let entry = self.heap_entry(heap_id)?;
        Ok(entry.deferred.as_ref().map_or(0, |q| q.drain()))
    }

    /// Number of live buffers across all heaps. Diagnostic.
    pub fn live_buffers(&self) -> usize {
        self.registry.len()
    }

    pub(crate) fn dispatch_custom(&self, client: &Arc<Client>, cmd: u32, arg: u64) -> Result<i64> {
        match &self.custom {
            Some(handler) => handler(client, cmd, arg),
            None => Err(Error::NotSupported("custom operations")),
        }
    }

    fn heap_entry(&self, heap_id: u32) -> Result<Arc<HeapEntry>> {
        let topology = self.topology.read().unwrap();
        topology
            .heaps
            .iter()
            .find(|e| e.heap.id() == heap_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("heap id {heap_id}")))
    }

    /// Per-heap usage totals across the whole device.
    pub fn usage_snapshot(&self) -> Vec<HeapUsage> {
        let mut per_heap: BTreeMap<u32, usize> = BTreeMap::new();
        self.registry.for_each(|buffer| {
            *per_heap.entry(buffer.heap().id()).or_insert(0) += buffer.size();
        });

        let topology = self.topology.read().unwrap();
        topology
            .heaps
            .iter()
            .map(|entry| HeapUsage {
                id: entry.heap.id(),
                name: entry.heap.name().to_owned(),
                bytes_in_use: per_heap.get(&entry.heap.id()).copied().unwrap_or(0),
                deferred_bytes: entry.deferred.as_ref().map_or(0, |q| q.queued_bytes()),
            })
            .collect()
    }

    fn log_usage(&self) {
        for usage in self.usage_snapshot() {
            tracing::error!(
                heap = usage.name,
                id = usage.id,
                bytes = usage.bytes_in_use,
                deferred = usage.deferred_bytes,
                "heap usage at allocation failure"
            );
        }
    }

    /// Build the diagnostic report for one heap: per-client usage,
    /// orphaned allocations with their last known owner, and totals.
    pub fn heap_report(&self, heap_id: u32) -> Result<HeapReport> {
        let entry = self.heap_entry(heap_id)?;

        // Upgraded session references must not die under the topology
        // lock: dropping the last Arc runs Client::drop, which takes the
        // topology write lock on this same thread. Collect first, walk
        // after the guard is gone.
        let sessions: Vec<Arc<Client>> = {
            let topology = self.topology.read().unwrap();
            topology.clients.values().filter_map(Weak::upgrade).collect()
        };
        let mut clients = Vec::new();
        for client in &sessions {
            let bytes = client.heap_usage(heap_id);
            if bytes == 0 {
                continue;
            }
            clients.push(ClientUsage {
                name: client.name().to_owned(),
                pid: client.pid(),
                bytes,
            });
        }

        let mut orphans = Vec::new();
        let mut total_bytes = 0;
        self.registry.for_each(|buffer| {
            if buffer.heap().id() != heap_id {
                return;
            }
            total_bytes += buffer.size();
            if buffer.handle_count() == 0 {
                orphans.push(OrphanRecord {
                    last_owner: buffer.last_owner(),
                    bytes: buffer.size(),
                    kmap_count: buffer.kmap_count(),
                    refs: buffer.ref_count(),
                });
            }
        });
        let orphaned_bytes = orphans.iter().map(|o| o.bytes).sum();

        Ok(HeapReport {
            heap: entry.heap.name().to_owned(),
            clients,
            orphans,
            total_bytes,
            orphaned_bytes,
            deferred_bytes: entry.deferred.as_ref().map_or(0, |q| q.queued_bytes()),
            backend: entry.heap.debug_show(),
        })
    }
}

/// Usage totals for one heap.
#[derive(Clone, Debug)]
pub struct HeapUsage {
    /// Heap id.
    pub id: u32,
    /// Heap name.
    pub name: String,
    /// Bytes held by live buffers on this heap.
    pub bytes_in_use: usize,
    /// Bytes queued for deferred reclamation.
    pub deferred_bytes: usize,
}

/// One client's share of a heap in a [`HeapReport`].
#[derive(Clone, Debug)]
pub struct ClientUsage {
    /// Client name.
    pub name: String,
    /// Owning process id.
    pub pid: u32,
    /// Bytes referenced by the client's handles.
    pub bytes: usize,
}

/// A buffer with no handles left, listed with its last known owner.
#[derive(Clone, Debug)]
pub struct OrphanRecord {
    /// Task recorded when the last handle went away.
    pub last_owner: Option<TaskInfo>,
    /// Buffer size in bytes.
    pub bytes: usize,
    /// Active kernel mappings.
    pub kmap_count: usize,
    /// Remaining references.
    pub refs: usize,
}

/// Diagnostic report for one heap.
#[derive(Clone, Debug)]
pub struct HeapReport {
    /// Heap name.
    pub heap: String,
    /// Per-client usage, clients with zero bytes omitted.
    pub clients: Vec<ClientUsage>,
    /// Orphaned allocations.
    pub orphans: Vec<OrphanRecord>,
    /// Bytes held by live buffers.
    pub total_bytes: usize,
    /// Bytes held by orphaned buffers.
    pub orphaned_bytes: usize,
    /// Bytes queued for deferred reclamation.
    pub deferred_bytes: usize,
    /// Extra backend-specific diagnostics.
    pub backend: Option<String>,
}

impl std::fmt::Display for HeapReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:>16} {:>16} {:>16}", "client", "pid", "size")?;
        writeln!(f, "----------------------------------------------------")?;
        for client in &self.clients {
            writeln!(f, "{:>16} {:>16} {:>16}", client.name, client.pid, client.bytes)?;
        }
        writeln!(f, "----------------------------------------------------")?;
        writeln!(f, "orphaned allocations (info is from last known client):")?;
        for orphan in &self.orphans {
            let (task, pid) = orphan
                .last_owner
                .as_ref()
                .map(|o| (o.task.as_str(), o.pid))
                .unwrap_or(("<none>", 0));
            writeln!(
                f,
                "{:>16} {:>16} {:>16} {} {}",
                task, pid, orphan.bytes, orphan.kmap_count, orphan.refs
            )?;
        }
        writeln!(f, "----------------------------------------------------")?;
        writeln!(f, "{:>16} {:>16}", "total orphaned", self.orphaned_bytes)?;
        writeln!(f, "{:>16} {:>16}", "total", self.total_bytes)?;
        writeln!(f, "{:>16} {:>16}", "deferred free", self.deferred_bytes)?;
        if let Some(backend) = &self.backend {
            writeln!(f, "{backend}")?;
        }
        Ok(())
    }
}
