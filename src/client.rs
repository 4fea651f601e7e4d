//! Clients: per-session namespaces of handles.
//!
//! A [`Client`] owns the handles created for one consumer session. Handles
//! are indexed two ways: by referenced buffer (so importing the same shared
//! buffer twice deduplicates onto one handle) and by a dense externally
//! visible id space (the ids a session layer hands out instead of raw
//! pointers). The id-space lookup is also the basis of handle validation:
//! every operation translates the presented id back into a handle before
//! trusting it, so a stale or forged id is caught instead of dereferenced.

use crate::buffer::BufferId;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::flags::BufferFlags;
use crate::handle::Handle;
use crate::heap::MappedRange;
use crate::token::ShareToken;
use slab::Slab;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Ids are 32-bit and start at 1; 0 is never a valid handle id.
const MAX_HANDLE_IDS: usize = (u32::MAX - 1) as usize;

pub(crate) struct HandleTable {
    by_buffer: BTreeMap<BufferId, Arc<Handle>>,
    ids: Slab<Arc<Handle>>,
}

impl HandleTable {
    fn get(&self, id: u32) -> Option<&Arc<Handle>> {
        let key = (id as usize).checked_sub(1)?;
        self.ids.get(key)
    }

    fn detach(&mut self, handle: &Arc<Handle>) {
        let key = (handle.id() as usize) - 1;
        self.ids.remove(key);
        self.by_buffer.remove(&handle.buffer().id());
    }
}

/// A namespace of handles for one consumer session.
///
/// Created through [`Device::create_client`]; dropping the client closes
/// the session, force-freeing every remaining handle.
pub struct Client {
    id: u64,
    name: String,
    pid: u32,
    device: Arc<Device>,
    table: Mutex<HandleTable>,
}

impl Client {
    pub(crate) fn new(device: Arc<Device>, id: u64, name: &str) -> Arc<Client> {
        Arc::new(Client {
            id,
            name: name.to_owned(),
            pid: std::process::id(),
            device,
            table: Mutex::new(HandleTable {
                by_buffer: BTreeMap::new(),
                ids: Slab::new(),
            }),
        })
    }

    /// Client name, used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process id of the session owner.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The device this client was created on.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Allocate a buffer and return the handle to it.
    ///
    /// See [`Device::allocate`] for the heap-selection policy.
    pub fn allocate(
        self: &Arc<Self>,
        len: usize,
        align: usize,
        heap_mask: u32,
        flags: BufferFlags,
    ) -> Result<Arc<Handle>> {
        self.device.allocate(self, len, align, heap_mask, flags)
    }

    /// Translate an externally presented id into its handle.
    pub fn lookup(&self, id: u32) -> Result<Arc<Handle>> {
        let table = self.table.lock().unwrap();
        Self::valid_handle(&table, id)
    }

    /// Find this client's handle for a buffer, if it holds one.
    pub fn lookup_by_buffer(&self, buffer: BufferId) -> Option<Arc<Handle>> {
        self.table.lock().unwrap().by_buffer.get(&buffer).cloned()
    }

    /// Release one reference to the handle with the given id.
    ///
    /// Freeing an id twice fails validation on the second call with
    /// [`Error::NotFound`] and has no effect.
    pub fn free(&self, id: u32) -> Result<()> {
        let last = {
            let mut table = self.table.lock().unwrap();
            let handle = Self::valid_handle(&table, id)?;
            if handle.release() {
                table.detach(&handle);
                Some(handle)
            } else {
                None
            }
        };
        if let Some(handle) = last {
            handle.teardown();
        }
        Ok(())
    }

    /// Export the referenced buffer as a shareable token.
    ///
    /// The token holds its own buffer reference; the handle may be freed
    /// while tokens derived from it are still alive.
    pub fn share(&self, id: u32) -> Result<ShareToken> {
        let table = self.table.lock().unwrap();
        let handle = Self::valid_handle(&table, id)?;
        Ok(ShareToken::export(handle.buffer(), self.device.device_id()))
    }

    /// Import a shared buffer, returning a handle to it.
    ///
    /// If the token did not originate from this client's device the import
    /// fails with [`Error::OwnershipMismatch`]. If the client already
    /// holds a handle for the buffer, that handle gains a reference and is
    /// returned — importing the same buffer twice never creates a second
    /// handle.
    pub fn import(self: &Arc<Self>, token: &ShareToken) -> Result<Arc<Handle>> {
        if token.origin() != self.device.device_id() {
            return Err(Error::OwnershipMismatch(
                "token was exported by a different allocator".into(),
            ));
        }
        let buffer = token.buffer();

        let mut table = self.table.lock().unwrap();
        if let Some(existing) = table.by_buffer.get(&buffer.id()) {
            let existing = existing.clone();
            existing.acquire();
            return Ok(existing);
        }

        let handle = Handle::new(self, buffer);
        Self::attach_locked(&mut table, handle)
    }

    /// Map the referenced buffer into the kernel address space.
    pub fn kernel_map(&self, id: u32) -> Result<MappedRange> {
        let table = self.table.lock().unwrap();
        let handle = Self::valid_handle(&table, id)?;
        handle.kmap_get()
    }

    /// Release one kernel-mapping request made through the handle.
    pub fn kernel_unmap(&self, id: u32) -> Result<()> {
        let table = self.table.lock().unwrap();
        let handle = Self::valid_handle(&table, id)?;
        handle.kmap_put();
        Ok(())
    }

    /// Physical address of the referenced buffer, where the heap supports
    /// it.
    pub fn phys(&self, id: u32) -> Result<(u64, usize)> {
        let table = self.table.lock().unwrap();
        let handle = Self::valid_handle(&table, id)?;
        handle.buffer().phys()
    }

    /// Clone the referenced buffer's descriptor table.
    pub fn descriptor_table(&self, id: u32) -> Result<crate::heap::DescriptorTable> {
        let table = self.table.lock().unwrap();
        let handle = Self::valid_handle(&table, id)?;
        Ok(handle.buffer().descriptor_table())
    }

    /// Invoke the device's custom-operation dispatcher.
    pub fn custom(self: &Arc<Self>, cmd: u32, arg: u64) -> Result<i64> {
        self.device.dispatch_custom(self, cmd, arg)
    }

    /// Bytes referenced by this client's handles, per heap name.
    pub fn usage_by_heap(&self) -> BTreeMap<String, usize> {
        let table = self.table.lock().unwrap();
        let mut usage = BTreeMap::new();
        for handle in table.by_buffer.values() {
            let buffer = handle.buffer();
            *usage.entry(buffer.heap().name().to_owned()).or_insert(0) += buffer.size();
        }
        usage
    }

    /// Bytes referenced by this client's handles on one heap.
    pub(crate) fn heap_usage(&self, heap_id: u32) -> usize {
        let table = self.table.lock().unwrap();
        table
            .by_buffer
            .values()
            .filter(|h| h.buffer().heap().id() == heap_id)
            .map(|h| h.buffer().size())
            .sum()
    }

    /// Number of live handles. Diagnostic.
    pub fn handle_count(&self) -> usize {
        self.table.lock().unwrap().ids.len()
    }

    /// Attach a freshly created handle: assign it an id and index it by
    /// buffer identity.
    pub(crate) fn attach(&self, handle: Arc<Handle>) -> Result<Arc<Handle>> {
        let mut table = self.table.lock().unwrap();
        Self::attach_locked(&mut table, handle)
    }

    fn attach_locked(table: &mut HandleTable, handle: Arc<Handle>) -> Result<Arc<Handle>> {
        if table.ids.len() >= MAX_HANDLE_IDS {
            // Undo the buffer-side attachment; the handle never became
            // visible.
            handle.release();
            handle.teardown();
            return Err(Error::Exhausted("handle id space".into()));
        }

        let key = table.ids.insert(handle.clone());
        handle.set_id(key as u32 + 1);

        let buffer_id = handle.buffer().id();
        if table.by_buffer.insert(buffer_id, handle.clone()).is_some() {
            tracing::warn!(
                buffer = %buffer_id,
                "client already held a handle for this buffer"
            );
        }
        Ok(handle)
    }

    fn valid_handle(table: &MutexGuard<'_, HandleTable>, id: u32) -> Result<Arc<Handle>> {
        table
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("handle id {id}")))
    }
}

impl Drop for Client {
    /// Session close: force-free every remaining handle, then leave the
    /// device.
    fn drop(&mut self) {
        let handles: Vec<Arc<Handle>> = {
            let mut table = self.table.lock().unwrap();
            table.by_buffer.clear();
            table.ids.drain().collect()
        };
        for handle in handles {
            let refs = handle.ref_count();
            if refs != 1 {
                tracing::warn!(
                    client = self.name,
                    handle = handle.id(),
                    refs,
                    "destroying handle with outstanding references at client teardown"
                );
            }
            handle.teardown();
        }
        self.device.remove_client(self.id);
        tracing::debug!(client = self.name, "client destroyed");
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("handles", &self.handle_count())
            .finish()
    }
}
