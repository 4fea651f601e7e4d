//! Share tokens: buffer references that travel between clients.
//!
//! A [`ShareToken`] is what [`Client::share`](crate::client::Client::share)
//! exports: a cloneable, refcounted reference to a buffer that outlives the
//! handle it came from. Tokens are stamped with the identity of the device
//! that produced them; an import into a client of a different device fails
//! instead of smuggling a foreign buffer in. A token also exposes the
//! buffer operations an external consumer needs without going through a
//! handle: CPU-access sessions, device mappings, user mappings, and cache
//! synchronization.

use crate::buffer::{Buffer, BufferId, DeviceAddr, DeviceMapper, UserMappingId};
use crate::error::Result;
use crate::heap::{DataDirection, DescriptorTable, MappedRange};
use std::sync::Arc;

struct TokenShared {
    buffer: Arc<Buffer>,
    origin: u64,
}

impl Drop for TokenShared {
    fn drop(&mut self) {
        self.buffer.release();
    }
}

/// A shareable reference to a buffer.
///
/// Holds one buffer reference for the lifetime of the token and all its
/// clones, so a shared buffer survives even when every handle to it is
/// freed.
#[derive(Clone)]
pub struct ShareToken {
    inner: Arc<TokenShared>,
}

impl ShareToken {
    /// Export a buffer as a token, taking one buffer reference.
    pub(crate) fn export(buffer: &Arc<Buffer>, origin: u64) -> ShareToken {
        buffer.acquire();
        ShareToken {
            inner: Arc::new(TokenShared {
                buffer: Arc::clone(buffer),
                origin,
            }),
        }
    }

    /// Identity of the device that exported this token.
    pub(crate) fn origin(&self) -> u64 {
        self.inner.origin
    }

    pub(crate) fn buffer(&self) -> &Arc<Buffer> {
        &self.inner.buffer
    }

    /// Identity of the referenced buffer.
    pub fn buffer_id(&self) -> BufferId {
        self.inner.buffer.id()
    }

    /// Size of the referenced buffer in bytes.
    pub fn size(&self) -> usize {
        self.inner.buffer.size()
    }

    /// Clone the referenced buffer's descriptor table.
    pub fn descriptor_table(&self) -> DescriptorTable {
        self.inner.buffer.descriptor_table()
    }

    /// Begin a CPU-access session: map the buffer into the kernel address
    /// space. Every call must be balanced by [`end_cpu_access`].
    ///
    /// [`end_cpu_access`]: Self::end_cpu_access
    pub fn begin_cpu_access(&self) -> Result<MappedRange> {
        self.inner.buffer.kmap_get()
    }

    /// End a CPU-access session started with
    /// [`begin_cpu_access`](Self::begin_cpu_access).
    pub fn end_cpu_access(&self) {
        self.inner.buffer.kmap_put();
    }

    /// Flush CPU writes ahead of device access. Returns the number of
    /// dirty pages written back for fault-mapped buffers; zero otherwise.
    pub fn sync_for_device(&self, direction: DataDirection) -> usize {
        self.inner.buffer.sync_for_device(direction)
    }

    /// Invalidate CPU caches after device writes.
    pub fn sync_for_cpu(&self, direction: DataDirection) {
        self.inner.buffer.sync_for_cpu(direction);
    }

    /// Map the buffer into an external device address space. Repeated
    /// requests for the same (mapper, region) return the cached address.
    pub fn map_device(
        &self,
        mapper: &Arc<dyn DeviceMapper>,
        direction: DataDirection,
        region: u32,
    ) -> Result<DeviceAddr> {
        self.inner.buffer.map_device(mapper, direction, region)
    }

    /// Release one use of a cross-device mapping.
    pub fn unmap_device(&self, mapper: &Arc<dyn DeviceMapper>, addr: DeviceAddr) {
        self.inner.buffer.unmap_device(mapper, addr);
    }

    /// Register a user mapping of `page_count` pages starting at
    /// `page_offset` pages into the buffer.
    pub fn map_user(&self, page_offset: usize, page_count: usize) -> Result<UserMappingId> {
        self.inner.buffer.map_user(page_offset, page_count)
    }

    /// Drop a user mapping.
    pub fn unmap_user(&self, mapping: UserMappingId) {
        self.inner.buffer.unmap_user(mapping);
    }

    /// Service a page fault on a fault-driven user mapping, returning the
    /// backing address of the faulted page.
    pub fn fault(&self, mapping: UserMappingId, index: usize) -> Result<u64> {
        self.inner.buffer.fault_page(mapping, index)
    }
}

impl std::fmt::Debug for ShareToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareToken")
            .field("buffer", &self.buffer_id())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::flags::{BufferFlags, PAGE_SIZE};
    use crate::heaps::SystemHeap;

    fn client() -> Arc<crate::client::Client> {
        let device = Device::new();
        device
            .add_heap(Arc::new(SystemHeap::new(0, "system")))
            .unwrap();
        device.create_client("token-test")
    }

    #[test]
    fn test_token_keeps_buffer_alive_past_free() {
        let client = client();
        let device = client.device().clone();

        let handle = client
            .allocate(PAGE_SIZE, 0, 0b1, BufferFlags::empty())
            .unwrap();
        let token = client.share(handle.id()).unwrap();
        assert_eq!(token.buffer().ref_count(), 2);

        client.free(handle.id()).unwrap();
        assert_eq!(device.live_buffers(), 1);
        assert_eq!(token.buffer().handle_count(), 0);

        drop(token);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_clones_share_one_buffer_reference() {
        let client = client();
        let device = client.device().clone();

        let handle = client
            .allocate(PAGE_SIZE, 0, 0b1, BufferFlags::empty())
            .unwrap();
        let token = client.share(handle.id()).unwrap();
        let copy = token.clone();
        assert_eq!(token.buffer().ref_count(), 2);

        client.free(handle.id()).unwrap();
        drop(token);
        assert_eq!(device.live_buffers(), 1);
        drop(copy);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_cpu_access_sessions_balance() {
        let client = client();
        let handle = client
            .allocate(PAGE_SIZE, 0, 0b1, BufferFlags::empty())
            .unwrap();
        let token = client.share(handle.id()).unwrap();

        let range = token.begin_cpu_access().unwrap();
        assert_eq!(range.len(), PAGE_SIZE);
        assert_eq!(token.buffer().kmap_count(), 1);
        token.end_cpu_access();
        assert_eq!(token.buffer().kmap_count(), 0);

        client.free(handle.id()).unwrap();
    }

    #[test]
    fn test_import_into_foreign_device_rejected() {
        let client = client();
        let other = {
            let device = Device::new();
            device
                .add_heap(Arc::new(SystemHeap::new(0, "system")))
                .unwrap();
            device.create_client("other")
        };

        let handle = client
            .allocate(PAGE_SIZE, 0, 0b1, BufferFlags::empty())
            .unwrap();
        let token = client.share(handle.id()).unwrap();

        assert!(matches!(
            other.import(&token),
            Err(crate::error::Error::OwnershipMismatch(_))
        ));
        client.free(handle.id()).unwrap();
    }

    #[test]
    fn test_sync_paths_over_token() {
        let client = client();
        let handle = client
            .allocate(PAGE_SIZE * 2, 0, 0b1, BufferFlags::CACHED)
            .unwrap();
        let token = client.share(handle.id()).unwrap();

        let mapping = token.map_user(0, 2).unwrap();
        token.fault(mapping, 0).unwrap();
        token.fault(mapping, 1).unwrap();
        assert_eq!(token.sync_for_device(DataDirection::ToDevice), 2);
        assert_eq!(token.sync_for_device(DataDirection::ToDevice), 0);
        token.sync_for_cpu(DataDirection::FromDevice);

        token.unmap_user(mapping);
        client.free(handle.id()).unwrap();
    }
}
