//! The canonical set of live buffers.

use crate::buffer::{Buffer, BufferId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Device-wide index of every live buffer, keyed by buffer identity.
///
/// The registry is pure bookkeeping: it never allocates or frees backend
/// memory. Its mutex is distinct from any buffer's own lock and from the
/// device topology lock, and is only held around insert/remove and
/// diagnostic traversal.
#[derive(Default)]
pub struct BufferRegistry {
    buffers: Mutex<BTreeMap<BufferId, Arc<Buffer>>>,
}

impl BufferRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a newly created buffer.
    ///
    /// # Panics
    ///
    /// Panics if a buffer with the same identity is already registered.
    /// Identities are generated from a monotonic counter, so a collision
    /// means shared state is corrupted.
    pub(crate) fn insert(&self, buffer: Arc<Buffer>) {
        let mut buffers = self.buffers.lock().unwrap();
        let id = buffer.id();
        let previous = buffers.insert(id, buffer);
        assert!(previous.is_none(), "buffer {id} already registered");
    }

    /// Remove a buffer whose reference count reached zero.
    pub(crate) fn remove(&self, id: BufferId) {
        let mut buffers = self.buffers.lock().unwrap();
        if buffers.remove(&id).is_none() {
            tracing::warn!(buffer = %id, "buffer missing from registry at removal");
        }
    }

    /// Number of live buffers.
    pub fn len(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }

    /// Whether the registry holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visit every live buffer in identity order.
    ///
    /// Diagnostic traversal only. The callback runs with the registry lock
    /// held; it may take individual buffer locks but must not release
    /// buffer references.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Buffer>)) {
        let buffers = self.buffers.lock().unwrap();
        for buffer in buffers.values() {
            f(buffer);
        }
    }
}
