//! Handles: per-client references to buffers.

use crate::buffer::Buffer;
use crate::client::Client;
use crate::error::Result;
use crate::heap::MappedRange;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// A client's private, refcounted reference to a buffer.
///
/// Handles are the unit clients actually operate on. A handle belongs to
/// exactly one client and references exactly one buffer; both bindings are
/// fixed at creation. The reference count tracks outstanding uses of the
/// handle within its client (one per allocation or import); the handle is
/// torn down when it reaches zero, or forcibly when the client closes.
pub struct Handle {
    refs: AtomicUsize,
    client: Weak<Client>,
    buffer: Arc<Buffer>,
    /// Externally visible id, assigned when the handle is attached to the
    /// client's id space.
    id: OnceLock<u32>,
    /// Outstanding kernel-mapping requests made through this handle.
    /// Mutated only under the buffer lock.
    kmap_requests: AtomicU32,
}

impl Handle {
    /// Create a handle referencing `buffer`, taking one buffer reference
    /// and counting the handle on the buffer.
    pub(crate) fn new(client: &Arc<Client>, buffer: &Arc<Buffer>) -> Arc<Handle> {
        buffer.acquire();
        buffer.attach_handle();
        Arc::new(Handle {
            refs: AtomicUsize::new(1),
            client: Arc::downgrade(client),
            buffer: Arc::clone(buffer),
            id: OnceLock::new(),
            kmap_requests: AtomicU32::new(0),
        })
    }

    /// The externally visible id of this handle within its client.
    pub fn id(&self) -> u32 {
        *self.id.get().expect("handle not attached to a client")
    }

    pub(crate) fn set_id(&self, id: u32) {
        self.id.set(id).expect("handle attached twice");
    }

    /// The buffer this handle references.
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// The owning client, if it still exists.
    pub fn client(&self) -> Option<Arc<Client>> {
        self.client.upgrade()
    }

    /// Current reference count. Diagnostic only.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Relaxed)
    }

    /// Take one reference (deduplicated import). Caller must hold the
    /// client lock so the handle cannot race with its own teardown.
    pub(crate) fn acquire(&self) {
        let previous = self.refs.fetch_add(1, Ordering::Relaxed);
        assert!(previous > 0, "handle acquired after its last release");
    }

    /// Drop one reference. Returns true when this was the last one and
    /// the caller must detach and tear the handle down.
    pub(crate) fn release(&self) -> bool {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "handle over-released");
        previous == 1
    }

    /// Tear the handle down after it has been detached from the client's
    /// tables: release every outstanding kernel-mapping request, detach
    /// from the buffer, and drop the buffer reference.
    pub(crate) fn teardown(&self) {
        {
            let mut state = self.buffer.lock_state();
            while self.kmap_requests.load(Ordering::Relaxed) > 0 {
                self.kmap_requests.fetch_sub(1, Ordering::Relaxed);
                self.buffer.kmap_put_locked(&mut state);
            }
        }
        self.buffer.detach_handle();
        self.buffer.release();
    }

    /// Request a kernel mapping through this handle.
    ///
    /// The buffer-level mapping is refcounted once per handle: only this
    /// handle's first request reaches the buffer cache.
    pub(crate) fn kmap_get(&self) -> Result<MappedRange> {
        let mut state = self.buffer.lock_state();
        // Per-handle requests share one buffer-level reference: only this
        // handle's first request reaches the buffer cache.
        if self.kmap_requests.load(Ordering::Relaxed) > 0 {
            self.kmap_requests.fetch_add(1, Ordering::Relaxed);
            return Ok(self.buffer.cached_kmap_locked(&state));
        }
        let range = self.buffer.kmap_get_locked(&mut state)?;
        self.kmap_requests.fetch_add(1, Ordering::Relaxed);
        Ok(range)
    }

    /// Release one kernel-mapping request made through this handle.
    ///
    /// # Panics
    ///
    /// Panics when released more times than requested; that is a defect in
    /// the caller, not a recoverable condition.
    pub(crate) fn kmap_put(&self) {
        let mut state = self.buffer.lock_state();
        let requests = self.kmap_requests.load(Ordering::Relaxed);
        assert!(
            requests > 0,
            "handle released a kernel mapping it never requested"
        );
        self.kmap_requests.fetch_sub(1, Ordering::Relaxed);
        if requests == 1 {
            self.buffer.kmap_put_locked(&mut state);
        }
    }

    /// Outstanding kernel-mapping requests on this handle.
    pub fn kmap_requests(&self) -> u32 {
        self.kmap_requests.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id.get())
            .field("buffer", &self.buffer.id())
            .field("refs", &self.ref_count())
            .finish()
    }
}
