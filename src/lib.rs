//! # Quarry
//!
//! A reference-counted buffer allocator with pluggable memory heaps.
//!
//! Quarry manages the lifetime of device-shareable memory buffers. Memory
//! comes from [`Heap`](heap::Heap) backends registered on a
//! [`Device`](device::Device); consumers open [`Client`](client::Client)
//! sessions, allocate buffers through id-addressed
//! [`Handle`](handle::Handle)s, and pass buffers between sessions as
//! refcounted [`ShareToken`](token::ShareToken)s. On top of the raw
//! allocation the core tracks cached kernel mappings, cross-device address
//! mappings, and fault-driven user mappings with per-page dirty state.
//!
//! ## Features
//!
//! - **Explicit reference counting**: buffer lifetime follows handle and
//!   token references, with orphan diagnostics when handles die first
//! - **Pluggable heaps**: paged system memory, contiguous carveout
//!   regions, or anything implementing the [`Heap`](heap::Heap) trait
//! - **Heap fallback**: allocations carry a heap mask and walk candidates
//!   in descending priority order
//! - **Deferred free**: heaps can opt into asynchronous reclamation with
//!   drain-and-retry under memory pressure
//!
//! ## Quick Start
//!
//! ```rust
//! use quarry::device::Device;
//! use quarry::flags::BufferFlags;
//! use quarry::heaps::SystemHeap;
//! use std::sync::Arc;
//!
//! # fn main() -> quarry::Result<()> {
//! let device = Device::new();
//! device.add_heap(Arc::new(SystemHeap::new(0, "system")))?;
//!
//! let producer = device.create_client("producer");
//! let handle = producer.allocate(16 * 4096, 4096, 0b1, BufferFlags::empty())?;
//!
//! // Hand the buffer to another session.
//! let token = producer.share(handle.id())?;
//! let consumer = device.create_client("consumer");
//! let imported = consumer.import(&token)?;
//!
//! producer.free(handle.id())?;
//! consumer.free(imported.id())?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod buffer;
pub mod client;
pub mod device;
pub mod error;
pub mod flags;
pub mod handle;
pub mod heap;
pub mod heaps;
pub mod registry;
pub mod token;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::buffer::{Buffer, BufferId, DeviceAddr, DeviceMapper};
    pub use crate::client::Client;
    pub use crate::device::Device;
    pub use crate::error::{Error, Result};
    pub use crate::flags::{BufferFlags, HeapFlags, PAGE_SIZE};
    pub use crate::handle::Handle;
    pub use crate::heap::{DataDirection, DescriptorTable, Heap};
    pub use crate::heaps::{CarveoutHeap, SystemHeap};
    pub use crate::token::ShareToken;
}

pub use error::{Error, Result};
