//! Concrete heap backends.
//!
//! Two reference backends ship with the crate: [`SystemHeap`] allocates
//! discontiguous paged memory from the host allocator, [`CarveoutHeap`]
//! hands out physically contiguous ranges from one pre-reserved region.
//! Anything else plugs in through the [`Heap`](crate::heap::Heap) trait.

mod carveout;
mod system;

pub use carveout::CarveoutHeap;
pub use system::SystemHeap;
