//! Error types for Quarry.

use thiserror::Error;

/// Result type alias using Quarry's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Quarry operations.
///
/// Internal invariant violations (refcount underflow, double destroy,
/// duplicate registry identity) are *not* represented here: they indicate
/// corrupted shared state and panic instead of returning.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request (zero size, bad alignment, mapping out of bounds).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No registered heap is selected by the allocation's heap mask.
    #[error("no heap matches mask {mask:#x}")]
    NoMatchingHeap {
        /// The heap mask the caller passed.
        mask: u32,
    },

    /// A handle id, token, or heap id failed validation.
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend allocation or id-space exhaustion.
    #[error("resource exhausted: {0}")]
    Exhausted(String),

    /// A token or handle was presented to an allocator or client that does
    /// not own it.
    #[error("ownership mismatch: {0}")]
    OwnershipMismatch(String),

    /// The buffer's heap does not implement the requested capability.
    #[error("operation not supported by this heap: {0}")]
    NotSupported(&'static str),
}
