//! Device runtime collaborator that materializes arena buffers.

use std::fmt;
use std::ptr::NonNull;

use anyhow::Result;

/// Raw-buffer provider backing a graph's tensor arena.
///
/// The core asks a runtime for exactly one buffer per graph lifetime (when the
/// allocator commits its plan) and returns it exactly once on destruction.
pub trait Runtime: fmt::Debug {
    /// Human-readable device name, e.g. `"cpu"`.
    fn device(&self) -> &str;

    /// Hands out a buffer of `bytes` bytes, aligned for the widest scalar
    /// dtype. A zero-byte request returns a dangling, well-aligned pointer
    /// that must never be passed to [`Runtime::dealloc`].
    fn alloc(&self, bytes: usize) -> Result<NonNull<u8>>;

    /// Returns a buffer obtained from [`Runtime::alloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must originate from a prior `alloc(bytes)` call on this runtime
    /// with the same non-zero `bytes`, and must not be used afterwards.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, bytes: usize);
}
