//! Reference CPU runtime for the `nnir` graph core.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use anyhow::{anyhow, Result};

use nnir::runtime::Runtime;

/// Alignment of arena buffers; matches the planner's offset alignment so
/// every planned offset stays aligned for the widest scalar dtype.
pub const ARENA_ALIGNMENT: usize = 8;

/// Host-memory runtime backed by the global allocator.
#[derive(Debug, Default)]
pub struct CpuRuntime;

impl CpuRuntime {
    pub fn new() -> Self {
        CpuRuntime
    }
}

impl Runtime for CpuRuntime {
    fn device(&self) -> &str {
        "cpu"
    }

    fn alloc(&self, bytes: usize) -> Result<NonNull<u8>> {
        if bytes == 0 {
            return Ok(NonNull::<u64>::dangling().cast());
        }
        let layout = Layout::from_size_align(bytes, ARENA_ALIGNMENT)
            .map_err(|err| anyhow!("invalid arena layout for {bytes} bytes: {err}"))?;
        // SAFETY: the layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        NonNull::new(raw).ok_or_else(|| anyhow!("cpu allocation of {bytes} bytes failed"))
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, bytes: usize) {
        let layout = Layout::from_size_align_unchecked(bytes, ARENA_ALIGNMENT);
        alloc::dealloc(ptr.as_ptr(), layout);
    }
}
