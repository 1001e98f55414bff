//! Offset planner for the contiguous tensor arena.
//!
//! The allocator hands out integer offsets, not pointers: the whole layout is
//! planned before the single device buffer of `peak` bytes exists. The plan is
//! committed on the first [`Allocator::get_ptr`] call, after which the layout
//! is frozen.

use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::runtime::Runtime;

/// Default offset alignment: the widest scalar dtype is 8 bytes, so 8-byte
/// offsets keep every tensor usable for any element type.
const DEFAULT_ALIGNMENT: usize = std::mem::size_of::<u64>();

/// Snapshot of the allocator's bookkeeping counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorInfo {
    /// Currently live bytes.
    pub used: usize,
    /// Largest offset ever committed; equals the one-time device allocation.
    pub peak: usize,
}

impl fmt::Display for AllocatorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "used memory: {}, peak memory: {}", self.used, self.peak)
    }
}

/// Pre-execution offset planner over a single logical arena.
#[derive(Debug)]
pub struct Allocator {
    runtime: Arc<dyn Runtime>,
    used: usize,
    peak: usize,
    alignment: usize,
    /// Free intervals keyed by offset; pairwise disjoint and never adjacent.
    free_blocks: BTreeMap<usize, usize>,
    /// The real device buffer; `None` until the plan is committed.
    ptr: Option<NonNull<u8>>,
}

impl Allocator {
    pub fn new(runtime: Arc<dyn Runtime>) -> Self {
        Allocator {
            runtime,
            used: 0,
            peak: 0,
            alignment: DEFAULT_ALIGNMENT,
            free_blocks: BTreeMap::new(),
            ptr: None,
        }
    }

    /// Reserves `size` bytes and returns the chosen arena offset.
    ///
    /// Preference order: reuse or extend the tail free block (keeps `peak`
    /// tight), first fit over the offset-ordered free list, then extend the
    /// arena. Panics once the plan has been committed via [`Allocator::get_ptr`].
    pub fn alloc(&mut self, size: usize) -> usize {
        assert!(
            self.ptr.is_none(),
            "alloc after the arena was committed to a device buffer"
        );
        let size = self.aligned(size);
        self.used += size;

        // Tail block whose end touches the high-water mark.
        if let Some((&offset, &block)) = self.free_blocks.iter().next_back() {
            if offset + block == self.peak {
                self.free_blocks.remove(&offset);
                if block >= size {
                    if block > size {
                        self.free_blocks.insert(offset + size, block - size);
                    }
                } else {
                    self.peak += size - block;
                }
                return offset;
            }
        }

        // First fit, carving from the low end of the block.
        if let Some((&offset, &block)) = self.free_blocks.iter().find(|(_, &block)| block >= size) {
            self.free_blocks.remove(&offset);
            if block > size {
                self.free_blocks.insert(offset + size, block - size);
            }
            return offset;
        }

        let offset = self.peak;
        self.peak += size;
        offset
    }

    /// Returns `size` bytes at `offset` to the free list, coalescing with both
    /// neighbors. Freeing at the tail does not retract `peak`.
    pub fn free(&mut self, offset: usize, size: usize) {
        assert!(
            self.ptr.is_none(),
            "free after the arena was committed to a device buffer"
        );
        let mut size = self.aligned(size);
        let mut offset = offset;
        self.used -= size;

        if let Some(&next) = self.free_blocks.get(&(offset + size)) {
            self.free_blocks.remove(&(offset + size));
            size += next;
        }
        if let Some((&prev_offset, &prev_size)) = self.free_blocks.range(..offset).next_back() {
            if prev_offset + prev_size == offset {
                self.free_blocks.remove(&prev_offset);
                offset = prev_offset;
                size += prev_size;
            }
        }
        self.free_blocks.insert(offset, size);
    }

    /// Materializes the device buffer on first call and returns it.
    ///
    /// The runtime is asked for exactly `peak` bytes; its failure is
    /// propagated unchanged. Subsequent calls return the cached pointer.
    pub fn get_ptr(&mut self) -> Result<NonNull<u8>> {
        if let Some(ptr) = self.ptr {
            return Ok(ptr);
        }
        let ptr = self.runtime.alloc(self.peak)?;
        debug!(
            device = self.runtime.device(),
            peak = self.peak,
            "arena committed"
        );
        self.ptr = Some(ptr);
        Ok(ptr)
    }

    /// The committed device buffer, if [`Allocator::get_ptr`] has run.
    pub fn committed_ptr(&self) -> Option<NonNull<u8>> {
        self.ptr
    }

    pub fn committed(&self) -> bool {
        self.ptr.is_some()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Offset-ordered view of the free intervals.
    pub fn free_blocks(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.free_blocks.iter().map(|(&offset, &size)| (offset, size))
    }

    pub fn info(&self) -> AllocatorInfo {
        AllocatorInfo {
            used: self.used,
            peak: self.peak,
        }
    }

    fn aligned(&self, size: usize) -> usize {
        size.next_multiple_of(self.alignment)
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            if self.peak > 0 {
                // SAFETY: `ptr` came from `runtime.alloc(self.peak)` and is
                // released exactly once.
                unsafe { self.runtime.dealloc(ptr, self.peak) };
            }
        }
    }
}
