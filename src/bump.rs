use core::ptr::NonNull;

use log::trace;

use crate::allocators::{grow_contiguous, HeapGrower};

/// The simplest possible allocator: every request moves the break up by
/// exactly the requested size.
///
/// There is no header, so nothing can be released, resized or reused. It
/// shares the contiguity check with [`Arena`](../allocators/struct.Arena.html)
/// and panics if the break moved between reading and growing it.
pub struct BumpAlloc<G> {
    pub grower: G,
    allocations: usize,
    bytes: usize,
}

impl<G: Default> Default for BumpAlloc<G> {
    fn default() -> Self {
        BumpAlloc::new(G::default())
    }
}

impl<G> BumpAlloc<G> {
    pub const fn new(grower: G) -> Self {
        BumpAlloc {
            grower,
            allocations: 0,
            bytes: 0,
        }
    }

    /// Number of successful allocations.
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Total bytes handed out.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl<G: HeapGrower> BumpAlloc<G> {
    /// Allocate `size` bytes. `None` for a zero size or when the grower
    /// refuses.
    ///
    /// # Safety
    ///
    /// The grower must uphold the `HeapGrower` contract. The memory is never
    /// reclaimed.
    pub unsafe fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let ptr = grow_contiguous(&mut self.grower, size)?;
        self.allocations += 1;
        self.bytes += size;
        trace!("Bumped {} bytes at {:?}", size, ptr);
        Some(ptr)
    }
}
