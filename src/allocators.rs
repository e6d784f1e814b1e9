//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`Arena`](struct.Arena.html)
//!
//! An `Arena` owns one block list and one memory source, and exposes the
//! four operations: `allocate`, `zero_allocate`, `reallocate` and `release`.
//! It is single-threaded and never gives memory back to its source.
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` abstracts over the program break: reading where it currently
//! is, and moving it up.
//!
//! ### [`SbrkHeapGrower`](struct.SbrkHeapGrower.html)
//!
//! Grows the real program break with `sbrk(2)` through `libc`.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a fixed array that pretends to be a program break, and
//! implements `HeapGrower` for such a purpose. It is mainly useful for testing.

use core::fmt;
use core::ptr::{self, NonNull};

#[cfg(feature = "use_libc")]
use core::convert::TryFrom;
#[cfg(feature = "use_libc")]
use errno::Errno;
use log::{debug, trace};

use crate::blocklist::{Block, BlockList, Stats, Tag, Validity, HEADER_SIZE};

pub trait HeapGrower {
    type Err: fmt::Debug;

    /// The current end of the growable region.
    fn current_break(&mut self) -> *mut u8;

    /// Move the break up by exactly `size` bytes. Returns the start of the
    /// newly granted range, which is the break as it was before the call.
    ///
    /// # Safety
    ///
    /// The returned range must be writable, and untracked by any other rust
    /// code, including the allocator itself.
    unsafe fn grow_heap(&mut self, size: usize) -> Result<*mut u8, Self::Err>;
}

/// Grow `grower` by `size` bytes and check that the new range starts where
/// the break was just before.
///
/// Returns `None` when the grower refuses. Panics when the range does not
/// start at the old break: some other code moved it in between, and every
/// block this crate carves assumes one contiguous region.
pub(crate) unsafe fn grow_contiguous<G: HeapGrower>(
    grower: &mut G,
    size: usize,
) -> Option<NonNull<u8>> {
    let boundary = grower.current_break();
    let start = match grower.grow_heap(size) {
        Ok(start) => start,
        Err(err) => {
            debug!("Heap growth of {} bytes refused: {:?}", size, err);
            return None;
        }
    };

    assert_eq!(
        boundary, start,
        "heap growth is not contiguous: break was {:?}, new range starts at {:?}",
        boundary, start,
    );

    NonNull::new(start)
}

/// SbrkHeapGrower moves the program break with `sbrk(2)`.
#[cfg(feature = "use_libc")]
#[derive(Default, Debug)]
pub struct SbrkHeapGrower {
    // Just for tracking, not really needed
    growths: usize,
    bytes: usize,
}

#[cfg(feature = "use_libc")]
impl SbrkHeapGrower {
    pub const fn new() -> Self {
        SbrkHeapGrower {
            growths: 0,
            bytes: 0,
        }
    }

    /// Number of successful `sbrk` calls that moved the break.
    pub fn growths(&self) -> usize {
        self.growths
    }

    /// Total bytes the break was moved by.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(feature = "use_libc")]
impl HeapGrower for SbrkHeapGrower {
    type Err = Errno;

    fn current_break(&mut self) -> *mut u8 {
        unsafe { libc::sbrk(0) as *mut u8 }
    }

    unsafe fn grow_heap(&mut self, size: usize) -> Result<*mut u8, Self::Err> {
        // sbrk takes a signed increment; anything larger would shrink the heap.
        let increment = match libc::intptr_t::try_from(size) {
            Ok(inc) => inc,
            Err(_) => return Err(Errno(libc::ENOMEM)),
        };

        let ptr = libc::sbrk(increment);
        if ptr as isize == -1 {
            return Err(errno::errno());
        }

        self.growths += 1;
        self.bytes += size;

        Ok(ptr as *mut u8)
    }
}

/// Why `release` refused a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseError {
    /// The block is already marked free.
    DoubleRelease { block: *const u8 },
    /// The header does not carry an in-use tag: the pointer did not come from
    /// this allocator, or its header was overwritten.
    UnknownTag { block: *const u8, tag: Tag },
}

impl fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ReleaseError::DoubleRelease { block } => {
                write!(f, "block at {:?} was already released", block)
            }
            ReleaseError::UnknownTag { block, tag } => write!(
                f,
                "block at {:?} carries tag {}, not an in-use tag",
                block, tag
            ),
        }
    }
}

/// A first-fit allocator over a single growable region.
///
/// Every allocation is a [`Block`]: a header followed by the payload. Blocks
/// are linked in the order they were carved, found again by a linear scan,
/// and reused whole. There is no splitting, no coalescing, and no alignment
/// beyond what the grower hands out.
///
/// Note: It never returns memory to its grower; that is not implemented.
pub struct Arena<G> {
    pub grower: G,
    pub blocks: BlockList,
}

impl<G: HeapGrower + Default> Default for Arena<G> {
    fn default() -> Self {
        Arena::new(G::default())
    }
}

impl<G> Arena<G> {
    /// Create a new, empty `Arena`. Nothing is requested from `grower` until
    /// the first allocation.
    pub const fn new(grower: G) -> Self {
        Arena {
            grower,
            blocks: BlockList::new(),
        }
    }

    /// Get statistics on this arena, and verify validity of the BlockList
    pub fn stats(&self) -> (Validity, Stats) {
        self.blocks.stats()
    }

    /// The payload size recorded for the block behind `ptr`.
    ///
    /// This is the size the block was carved with; it survives reuse and
    /// non-growing reallocation, so it can be larger than the last request.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this arena.
    pub unsafe fn capacity(&self, ptr: NonNull<u8>) -> usize {
        Block::from_user(ptr).size()
    }
}

impl<G: HeapGrower> Arena<G> {
    /// Carve a new block of `size` payload bytes from freshly grown heap, and
    /// link it after `last` if given.
    unsafe fn extend_heap(&mut self, last: Option<Block>, size: usize) -> Option<Block> {
        let needed = match HEADER_SIZE.checked_add(size) {
            Some(needed) => needed,
            None => {
                debug!("Block of {} bytes does not fit the address space", size);
                return None;
            }
        };

        let start = grow_contiguous(&mut self.grower, needed)?;
        let block = Block::init(start, size);
        if let Some(last) = last {
            last.set_next(Some(block));
        }

        trace!("Extended heap by {} bytes: {:?}", needed, block.as_ptr());
        Some(block)
    }

    ////////////////////////////////////////////////////////////
    // The allocation interface

    /// Allocate at least `size` bytes.
    ///
    /// Returns `None` for a zero size, or when the grower refuses to grow.
    ///
    /// # Safety
    ///
    /// The grower must uphold the `HeapGrower` contract. The returned memory
    /// is uninitialized.
    pub unsafe fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }

        let block = match self.blocks.base() {
            None => {
                let block = self.extend_heap(None, size)?;
                self.blocks.set_base(block);
                block
            }
            Some(_) => {
                let scan = self.blocks.find_free(size);
                match scan.found {
                    Some(block) => {
                        block.mark_reused();
                        trace!(
                            "Reusing block at {:?} ({} bytes) for {} bytes",
                            block.as_ptr(),
                            block.size(),
                            size
                        );
                        block
                    }
                    None => self.extend_heap(scan.last, size)?,
                }
            }
        };

        Some(block.user_ptr())
    }

    /// Allocate `count * elem_size` bytes, all zero.
    ///
    /// A product that overflows `usize` is refused with `None`.
    ///
    /// # Safety
    ///
    /// See [`allocate`](#method.allocate).
    pub unsafe fn zero_allocate(&mut self, count: usize, elem_size: usize) -> Option<NonNull<u8>> {
        let total = match count.checked_mul(elem_size) {
            Some(total) => total,
            None => {
                debug!("zero_allocate({}, {}) overflows", count, elem_size);
                return None;
            }
        };

        let ptr = self.allocate(total)?;
        ptr::write_bytes(ptr.as_ptr(), 0, total);
        Some(ptr)
    }

    /// Mark the block behind `ptr` free, checking that it is a live block
    /// handed out by this arena. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or point `HEADER_SIZE` bytes past readable
    /// memory. The tag check catches most stray pointers, but reading their
    /// "header" is itself only sound for readable memory.
    pub unsafe fn try_release(&mut self, ptr: Option<NonNull<u8>>) -> Result<(), ReleaseError> {
        let ptr = match ptr {
            None => return Ok(()),
            Some(ptr) => ptr,
        };

        let block = Block::from_user(ptr);
        let header = block.header();
        if header.is_free() {
            return Err(ReleaseError::DoubleRelease {
                block: block.as_ptr(),
            });
        }
        if !header.tag.is_in_use() {
            return Err(ReleaseError::UnknownTag {
                block: block.as_ptr(),
                tag: header.tag,
            });
        }

        block.mark_freed();
        trace!("Released block at {:?} ({} bytes)", block.as_ptr(), header.size);
        Ok(())
    }

    /// Release the block behind `ptr`. `None` is a no-op.
    ///
    /// Panics on a double release or on a pointer whose header is not tagged
    /// in-use: either means the heap bookkeeping can no longer be trusted.
    ///
    /// # Safety
    ///
    /// See [`try_release`](#method.try_release). The payload must not be used
    /// afterwards.
    pub unsafe fn release(&mut self, ptr: Option<NonNull<u8>>) {
        if let Err(err) = self.try_release(ptr) {
            panic!("invalid release: {}", err);
        }
    }

    /// Resize the allocation behind `ptr` to at least `size` bytes.
    ///
    /// - `None` behaves like `allocate(size)`.
    /// - If the block already holds `size` bytes, `ptr` is returned as is and
    ///   the block keeps its recorded size.
    /// - Otherwise a new block is allocated, the old payload copied over in
    ///   full, and the old block released. If that allocation fails, `None`
    ///   is returned and `ptr` stays valid and untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or a live pointer returned by this arena. On
    /// success with a new address, the old pointer must not be used again.
    pub unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let ptr = match ptr {
            None => return self.allocate(size),
            Some(ptr) => ptr,
        };

        let old_size = Block::from_user(ptr).size();
        if old_size >= size {
            return Some(ptr);
        }

        let new_ptr = self.allocate(size)?;
        ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_size);
        self.release(Some(ptr));
        Some(new_ptr)
    }
}

pub const TOY_HEAP_SIZE: usize = 256 * 1024;

/// A fixed-size, in-memory stand-in for the program break.
///
/// The array comes first so it starts on the struct's 16-byte alignment.
#[repr(C, align(16))]
pub struct ToyHeap {
    pub heap: [u8; TOY_HEAP_SIZE],
    /// Current break, as an offset into `heap`.
    pub size: usize,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            heap: [0; TOY_HEAP_SIZE],
            size: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

impl fmt::Display for ToyHeapOverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "toy heap cannot grow by {} bytes, {} left",
            self.requested, self.available
        )
    }
}

impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    fn current_break(&mut self) -> *mut u8 {
        unsafe { self.heap.as_mut_ptr().add(self.size) }
    }

    unsafe fn grow_heap(&mut self, size: usize) -> Result<*mut u8, Self::Err> {
        let available = self.heap.len() - self.size;
        if size > available {
            return Err(ToyHeapOverflowError {
                requested: size,
                available,
            });
        }

        let ptr = self.heap.as_mut_ptr().add(self.size);
        self.size += size;
        Ok(ptr)
    }
}
