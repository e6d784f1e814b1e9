//! One arena for the whole process, on the real program break.
//!
//! These functions mirror the classic C surface: plain pointers in and out,
//! with null standing for "absent". The arena sits behind a spin lock, which
//! serialises callers of this module only. Anything else that moves the
//! program break concurrently (another allocator, a raw `sbrk` call) breaks
//! the contiguity check and panics.

use core::ptr::{null_mut, NonNull};

use spin::Mutex;

use crate::allocators::Arena;
#[cfg(feature = "use_libc")]
use crate::allocators::SbrkHeapGrower;
use crate::blocklist::{Stats, Validity};
#[cfg(not(feature = "use_libc"))]
use crate::unix::SyscallHeapGrower;

#[cfg(feature = "use_libc")]
pub type DefaultGrower = SbrkHeapGrower;

#[cfg(not(feature = "use_libc"))]
pub type DefaultGrower = SyscallHeapGrower;

static HEAP: Mutex<Arena<DefaultGrower>> = Mutex::new(Arena::new(DefaultGrower::new()));

fn into_raw(ptr: Option<NonNull<u8>>) -> *mut u8 {
    ptr.map_or(null_mut(), NonNull::as_ptr)
}

/// Allocate at least `size` bytes; null for a zero size or when the break
/// cannot grow.
///
/// # Safety
///
/// Nothing else may move the program break while this runs.
pub unsafe fn allocate(size: usize) -> *mut u8 {
    into_raw(HEAP.lock().allocate(size))
}

/// Allocate `count * elem_size` zeroed bytes; null on failure or overflow.
///
/// # Safety
///
/// See [`allocate`](fn.allocate.html).
pub unsafe fn zero_allocate(count: usize, elem_size: usize) -> *mut u8 {
    into_raw(HEAP.lock().zero_allocate(count, elem_size))
}

/// Resize `ptr` (which may be null) to at least `size` bytes. Null on
/// failure, in which case `ptr` is still valid.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by this module.
pub unsafe fn reallocate(ptr: *mut u8, size: usize) -> *mut u8 {
    into_raw(HEAP.lock().reallocate(NonNull::new(ptr), size))
}

/// Release `ptr`. Null is a no-op; a double release or a foreign pointer
/// panics.
///
/// # Safety
///
/// `ptr` must be null or a pointer returned by this module, and must not be
/// used afterwards.
pub unsafe fn release(ptr: *mut u8) {
    HEAP.lock().release(NonNull::new(ptr))
}

/// Statistics on the process-wide arena.
pub fn stats() -> (Validity, Stats) {
    HEAP.lock().stats()
}
