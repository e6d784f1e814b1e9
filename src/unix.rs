//! A program-break grower that talks to the kernel directly, for builds
//! without `libc`.
//!
//! Linux has no `sbrk` system call, only `brk(addr)`: it asks for the break to
//! be moved to `addr` and returns the break afterwards. Passing an address
//! the kernel will not honour (0, for instance) returns the current break
//! unchanged, which is how the break is read.

use core::arch::asm;
use core::fmt;

use crate::allocators::HeapGrower;

//============================================================
// System call code
const SYS_BRK: usize = 12;

/// Issue `brk(addr)`, returning the break after the call.
///
/// # Safety
///
/// Moving the break down releases memory that may still be in use.
unsafe fn brk(addr: usize) -> usize {
    let ret: usize;
    asm!(
        "syscall",
        inlateout("rax") SYS_BRK => ret,
        in("rdi") addr,
        lateout("rcx") _,
        lateout("r11") _,
        options(nostack),
    );
    ret
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrkError {
    pub requested: usize,
    /// The break the kernel left in place.
    pub current: usize,
}

impl fmt::Display for BrkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "brk refused to grow by {} bytes from {:#x}",
            self.requested, self.current
        )
    }
}

/// SyscallHeapGrower moves the program break with raw `brk` system calls.
#[derive(Default, Debug)]
pub struct SyscallHeapGrower {
    // Just for tracking, not really needed
    growths: usize,
    bytes: usize,
}

impl SyscallHeapGrower {
    pub const fn new() -> Self {
        SyscallHeapGrower {
            growths: 0,
            bytes: 0,
        }
    }

    pub fn growths(&self) -> usize {
        self.growths
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl HeapGrower for SyscallHeapGrower {
    type Err = BrkError;

    fn current_break(&mut self) -> *mut u8 {
        unsafe { brk(0) as *mut u8 }
    }

    unsafe fn grow_heap(&mut self, size: usize) -> Result<*mut u8, Self::Err> {
        let current = brk(0);
        let target = match current.checked_add(size) {
            Some(target) => target,
            None => {
                return Err(BrkError {
                    requested: size,
                    current,
                })
            }
        };

        // On failure the kernel leaves the break where it was.
        let new = brk(target);
        if new < target {
            return Err(BrkError {
                requested: size,
                current: new,
            });
        }

        self.growths += 1;
        self.bytes += size;

        Ok(current as *mut u8)
    }
}
