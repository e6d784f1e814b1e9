#![cfg_attr(not(test), no_std)]

//! A minimal first-fit allocator on top of the program break.
//!
//! Every allocation is a block: a small header followed by the payload, carved
//! from the end of the heap by moving the break up. Blocks are kept in one
//! singly-linked list in the order they were carved. Released blocks are
//! marked free and handed out again, whole, to the first later request they
//! can hold.
//!
//! ```text
//!   base
//!    │
//!    ▼
//!   ┌────────┬──────────┐   ┌────────┬──────┐   ┌────────┬────────────┐
//!   │ header │ payload  │──▶│ header │ pay. │──▶│ header │  payload   │──▶ ∅
//!   └────────┴──────────┘   └────────┴──────┘   └────────┴────────────┘
//!            ▲                                                         ▲
//!            └── pointer handed to the caller                 program break
//! ```
//!
//! The allocator deliberately stays simple: it never splits or merges
//! blocks, never aligns beyond what the break provides, never returns memory
//! to the OS, and is not thread-safe. [`Arena`](allocators/struct.Arena.html)
//! is the allocator itself; [`global`](global/index.html) wraps one arena on
//! the real program break behind C-style functions.

pub mod allocators;
pub mod blocklist;
pub mod bump;
#[cfg(any(
    feature = "use_libc",
    all(target_os = "linux", target_arch = "x86_64")
))]
pub mod global;
#[cfg(all(
    not(feature = "use_libc"),
    target_os = "linux",
    target_arch = "x86_64"
))]
pub mod unix;

#[cfg(feature = "use_libc")]
pub use allocators::SbrkHeapGrower;
pub use allocators::{Arena, HeapGrower, ReleaseError, ToyHeap};
pub use blocklist::{Block, BlockList, Stats, Tag, Validity, HEADER_SIZE};
pub use bump::BumpAlloc;
