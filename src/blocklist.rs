use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use static_assertions::{const_assert, const_assert_ne};

/// A diagnostic marker stored in every block header.
///
/// Tags never drive allocation decisions; they only exist so that `release`
/// can tell a pointer this allocator handed out from a stray or corrupted one.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct Tag(pub u32);

impl Tag {
    /// Written when a block is carved from freshly grown heap.
    pub const EXTENDED: Tag = Tag(0x1234_5678);
    /// Written when a free block is handed out again.
    pub const REUSED: Tag = Tag(0x7777_7777);
    /// Written when a block is released.
    pub const FREED: Tag = Tag(0x5555_5555);

    /// True for the two tags a live (in-use) block may carry.
    pub fn is_in_use(self) -> bool {
        self == Tag::EXTENDED || self == Tag::REUSED
    }

    pub fn is_known(self) -> bool {
        self.is_in_use() || self == Tag::FREED
    }
}

const_assert_ne!(Tag::EXTENDED.0, Tag::REUSED.0);
const_assert_ne!(Tag::EXTENDED.0, Tag::FREED.0);
const_assert_ne!(Tag::REUSED.0, Tag::FREED.0);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Tag::EXTENDED => write!(f, "extended"),
            Tag::REUSED => write!(f, "reused"),
            Tag::FREED => write!(f, "freed"),
            Tag(other) => write!(f, "unknown({:#010x})", other),
        }
    }
}

/// The metadata record placed immediately before every payload.
///
/// `size` is the payload size that was requested when the block was carved
/// from the heap, not including the header. It never changes afterwards, even
/// when the block is reused for a smaller request.
///
/// Payload sizes are not padded, so a header can start at any address. All
/// reads and writes of a header go through `read_unaligned` /
/// `write_unaligned`.
///
/// `free` is a plain byte rather than a `bool`: `release` reads headers of
/// pointers it did not hand out, and every bit pattern must be a valid value
/// there. Any nonzero byte counts as free.
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct BlockHeader {
    pub size: usize,
    pub next: Option<Block>,
    pub free: u8,
    pub tag: Tag,
}

impl BlockHeader {
    pub const IN_USE: u8 = 0;
    pub const FREE: u8 = 1;

    pub fn is_free(&self) -> bool {
        self.free != BlockHeader::IN_USE
    }
}

/// Width of the metadata record that precedes every user pointer.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

// The `next` link must stay a single nullable pointer.
const_assert!(mem::size_of::<Option<Block>>() == mem::size_of::<usize>());
const_assert!(HEADER_SIZE >= 2 * mem::size_of::<usize>() + mem::size_of::<u32>());

/// A handle to a block header living inside the managed heap.
///
/// Blocks are never unlinked or moved, so handles are plain copies of the
/// header address. A `Block` is only ever constructed for an address that
/// holds an initialized header (see [`Block::init`] and [`Block::from_user`]).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

// Blocks are only ever touched by whoever owns the list they belong to, so
// moving the whole chain to another thread is fine. Nothing here is Sync.
unsafe impl Send for Block {}

impl Block {
    /// Write a fresh in-use header at `ptr` describing a payload of `size`
    /// bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least `HEADER_SIZE + size` writable bytes that
    /// no other code is using.
    pub unsafe fn init(ptr: NonNull<u8>, size: usize) -> Block {
        let header = BlockHeader {
            size,
            next: None,
            free: BlockHeader::IN_USE,
            tag: Tag::EXTENDED,
        };
        let header_ptr: NonNull<BlockHeader> = ptr.cast();
        ptr::write_unaligned(header_ptr.as_ptr(), header);
        Block { header: header_ptr }
    }

    /// Recover the block that owns the payload at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` should have been produced by [`Block::user_ptr`]. Anything else
    /// makes the returned handle point at arbitrary memory, which is only
    /// sound to read if `HEADER_SIZE` bytes before `ptr` are readable.
    ///
    /// Panics if `ptr` is too low in the address space to follow a header.
    pub unsafe fn from_user(ptr: NonNull<u8>) -> Block {
        assert!(
            ptr.as_ptr() as usize > HEADER_SIZE,
            "pointer {:?} is too low to follow a block header",
            ptr
        );
        let header = ptr.as_ptr().wrapping_sub(HEADER_SIZE) as *mut BlockHeader;
        Block {
            header: NonNull::new_unchecked(header),
        }
    }

    /// The address handed to callers: the first byte past the header.
    pub fn user_ptr(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(HEADER_SIZE)) }
    }

    pub fn as_ptr(self) -> *const u8 {
        self.header.as_ptr() as *const u8
    }

    /// A copy of the header.
    pub fn header(self) -> BlockHeader {
        unsafe { ptr::read_unaligned(self.header.as_ptr()) }
    }

    pub fn size(self) -> usize {
        self.header().size
    }

    pub fn next(self) -> Option<Block> {
        self.header().next
    }

    pub fn is_free(self) -> bool {
        self.header().is_free()
    }

    pub fn tag(self) -> Tag {
        self.header().tag
    }

    /// Read-modify-write the header.
    ///
    /// # Safety
    ///
    /// Changing `size` or `next` can break the list. Callers must keep
    /// `next` pointing at a valid block (or `None`) and leave `size` alone.
    unsafe fn update<F: FnOnce(&mut BlockHeader)>(self, f: F) {
        let mut header = self.header();
        f(&mut header);
        ptr::write_unaligned(self.header.as_ptr(), header);
    }

    /// Link `next` after this block.
    ///
    /// # Safety
    ///
    /// `next` must be a block of the same list, or `None`.
    pub unsafe fn set_next(self, next: Option<Block>) {
        self.update(|h| h.next = next);
    }

    /// Hand a free block out again.
    ///
    /// # Safety
    ///
    /// The caller takes over the payload; nothing else may be using it.
    pub unsafe fn mark_reused(self) {
        self.update(|h| {
            h.free = BlockHeader::IN_USE;
            h.tag = Tag::REUSED;
        });
    }

    /// # Safety
    ///
    /// The payload must no longer be used by anyone.
    pub unsafe fn mark_freed(self) {
        self.update(|h| {
            h.free = BlockHeader::FREE;
            h.tag = Tag::FREED;
        });
    }
}

/// The result of a first-fit scan.
#[derive(Copy, Clone, Debug, Default)]
pub struct Scan {
    /// The first free block large enough, if any.
    pub found: Option<Block>,
    /// The last block visited before stopping. When nothing was found this is
    /// the tail of the list, which is where a new block gets linked.
    pub last: Option<Block>,
}

/// A `BlockList` is the singly-linked list of every block an arena has ever
/// carved, in the order they were carved.
///
/// The list is append-only: blocks are marked free and later reused in
/// place, but never unlinked, split or merged. It maintains a few invariants:
///
/// - `base` is `None` until the first block is carved, and never changes
///   afterwards.
/// - Each block links to the block carved right after it; the tail links to
///   `None`.
/// - A block is free (nonzero `free` byte) exactly when the tag is
///   [`Tag::FREED`].
#[derive(Default)]
pub struct BlockList {
    base: Option<Block>,
}

pub struct BlockIter<'list> {
    next: Option<Block>,
    _list: PhantomData<&'list BlockList>,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        self.next = block.next();
        Some(block)
    }
}

impl<'list> IntoIterator for &'list BlockList {
    type Item = Block;
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for BlockList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            let header = block.header();
            write!(
                f,
                "Block({:?}, {}, {})",
                block.as_ptr(),
                header.size,
                header.tag
            )?;
        }

        write!(f, ")")
    }
}

/// Validity counts every inconsistent header found in a `BlockList`.
#[derive(Default, Debug)]
pub struct Validity {
    /// Blocks whose tag is none of the three sentinels.
    ///
    /// This indicates corruption: some code wrote over a header.
    pub unknown_tags: usize,

    /// Blocks whose `free` flag disagrees with their tag: free but not tagged
    /// FREED, or in use but tagged FREED.
    pub flag_mismatches: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.unknown_tags == 0 && self.flag_mismatches == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Number of blocks in the list.
    pub length: usize,
    pub in_use: usize,
    pub free: usize,
    /// Sum of all payload sizes, excluding headers.
    pub payload: usize,
    /// Sum of the payload sizes of free blocks.
    pub free_payload: usize,
}

impl Stats {
    /// Bytes of heap covered by the list, headers included.
    pub fn heap_bytes(&self) -> usize {
        self.length * HEADER_SIZE + self.payload
    }
}

impl BlockList {
    pub const fn new() -> Self {
        BlockList { base: None }
    }

    pub const fn header_size() -> usize {
        HEADER_SIZE
    }

    /// The first block ever carved, if any.
    pub fn base(&self) -> Option<Block> {
        self.base
    }

    /// Adopt the first block. Only valid while the list is empty.
    pub(crate) fn set_base(&mut self, block: Block) {
        assert!(self.base.is_none(), "the base block can only be set once");
        self.base = Some(block);
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            next: self.base,
            _list: PhantomData,
        }
    }

    /// First-fit search: the first block in list order that is free and at
    /// least `size` bytes large.
    ///
    /// No splitting happens here; a block larger than `size` is returned
    /// whole.
    pub fn find_free(&self, size: usize) -> Scan {
        let mut last = None;
        for block in self {
            let header = block.header();
            if header.is_free() && header.size >= size {
                return Scan {
                    found: Some(block),
                    last,
                };
            }
            last = Some(block);
        }

        Scan { found: None, last }
    }

    /// Check current size of the list, and whether its headers are
    /// consistent.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        for block in self {
            let header = block.header();
            if !header.tag.is_known() {
                validity.unknown_tags += 1;
            } else if header.is_free() != (header.tag == Tag::FREED) {
                validity.flag_mismatches += 1;
            }

            stats.length += 1;
            stats.payload += header.size;
            if header.is_free() {
                stats.free += 1;
                stats.free_payload += header.size;
            } else {
                stats.in_use += 1;
            }
        }

        (validity, stats)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_env_log::test;

    #[repr(C, align(16))]
    struct Buffer([u8; 512]);

    // Carve blocks of the given sizes back to back out of `buf`, linked in
    // order, the way the arena would.
    fn carve(buf: &mut Buffer, sizes: &[usize]) -> BlockList {
        let mut list = BlockList::new();
        let mut offset = 0;
        let mut last: Option<Block> = None;
        for &size in sizes {
            let block = unsafe {
                let ptr = NonNull::new_unchecked(buf.0.as_mut_ptr().add(offset));
                Block::init(ptr, size)
            };
            match last {
                None => list.set_base(block),
                Some(prev) => unsafe { prev.set_next(Some(block)) },
            }
            last = Some(block);
            offset += HEADER_SIZE + size;
        }
        list
    }

    #[test]
    fn test_header_round_trip_unaligned() {
        let mut buf = Buffer([0; 512]);
        // 13 bytes of payload puts the second header at an odd address.
        let list = carve(&mut buf, &[13, 7]);
        let blocks: [Block; 2] = {
            let mut it = list.iter();
            [it.next().unwrap(), it.next().unwrap()]
        };

        assert_eq!(blocks[1].as_ptr() as usize % 2, 1);
        assert_eq!(blocks[1].size(), 7);
        assert_eq!(blocks[1].tag(), Tag::EXTENDED);
        assert!(!blocks[1].is_free());
        assert_eq!(blocks[0].next(), Some(blocks[1]));
        assert_eq!(blocks[1].next(), None);

        unsafe { blocks[1].mark_freed() };
        assert!(blocks[1].is_free());
        assert_eq!(blocks[1].tag(), Tag::FREED);
        assert_eq!(blocks[1].size(), 7);
    }

    #[test]
    fn test_user_ptr_steps_over_header() {
        let mut buf = Buffer([0; 512]);
        let list = carve(&mut buf, &[32]);
        let block = list.base().unwrap();

        let user = block.user_ptr();
        assert_eq!(user.as_ptr() as usize - block.as_ptr() as usize, HEADER_SIZE);
        assert_eq!(unsafe { Block::from_user(user) }, block);
    }

    #[test]
    #[should_panic(expected = "too low to follow a block header")]
    fn test_from_user_rejects_low_pointer() {
        unsafe {
            let low = NonNull::new_unchecked(HEADER_SIZE as *mut u8);
            Block::from_user(low);
        }
    }

    #[test]
    fn test_find_free_first_fit() {
        let mut buf = Buffer([0; 512]);
        let list = carve(&mut buf, &[16, 64, 32, 64]);
        let blocks: [Block; 4] = {
            let mut it = list.iter();
            [
                it.next().unwrap(),
                it.next().unwrap(),
                it.next().unwrap(),
                it.next().unwrap(),
            ]
        };

        // Nothing is free yet: no match, and the scan ends on the tail.
        let scan = list.find_free(8);
        assert!(scan.found.is_none());
        assert_eq!(scan.last, Some(blocks[3]));

        unsafe {
            blocks[1].mark_freed();
            blocks[2].mark_freed();
            blocks[3].mark_freed();
        }

        // The first free block that fits wins, not the tightest one.
        let scan = list.find_free(20);
        assert_eq!(scan.found, Some(blocks[1]));
        assert_eq!(scan.last, Some(blocks[0]));

        let scan = list.find_free(64);
        assert_eq!(scan.found, Some(blocks[1]));

        let scan = list.find_free(65);
        assert!(scan.found.is_none());
        assert_eq!(scan.last, Some(blocks[3]));
    }

    #[test]
    fn test_find_free_on_empty_list() {
        let list = BlockList::default();
        let scan = list.find_free(1);
        assert!(scan.found.is_none());
        assert!(scan.last.is_none());
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_stats() {
        let mut buf = Buffer([0; 512]);
        let list = carve(&mut buf, &[16, 40, 8]);
        let second = list.iter().nth(1).unwrap();
        unsafe { second.mark_freed() };

        let (validity, stats) = list.stats();
        assert!(validity.is_valid());
        assert_eq!(
            stats,
            Stats {
                length: 3,
                in_use: 2,
                free: 1,
                payload: 64,
                free_payload: 40,
            }
        );
        assert_eq!(stats.heap_bytes(), 3 * HEADER_SIZE + 64);

        unsafe { second.mark_reused() };
        let (validity, stats) = list.stats();
        assert!(validity.is_valid());
        assert_eq!(stats.free, 0);
        log::info!("{}", list);
    }

    #[test]
    fn test_stats_flags_corruption() {
        let mut buf = Buffer([0; 512]);
        let list = carve(&mut buf, &[16, 16]);
        let (first, second) = {
            let mut it = list.iter();
            (it.next().unwrap(), it.next().unwrap())
        };

        unsafe {
            first.update(|h| h.tag = Tag(0xdead_beef));
            second.update(|h| h.free = 2);
        }

        let (validity, _) = list.stats();
        assert_eq!(validity.unknown_tags, 1);
        assert_eq!(validity.flag_mismatches, 1);
        assert!(!bool::from(validity));
    }

    #[test]
    fn test_display() {
        let mut buf = Buffer([0; 512]);
        let list = carve(&mut buf, &[4]);
        let shown = std::format!("{}", list);
        assert!(shown.starts_with("BlockList(Block("));
        assert!(shown.ends_with(", 4, extended))"));
        assert_eq!(std::format!("{}", Tag(1)), "unknown(0x00000001)");
    }
}
