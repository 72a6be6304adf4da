//! # Persistent linked list
//!
//! A doubly-linked deque stored entirely in a block buffer.  There are no
//! in-memory node objects: the links are 64-bit block ids, and the block
//! buffer is the arena they index.
//!
//! ## On-disk layout
//!
//! The first allocated block (id 0) is the metadata block:
//!
//!   metadata (24 bytes):
//!     magic:   'P' 'L' 'L' '\n'
//!     version: int32  (currently 3)
//!     head:    int64  (block id, or END_PTR)
//!     tail:    int64  (block id, or END_PTR)
//!
//! Every other allocated block is one entry:
//!
//!   entry (24 + max(0, data_size) bytes):
//!     next:      int64  (block id, or END_PTR)
//!     prev:      int64  (block id, or END_PTR)
//!     data_size: int64  (-1 encodes a null element)
//!     payload:   uint8[data_size]  (serializer output)
//!
//! All integers are big-endian.  The sentinel [`END_PTR`] (−2) terminates
//! the head and tail chains.
//!
//! ## Crash consistency
//!
//! Every mutation is bracketed by two barriers.  An insert writes the whole
//! entry, issues `barrier(false)` so the entry is durably ordered before
//! anything points at it, rewires the one or two neighboring pointers, and
//! issues `barrier(true)`.  A removal rewires the neighbors, issues
//! `barrier(false)`, deallocates the entry block, and issues
//! `barrier(true)`.  A crash therefore leaves at most one partially applied
//! pointer rewire and at most one allocated-but-unreferenced block, which
//! is exactly the envelope the open-time recovery walk repairs.  Anything
//! outside that envelope aborts the open with a corruption error; there is
//! no silent data loss.
//!
//! `set` is the exception: it is remove followed by insert, and a crash
//! between the halves degrades to "removed" (documented on the method).

use std::collections::BTreeSet;
use std::io;
use std::marker::PhantomData;
use std::path::Path;

use bytes::{BufMut, BytesMut};
use snafu::{ensure, ResultExt, Snafu};

use crate::block::{BlockError, DynamicBlockBuffer, PersistentBlockBuffer};
use crate::buffer::{ProtectionLevel, TwoCopyBarrierBuffer, TwoCopyConfigBuilder};
use crate::serialize::{Persistable, Serializer};

#[cfg(test)]
mod tests;

/// Sentinel pointer meaning "end of chain".
pub const END_PTR: i64 = -2;

const MAGIC: [u8; 4] = *b"PLL\n";
const VERSION: i32 = 3;

/// Metadata block size: magic + version + head + tail.
const METADATA_SIZE: u64 = 24;
const META_MAGIC_OFFSET: u64 = 0;
const META_VERSION_OFFSET: u64 = 4;
const META_HEAD_OFFSET: u64 = 8;
const META_TAIL_OFFSET: u64 = 16;

/// Entry header size: next + prev + data_size.
const ENTRY_HEADER_SIZE: u64 = 24;
const NEXT_OFFSET: u64 = 0;
const PREV_OFFSET: u64 = 8;
const DATA_SIZE_OFFSET: u64 = 16;

/// `data_size` encoding of a null element.
const NULL_DATA_SIZE: i64 = -1;

/// Error that occurred during list operations or open-time recovery.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ListError {
    /// The underlying block buffer failed.
    #[snafu(display("list block buffer error: {source}"))]
    Block { source: BlockError },

    /// An element serializer failed.
    #[snafu(display("element serializer error: {source}"))]
    Element { source: io::Error },

    /// The metadata block does not start with the list magic.
    #[snafu(display("bad file magic {found:?}; not a persistent list file"))]
    BadMagic { found: [u8; 4] },

    /// The metadata block carries an unknown format version.
    #[snafu(display("unsupported file version {found} (expected {VERSION})"))]
    UnsupportedVersion { found: i32 },

    /// The buffer has blocks but no metadata block, or is empty on a
    /// read-only open.
    #[snafu(display("no metadata block found"))]
    MetadataMissing,

    /// A head, tail, next, or prev pointer references a block that is not
    /// allocated.
    #[snafu(display("{role} pointer {pointer} does not reference an allocated block"))]
    DanglingPointer { pointer: i64, role: &'static str },

    /// An entry's back link disagrees with the chain being walked.
    #[snafu(display(
        "entry {id} has prev pointer {found}, expected {expected}"
    ))]
    WrongBackLink { id: i64, expected: i64, found: i64 },

    /// The forward walk revisited a block.
    #[snafu(display("cycle detected at block {id}"))]
    CycleDetected { id: i64 },

    /// More than one allocated block is unreachable from the list: beyond
    /// the single-interrupted-operation envelope, so not recoverable.
    #[snafu(display("{count} allocated blocks are unreferenced by the list"))]
    UnreferencedBlocks { count: u64 },

    /// The structure needs a repair that a read-only open cannot apply.
    #[snafu(display("list needs repair ({detail}), but was opened read-only"))]
    RepairNeeded { detail: &'static str },

    /// The structure violates a list invariant in a way recovery cannot
    /// repair.
    #[snafu(display("list structure is corrupt: {detail}"))]
    Corrupt { detail: &'static str },

    /// A mutation was attempted on a read-only list.
    #[snafu(display("list is read-only"))]
    ReadOnly,

    /// An index was at or beyond the list length.
    #[snafu(display("index {index} is out of bounds for list of length {len}"))]
    IndexOutOfBounds { index: u64, len: u64 },
}

impl From<crate::buffer::BufferError> for ListError {
    fn from(source: crate::buffer::BufferError) -> ListError {
        ListError::Block {
            source: BlockError::Buffer { source },
        }
    }
}

/// A persistent doubly-linked deque over a block buffer.
///
/// Elements are `Option<T>`: `None` is the persistent null, stored without
/// invoking the serializer.  Index-based operations walk from the nearer
/// end, so they are O(n/2) expected.
pub struct PersistentLinkedList<T, B: PersistentBlockBuffer> {
    blocks: B,
    serializer: Box<dyn Serializer<T>>,
    metadata_id: u64,
    head: i64,
    tail: i64,
    len: u64,
    read_only: bool,
    _element: PhantomData<fn() -> T>,
}

impl<T: Persistable> PersistentLinkedList<T, DynamicBlockBuffer<TwoCopyBarrierBuffer>>
where
    T::Serializer: 'static,
{
    /// Opens a list at `path` on the crash-safe default stack: a two-copy
    /// barrier buffer under a dynamic block allocator.
    pub fn open_path<P: AsRef<Path>>(
        path: P,
        protection: ProtectionLevel,
    ) -> Result<Self, ListError> {
        let config = TwoCopyConfigBuilder::new()
            .protection(protection)
            .build()
            .expect("default two-copy configuration is valid");
        let buffer = TwoCopyBarrierBuffer::open(path, config)?;
        let blocks = DynamicBlockBuffer::open(buffer).context(BlockSnafu)?;
        Self::open(blocks, protection == ProtectionLevel::ReadOnly)
    }
}

impl<T, B: PersistentBlockBuffer> PersistentLinkedList<T, B> {
    /// Opens a list over `blocks` with the built-in serializer for `T`.
    pub fn open(blocks: B, read_only: bool) -> Result<Self, ListError>
    where
        T: Persistable,
        T::Serializer: 'static,
    {
        Self::open_with_serializer(blocks, Box::new(T::serializer()), read_only)
    }

    /// Opens a list over `blocks` with an explicit serializer.
    ///
    /// An empty buffer is initialized with a fresh metadata block (unless
    /// read-only); anything else is verified, and crash-interrupted
    /// mutations inside the single-operation envelope are repaired before
    /// the list is returned.
    pub fn open_with_serializer(
        mut blocks: B,
        serializer: Box<dyn Serializer<T>>,
        read_only: bool,
    ) -> Result<Self, ListError> {
        let first = blocks.iterate_block_ids().next().transpose().context(BlockSnafu)?;
        match first {
            None => {
                ensure!(!read_only, MetadataMissingSnafu);
                let metadata_id = blocks.allocate(METADATA_SIZE).context(BlockSnafu)?;
                blocks
                    .put(metadata_id, META_MAGIC_OFFSET, &MAGIC)
                    .context(BlockSnafu)?;
                blocks
                    .put(metadata_id, META_VERSION_OFFSET, &VERSION.to_be_bytes())
                    .context(BlockSnafu)?;
                blocks
                    .put_i64(metadata_id, META_HEAD_OFFSET, END_PTR)
                    .context(BlockSnafu)?;
                blocks
                    .put_i64(metadata_id, META_TAIL_OFFSET, END_PTR)
                    .context(BlockSnafu)?;
                blocks.barrier(true).context(BlockSnafu)?;
                debug!(metadata_id, "Initialized fresh persistent list.");
                Ok(PersistentLinkedList {
                    blocks,
                    serializer,
                    metadata_id,
                    head: END_PTR,
                    tail: END_PTR,
                    len: 0,
                    read_only,
                    _element: PhantomData,
                })
            }
            Some(metadata_id) => {
                Self::recover(blocks, serializer, read_only, metadata_id)
            }
        }
    }

    /// Verifies the on-disk structure and repairs a single interrupted
    /// mutation, per the crash-consistency envelope in the module docs.
    fn recover(
        mut blocks: B,
        serializer: Box<dyn Serializer<T>>,
        read_only: bool,
        metadata_id: u64,
    ) -> Result<Self, ListError> {
        // Magic and version first; nothing else is trustworthy otherwise.
        let mut magic = [0u8; 4];
        blocks
            .get(metadata_id, META_MAGIC_OFFSET, &mut magic)
            .context(BlockSnafu)?;
        ensure!(magic == MAGIC, BadMagicSnafu { found: magic });
        let mut version = [0u8; 4];
        blocks
            .get(metadata_id, META_VERSION_OFFSET, &mut version)
            .context(BlockSnafu)?;
        let version = i32::from_be_bytes(version);
        ensure!(version == VERSION, UnsupportedVersionSnafu { found: version });

        // Every allocated block other than the metadata block must be
        // reachable from the walk below, bar at most one orphan.
        let mut unseen = BTreeSet::new();
        for id in blocks.iterate_block_ids() {
            let id = id.context(BlockSnafu)?;
            if id != metadata_id {
                unseen.insert(id);
            }
        }

        let mut head = blocks
            .get_i64(metadata_id, META_HEAD_OFFSET)
            .context(BlockSnafu)?;
        let mut tail = blocks
            .get_i64(metadata_id, META_TAIL_OFFSET)
            .context(BlockSnafu)?;
        let mut meta_dirty = false;
        // A crash loses at most one pointer write; needing a second pointer
        // repair means the file is outside the recoverable envelope.
        let mut pointer_repairs = 0u32;

        let references_allocated = |unseen: &BTreeSet<u64>, pointer: i64| {
            pointer >= 0 && unseen.contains(&as_block_id(pointer))
        };
        ensure!(
            head == END_PTR || references_allocated(&unseen, head),
            DanglingPointerSnafu {
                pointer: head,
                role: "head",
            }
        );
        ensure!(
            tail == END_PTR || references_allocated(&unseen, tail),
            DanglingPointerSnafu {
                pointer: tail,
                role: "tail",
            }
        );

        // Exactly one of head/tail updated before the crash: the survivor
        // must be a singleton, and the stale side follows it.
        if (head == END_PTR) != (tail == END_PTR) {
            ensure!(!read_only, RepairNeededSnafu { detail: "half-updated head/tail" });
            let survivor = if head == END_PTR { tail } else { head };
            let id = as_block_id(survivor);
            let entry_prev = blocks.get_i64(id, PREV_OFFSET).context(BlockSnafu)?;
            let entry_next = blocks.get_i64(id, NEXT_OFFSET).context(BlockSnafu)?;
            ensure!(
                entry_prev == END_PTR && entry_next == END_PTR,
                CorruptSnafu {
                    detail: "half-updated head/tail does not reference a singleton",
                }
            );
            info!(survivor, "Repairing half-updated head/tail pointers.");
            head = survivor;
            tail = survivor;
            meta_dirty = true;
            pointer_repairs += 1;
        }

        // An interrupted push at either end may have linked the new entry
        // in without the head/tail update landing.  Adopt it when it is
        // fully consistent.
        if head != END_PTR {
            let before_head = blocks
                .get_i64(as_block_id(head), PREV_OFFSET)
                .context(BlockSnafu)?;
            if before_head != END_PTR {
                ensure!(
                    references_allocated(&unseen, before_head),
                    DanglingPointerSnafu {
                        pointer: before_head,
                        role: "head prev",
                    }
                );
                let id = as_block_id(before_head);
                let entry_prev = blocks.get_i64(id, PREV_OFFSET).context(BlockSnafu)?;
                let entry_next = blocks.get_i64(id, NEXT_OFFSET).context(BlockSnafu)?;
                ensure!(
                    entry_prev == END_PTR && entry_next == head,
                    CorruptSnafu {
                        detail: "block before head is not a consistent front entry",
                    }
                );
                ensure!(!read_only, RepairNeededSnafu { detail: "stale head pointer" });
                info!(old_head = head, new_head = before_head, "Repairing stale head pointer.");
                head = before_head;
                meta_dirty = true;
                pointer_repairs += 1;
            }

            let after_tail = blocks
                .get_i64(as_block_id(tail), NEXT_OFFSET)
                .context(BlockSnafu)?;
            if after_tail != END_PTR {
                ensure!(
                    references_allocated(&unseen, after_tail),
                    DanglingPointerSnafu {
                        pointer: after_tail,
                        role: "tail next",
                    }
                );
                let id = as_block_id(after_tail);
                let entry_prev = blocks.get_i64(id, PREV_OFFSET).context(BlockSnafu)?;
                let entry_next = blocks.get_i64(id, NEXT_OFFSET).context(BlockSnafu)?;
                ensure!(
                    entry_next == END_PTR && entry_prev == tail,
                    CorruptSnafu {
                        detail: "block after tail is not a consistent back entry",
                    }
                );
                ensure!(!read_only, RepairNeededSnafu { detail: "stale tail pointer" });
                info!(old_tail = tail, new_tail = after_tail, "Repairing stale tail pointer.");
                tail = after_tail;
                meta_dirty = true;
                pointer_repairs += 1;
            }
        }

        // Walk head to tail, consuming blocks from the unseen set.  Each
        // entry's back link must match the entry we arrived from; the
        // mismatch shapes below are the possible single-lost-write remnants
        // of an interrupted push or pop, and each costs one pointer repair.
        let mut len = 0u64;
        let mut previous = END_PTR;
        let mut before_previous = END_PTR;
        let mut current = head;
        while current != END_PTR {
            ensure!(
                current >= 0,
                DanglingPointerSnafu {
                    pointer: current,
                    role: "next",
                }
            );
            let id = as_block_id(current);
            ensure!(unseen.remove(&id), CycleDetectedSnafu { id: current });
            let entry_prev = blocks.get_i64(id, PREV_OFFSET).context(BlockSnafu)?;
            if entry_prev != previous {
                ensure!(
                    pointer_repairs == 0,
                    CorruptSnafu {
                        detail: "multiple interrupted mutations",
                    }
                );
                if entry_prev == END_PTR && previous == head && len == 1 {
                    // This entry claims to be the front: the single entry we
                    // arrived from is a half-removed (or half-pushed) head.
                    ensure!(!read_only, RepairNeededSnafu { detail: "stale front entry" });
                    info!(
                        orphan = previous,
                        new_head = current,
                        "Orphaning half-linked front entry."
                    );
                    unseen.insert(as_block_id(previous));
                    head = current;
                    meta_dirty = true;
                    pointer_repairs += 1;
                    len = 0;
                    previous = END_PTR;
                    before_previous = END_PTR;
                } else if entry_prev >= 0
                    && unseen.contains(&as_block_id(entry_prev))
                    && blocks
                        .get_i64(as_block_id(entry_prev), PREV_OFFSET)
                        .context(BlockSnafu)?
                        == previous
                    && blocks
                        .get_i64(as_block_id(entry_prev), NEXT_OFFSET)
                        .context(BlockSnafu)?
                        == current
                {
                    // The back link names an unwalked entry hanging between
                    // the chain and this one: a removal whose forward rewire
                    // landed but whose back rewire did not.  Complete it;
                    // the hanging entry becomes the orphan.
                    ensure!(!read_only, RepairNeededSnafu { detail: "half-removed entry" });
                    info!(
                        entry = current,
                        hanging = entry_prev,
                        "Completing half-removed entry's back link."
                    );
                    blocks
                        .put_i64(id, PREV_OFFSET, previous)
                        .context(BlockSnafu)?;
                    pointer_repairs += 1;
                } else if entry_prev == before_previous {
                    // The back link skips the entry we arrived from: an
                    // insert (or removal) whose forward rewire landed but
                    // whose back rewire did not.  Adopt the walked chain.
                    ensure!(!read_only, RepairNeededSnafu { detail: "half-linked entry" });
                    info!(
                        entry = current,
                        adopted = previous,
                        "Completing half-linked entry's back link."
                    );
                    blocks
                        .put_i64(id, PREV_OFFSET, previous)
                        .context(BlockSnafu)?;
                    pointer_repairs += 1;
                } else {
                    return WrongBackLinkSnafu {
                        id: current,
                        expected: previous,
                        found: entry_prev,
                    }
                    .fail();
                }
            }
            let mut entry_next = blocks.get_i64(id, NEXT_OFFSET).context(BlockSnafu)?;
            len += 1;
            if entry_next == END_PTR && current != tail {
                ensure!(
                    pointer_repairs == 0,
                    CorruptSnafu {
                        detail: "multiple interrupted mutations",
                    }
                );
                let tail_unwalked = tail >= 0 && unseen.contains(&as_block_id(tail));
                if tail_unwalked
                    && blocks
                        .get_i64(as_block_id(tail), PREV_OFFSET)
                        .context(BlockSnafu)?
                        == current
                    && blocks
                        .get_i64(as_block_id(tail), NEXT_OFFSET)
                        .context(BlockSnafu)?
                        == END_PTR
                {
                    // The tail names a consistent entry just past the chain
                    // end: a push whose tail update landed but whose forward
                    // rewire did not.  Complete the link and keep walking.
                    ensure!(!read_only, RepairNeededSnafu { detail: "unlinked tail entry" });
                    info!(entry = current, adopted_tail = tail, "Relinking tail entry.");
                    blocks.put_i64(id, NEXT_OFFSET, tail).context(BlockSnafu)?;
                    pointer_repairs += 1;
                    entry_next = tail;
                } else if tail >= 0 && !tail_unwalked {
                    // The chain ends here and the tail points at an entry
                    // already behind us: a pop whose forward rewire landed
                    // but whose tail update did not.
                    ensure!(!read_only, RepairNeededSnafu { detail: "tail behind chain end" });
                    info!(old_tail = tail, new_tail = current, "Repairing tail to chain end.");
                    tail = current;
                    meta_dirty = true;
                    pointer_repairs += 1;
                } else {
                    return CorruptSnafu {
                        detail: "tail pointer is neither chain end nor a consistent entry",
                    }
                    .fail();
                }
            }
            before_previous = previous;
            previous = current;
            current = entry_next;
        }
        ensure!(
            previous == tail || (len == 0 && tail == END_PTR),
            CorruptSnafu {
                detail: "tail pointer does not match the end of the chain",
            }
        );

        // At most one allocated block may be orphaned: the entry an
        // interrupted insert wrote but never linked, or an interrupted
        // removal unlinked but never deallocated.
        match unseen.len() {
            0 => {}
            1 => {
                let orphan = *unseen.iter().next().expect("set has one element");
                ensure!(!read_only, RepairNeededSnafu { detail: "orphaned block" });
                info!(orphan, "Deallocating orphaned block from interrupted operation.");
                blocks.deallocate(orphan).context(BlockSnafu)?;
            }
            count => {
                return UnreferencedBlocksSnafu { count: count as u64 }.fail();
            }
        }

        if meta_dirty {
            blocks
                .put_i64(metadata_id, META_HEAD_OFFSET, head)
                .context(BlockSnafu)?;
            blocks
                .put_i64(metadata_id, META_TAIL_OFFSET, tail)
                .context(BlockSnafu)?;
        }
        if meta_dirty || !read_only {
            blocks.barrier(true).context(BlockSnafu)?;
        }

        Ok(PersistentLinkedList {
            blocks,
            serializer,
            metadata_id,
            head,
            tail,
            len,
            read_only,
            _element: PhantomData,
        })
    }

    /// Number of elements.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this handle was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Inserts `element` at the front.
    pub fn push_front(&mut self, element: Option<&T>) -> Result<(), ListError> {
        self.insert_between(END_PTR, self.head, element)
    }

    /// Inserts `element` at the back.
    pub fn push_back(&mut self, element: Option<&T>) -> Result<(), ListError> {
        self.insert_between(self.tail, END_PTR, element)
    }

    /// Inserts `element` before the entry at `index`; `index == len`
    /// appends.
    pub fn insert(&mut self, index: u64, element: Option<&T>) -> Result<(), ListError> {
        if index == self.len {
            return self.push_back(element);
        }
        let pointer = self.pointer_at(index)?;
        let previous = self
            .blocks
            .get_i64(as_block_id(pointer), PREV_OFFSET)
            .context(BlockSnafu)?;
        self.insert_between(previous, pointer, element)
    }

    /// Reads the element at `index`.
    pub fn get(&self, index: u64) -> Result<Option<T>, ListError> {
        let pointer = self.pointer_at(index)?;
        self.read_element(pointer)
    }

    /// Replaces the element at `index`, returning the previous element.
    ///
    /// Implemented as remove-then-insert and therefore **not atomic** with
    /// respect to crashes: an interrupted `set` leaves the list with the
    /// entry removed, or removed and re-inserted, never a torn entry.
    /// Making it atomic would require a disk format change.
    pub fn set(&mut self, index: u64, element: Option<&T>) -> Result<Option<T>, ListError> {
        let pointer = self.pointer_at(index)?;
        let id = as_block_id(pointer);
        let previous = self.blocks.get_i64(id, PREV_OFFSET).context(BlockSnafu)?;
        let next = self.blocks.get_i64(id, NEXT_OFFSET).context(BlockSnafu)?;
        let old = self.remove_entry(pointer)?;
        self.insert_between(previous, next, element)?;
        Ok(old)
    }

    /// Removes and returns the element at `index`.
    pub fn remove(&mut self, index: u64) -> Result<Option<T>, ListError> {
        let pointer = self.pointer_at(index)?;
        self.remove_entry(pointer)
    }

    /// Removes and returns the front element, or `None` if the list is
    /// empty.
    pub fn pop_front(&mut self) -> Result<Option<Option<T>>, ListError> {
        if self.head == END_PTR {
            return Ok(None);
        }
        self.remove_entry(self.head).map(Some)
    }

    /// Removes and returns the back element, or `None` if the list is
    /// empty.
    pub fn pop_back(&mut self) -> Result<Option<Option<T>>, ListError> {
        if self.tail == END_PTR {
            return Ok(None);
        }
        self.remove_entry(self.tail).map(Some)
    }

    /// Removes every element.
    pub fn clear(&mut self) -> Result<(), ListError> {
        while self.pop_front()?.is_some() {}
        Ok(())
    }

    /// Iterates front to back.
    pub fn iter(&self) -> Iter<'_, T, B> {
        Iter {
            list: self,
            current: self.head,
            follow: NEXT_OFFSET,
        }
    }

    /// Iterates back to front.
    pub fn iter_descending(&self) -> Iter<'_, T, B> {
        Iter {
            list: self,
            current: self.tail,
            follow: PREV_OFFSET,
        }
    }

    /// Forwards a barrier to the underlying block buffer.
    pub fn barrier(&mut self, force: bool) -> Result<(), ListError> {
        self.blocks.barrier(force).context(BlockSnafu)
    }

    /// Flushes and closes the underlying storage.
    pub fn close(&mut self) -> Result<(), ListError> {
        self.blocks.close().context(BlockSnafu)
    }

    /// Consumes the list and returns the underlying block buffer.
    pub fn into_inner(self) -> B {
        self.blocks
    }

    /// Resolves an index to a block pointer, walking from the nearer end.
    fn pointer_at(&self, index: u64) -> Result<i64, ListError> {
        ensure!(
            index < self.len,
            IndexOutOfBoundsSnafu {
                index,
                len: self.len,
            }
        );
        let mut pointer;
        if index < self.len / 2 {
            pointer = self.head;
            for _ in 0..index {
                pointer = self
                    .blocks
                    .get_i64(as_block_id(pointer), NEXT_OFFSET)
                    .context(BlockSnafu)?;
            }
        } else {
            pointer = self.tail;
            for _ in 0..(self.len - 1 - index) {
                pointer = self
                    .blocks
                    .get_i64(as_block_id(pointer), PREV_OFFSET)
                    .context(BlockSnafu)?;
            }
        }
        Ok(pointer)
    }

    /// Reads an entry's element.
    fn read_element(&self, pointer: i64) -> Result<Option<T>, ListError> {
        let id = as_block_id(pointer);
        let data_size = self
            .blocks
            .get_i64(id, DATA_SIZE_OFFSET)
            .context(BlockSnafu)?;
        if data_size == NULL_DATA_SIZE {
            return Ok(None);
        }
        let len = usize::try_from(data_size).map_err(|_| ListError::Corrupt {
            detail: "negative entry data size",
        })?;
        let mut payload = vec![0u8; len];
        self.blocks
            .get(id, ENTRY_HEADER_SIZE, &mut payload)
            .context(BlockSnafu)?;
        let value = self
            .serializer
            .deserialize(&mut payload.as_slice())
            .context(ElementSnafu)?;
        Ok(Some(value))
    }

    /// Writes a fully-formed entry, barriers, links it between `previous`
    /// and `next`, and barriers again.
    fn insert_between(
        &mut self,
        previous: i64,
        next: i64,
        element: Option<&T>,
    ) -> Result<(), ListError> {
        ensure!(!self.read_only, ReadOnlySnafu);

        let data_size = match element {
            None => NULL_DATA_SIZE,
            Some(value) => i64::try_from(self.serializer.size(value)).map_err(|_| {
                ListError::Element {
                    source: io::Error::new(io::ErrorKind::InvalidInput, "element too large"),
                }
            })?,
        };
        let payload_size = u64::try_from(data_size.max(0)).expect("non-negative");
        let id = self
            .blocks
            .allocate(ENTRY_HEADER_SIZE + payload_size)
            .context(BlockSnafu)?;
        let pointer = i64::try_from(id).expect("block ids stay below 2^63");

        self.blocks.put_i64(id, NEXT_OFFSET, next).context(BlockSnafu)?;
        self.blocks
            .put_i64(id, PREV_OFFSET, previous)
            .context(BlockSnafu)?;
        self.blocks
            .put_i64(id, DATA_SIZE_OFFSET, data_size)
            .context(BlockSnafu)?;
        if let Some(value) = element {
            if payload_size > 0 {
                let mut writer = BytesMut::with_capacity(
                    usize::try_from(payload_size).expect("payload fits usize"),
                )
                .writer();
                self.serializer
                    .serialize(value, &mut writer)
                    .context(ElementSnafu)?;
                let payload = writer.into_inner();
                if payload.len() as u64 != payload_size {
                    return Err(ListError::Element {
                        source: io::Error::new(
                            io::ErrorKind::InvalidData,
                            "serializer wrote a different size than it reported",
                        ),
                    });
                }
                self.blocks
                    .put(id, ENTRY_HEADER_SIZE, &payload)
                    .context(BlockSnafu)?;
            }
        }

        // The entry must be durable before anything points at it.
        self.blocks.barrier(false).context(BlockSnafu)?;

        if previous == END_PTR {
            self.blocks
                .put_i64(self.metadata_id, META_HEAD_OFFSET, pointer)
                .context(BlockSnafu)?;
            self.head = pointer;
        } else {
            self.blocks
                .put_i64(as_block_id(previous), NEXT_OFFSET, pointer)
                .context(BlockSnafu)?;
        }
        if next == END_PTR {
            self.blocks
                .put_i64(self.metadata_id, META_TAIL_OFFSET, pointer)
                .context(BlockSnafu)?;
            self.tail = pointer;
        } else {
            self.blocks
                .put_i64(as_block_id(next), PREV_OFFSET, pointer)
                .context(BlockSnafu)?;
        }

        self.blocks.barrier(true).context(BlockSnafu)?;
        self.len += 1;
        Ok(())
    }

    /// Unlinks an entry, barriers, deallocates its block, and barriers
    /// again.  Returns the removed element.
    fn remove_entry(&mut self, pointer: i64) -> Result<Option<T>, ListError> {
        ensure!(!self.read_only, ReadOnlySnafu);

        let element = self.read_element(pointer)?;
        let id = as_block_id(pointer);
        let previous = self.blocks.get_i64(id, PREV_OFFSET).context(BlockSnafu)?;
        let next = self.blocks.get_i64(id, NEXT_OFFSET).context(BlockSnafu)?;

        if previous == END_PTR {
            self.blocks
                .put_i64(self.metadata_id, META_HEAD_OFFSET, next)
                .context(BlockSnafu)?;
            self.head = next;
        } else {
            self.blocks
                .put_i64(as_block_id(previous), NEXT_OFFSET, next)
                .context(BlockSnafu)?;
        }
        if next == END_PTR {
            self.blocks
                .put_i64(self.metadata_id, META_TAIL_OFFSET, previous)
                .context(BlockSnafu)?;
            self.tail = previous;
        } else {
            self.blocks
                .put_i64(as_block_id(next), PREV_OFFSET, previous)
                .context(BlockSnafu)?;
        }

        // Neighbors must be durably rewired before the block is reused.
        self.blocks.barrier(false).context(BlockSnafu)?;
        self.blocks.deallocate(id).context(BlockSnafu)?;
        self.blocks.barrier(true).context(BlockSnafu)?;
        self.len -= 1;
        Ok(element)
    }
}

fn as_block_id(pointer: i64) -> u64 {
    debug_assert!(pointer >= 0, "pointer {pointer} is not a block id");
    pointer as u64
}

/// Iterator over list elements in either direction.
///
/// Yields `Result` because every step reads from storage.  The iterator
/// borrows the list, so structural modification during iteration is
/// rejected at compile time.
pub struct Iter<'a, T, B: PersistentBlockBuffer> {
    list: &'a PersistentLinkedList<T, B>,
    current: i64,
    follow: u64,
}

impl<'a, T, B: PersistentBlockBuffer> Iterator for Iter<'a, T, B> {
    type Item = Result<Option<T>, ListError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == END_PTR {
            return None;
        }
        let pointer = self.current;
        let advanced = self
            .list
            .blocks
            .get_i64(as_block_id(pointer), self.follow)
            .context(BlockSnafu);
        match advanced {
            Ok(next) => self.current = next,
            Err(e) => {
                self.current = END_PTR;
                return Some(Err(e));
            }
        }
        Some(self.list.read_element(pointer))
    }
}

impl<T, B: PersistentBlockBuffer> std::fmt::Debug for PersistentLinkedList<T, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentLinkedList")
            .field("len", &self.len)
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}
