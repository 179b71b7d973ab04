//! Block layout and index arithmetic.
//!
//! The heap is an array of fixed-size blocks chained together by 16-bit
//! link words. A link word stores a 15-bit block index; the high bit of
//! the `next` link flags the block as sitting on the free ring. Inter
//! block references are always indices into the block array, never
//! native pointers, which keeps the per-block overhead at 4 bytes and
//! makes the heap image relocatable.

use bytemuck::{Pod, Zeroable};

use crate::config::{BLOCK_BODY_SIZE, BLOCK_SIZE};

/// Largest addressable block index. Link words carry 15 bits.
pub(crate) const MAX_BLOCKS: usize = i16::MAX as usize;

/// A 16-bit link word: a 15-bit block index, plus the free flag in the
/// high bit.
///
/// The flag is only meaningful on the `next` side of a chain header
/// (and, transiently, on the `prev` side while the integrity checker
/// runs). All index reads go through [`BlockLink::index`] so that a set
/// flag never leaks into arithmetic.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub(crate) struct BlockLink(u16);

impl BlockLink {
    const FREE_MASK: u16 = 0x8000;
    const INDEX_MASK: u16 = 0x7FFF;

    /// An untagged link to `index`.
    #[inline]
    pub(crate) fn new(index: u16) -> Self {
        Self(index & Self::INDEX_MASK)
    }

    /// The block index, with the flag bit stripped.
    #[inline]
    pub(crate) fn index(self) -> u16 {
        self.0 & Self::INDEX_MASK
    }

    #[inline]
    pub(crate) fn is_free(self) -> bool {
        self.0 & Self::FREE_MASK != 0
    }

    /// Same link, flagged free.
    #[inline]
    pub(crate) fn as_free(self) -> Self {
        Self(self.0 | Self::FREE_MASK)
    }

    /// Same link, flag cleared.
    #[inline]
    pub(crate) fn as_used(self) -> Self {
        Self(self.0 & Self::INDEX_MASK)
    }
}

/// Chain header at the start of every block: links to the next and
/// previous block of the heap, in ascending index order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct BlockHeader {
    pub(crate) next: BlockLink,
    pub(crate) prev: BlockLink,
}

/// Free-ring links occupying the first 4 body bytes of a free block.
///
/// These overlay the user-data area: the moment a block is handed out,
/// the same bytes become payload. Plain indices, no flag bit.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct FreeLinks {
    pub(crate) next: u16,
    pub(crate) prev: u16,
}

/// Number of blocks needed to satisfy a request of `size` bytes.
///
/// A single block donates its body (the free-ring link words are
/// reclaimed as payload once the block is in use). Larger requests pay
/// the chain header once and then consume whole blocks, so the first
/// block contributes `BLOCK_BODY_SIZE` bytes and every further block
/// contributes `BLOCK_SIZE`.
///
/// Results are clamped to [`MAX_BLOCKS`] so that an oversized request
/// walks the free list and fails cleanly instead of wrapping the index
/// arithmetic.
pub(crate) fn blocks_for(size: usize) -> u16 {
    if size <= BLOCK_BODY_SIZE {
        return 1;
    }

    let rest = size - BLOCK_BODY_SIZE;
    let blocks = 2 + (rest - 1) / BLOCK_SIZE;

    if blocks > MAX_BLOCKS {
        return MAX_BLOCKS as u16;
    }

    blocks as u16
}

/// Usable payload bytes of an allocation spanning `blocks` blocks.
#[inline]
pub(crate) fn bytes_in(blocks: u16) -> usize {
    blocks as usize * BLOCK_SIZE - crate::config::HEADER_SIZE
}
