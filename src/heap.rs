//! The heap handle and its allocation engines.
//!
//! A [`Heap`] manages one contiguous, caller-supplied memory region as
//! an array of fixed-size blocks. Two overlaid doubly-linked lists run
//! through the region: the block chain, which strings every block
//! together in ascending index order, and the free ring, which strings
//! the free blocks together in most-recently-freed order. Block 0
//! anchors both lists; the last block terminates the chain with a next
//! index of 0 and is never handed out.
//!
//! The engines keep a strict discipline: after every public operation
//! the chain ascends with matching backlinks, the free flag agrees
//! with ring membership, and no two chain-adjacent blocks are both
//! free.

use core::ptr::{self, NonNull};

use bytemuck::Zeroable;
use log::trace;

use crate::block::{blocks_for, bytes_in, BlockHeader, BlockLink, FreeLinks, MAX_BLOCKS};
use crate::config::{BLOCK_SIZE, BODY_ALIGN, HEADER_SIZE};
use crate::err::HeapError;
use crate::info::HeapInfo;

/// A block-indexed heap over a fixed region.
///
/// The handle owns no memory: the region is supplied at init and stays
/// valid for as long as the handle is used. `Heap` is not internally
/// synchronized; concurrent callers must hold their own exclusion for
/// the full duration of each operation (the crate-level wrappers do
/// this with a [`spin::Mutex`]).
pub struct Heap {
    pub(crate) base: NonNull<u8>,
    pub(crate) heap_size: usize,
    pub(crate) numblocks: u16,
    pub(crate) info: HeapInfo,
}

// SAFETY: the raw base pointer is only dereferenced through &mut self.
unsafe impl Send for Heap {}

impl Heap {
    /// Takes ownership of the region `[base, base + size)` and writes
    /// the initial heap structure into it.
    ///
    /// The region is zeroed, then laid out as block 0 (the list
    /// anchor), one free run spanning the whole allocatable area, and
    /// the tail sentinel.
    ///
    /// # Safety
    ///
    /// `base` must point to a readable and writable region of at least
    /// `size` bytes that outlives the handle, and nothing else may
    /// access that region while the handle exists.
    pub unsafe fn init_region(base: NonNull<u8>, size: usize) -> Result<Self, HeapError> {
        if base.as_ptr() as usize % BODY_ALIGN != 0 {
            return Err(HeapError::Misaligned);
        }

        let numblocks = size / BLOCK_SIZE;
        if numblocks < 3 {
            return Err(HeapError::RegionTooSmall);
        }
        if numblocks > MAX_BLOCKS {
            return Err(HeapError::RegionTooLarge);
        }

        ptr::write_bytes(base.as_ptr(), 0x00, size);

        let mut heap = Self {
            base,
            heap_size: size,
            numblocks: numblocks as u16,
            info: HeapInfo::zeroed(),
        };
        let last = heap.numblocks - 1;

        heap.metric_init();

        // Block 0 anchors both lists and only ever points at block 1.
        heap.set_nblock(0, BlockLink::new(1));
        heap.set_nfree(0, 1);
        heap.set_pfree(0, 1);

        // Block 1 spans the whole allocatable area as one free run.
        // Its ring links stay zero, which terminates the free list,
        // and the tail sentinel keeps a next index of 0.
        heap.set_nblock(1, BlockLink::new(last).as_free());
        heap.set_pblock(last, BlockLink::new(1));

        Ok(heap)
    }

    /// Builds a heap over a static byte region.
    pub fn from_slice(region: &'static mut [u8]) -> Result<Self, HeapError> {
        let len = region.len();
        let base = unsafe { NonNull::new_unchecked(region.as_mut_ptr()) };

        unsafe { Self::init_region(base, len) }
    }

    /// Total size in bytes of the managed region.
    pub fn size(&self) -> usize {
        self.heap_size
    }

    /* ---------------------------------------------------------------
     * Link accessors. All list surgery below goes through these; the
     * casts are sound because the header types are `Pod` and
     * `init_region` checked the region bounds and alignment.
     */

    #[inline]
    fn header(&self, c: u16) -> *mut BlockHeader {
        unsafe { self.base.as_ptr().add(c as usize * BLOCK_SIZE).cast() }
    }

    #[inline]
    fn free_links(&self, c: u16) -> *mut FreeLinks {
        unsafe {
            self.base
                .as_ptr()
                .add(c as usize * BLOCK_SIZE + HEADER_SIZE)
                .cast()
        }
    }

    #[inline]
    pub(crate) fn nblock(&self, c: u16) -> BlockLink {
        unsafe { (*self.header(c)).next }
    }

    #[inline]
    pub(crate) fn set_nblock(&mut self, c: u16, link: BlockLink) {
        unsafe { (*self.header(c)).next = link }
    }

    #[inline]
    pub(crate) fn pblock(&self, c: u16) -> BlockLink {
        unsafe { (*self.header(c)).prev }
    }

    #[inline]
    pub(crate) fn set_pblock(&mut self, c: u16, link: BlockLink) {
        unsafe { (*self.header(c)).prev = link }
    }

    #[inline]
    pub(crate) fn nfree(&self, c: u16) -> u16 {
        unsafe { (*self.free_links(c)).next }
    }

    #[inline]
    pub(crate) fn set_nfree(&mut self, c: u16, to: u16) {
        unsafe { (*self.free_links(c)).next = to }
    }

    #[inline]
    pub(crate) fn pfree(&self, c: u16) -> u16 {
        unsafe { (*self.free_links(c)).prev }
    }

    #[inline]
    pub(crate) fn set_pfree(&mut self, c: u16, to: u16) {
        unsafe { (*self.free_links(c)).prev = to }
    }

    /// Address of the user-data area of block `c`.
    #[inline]
    pub(crate) fn data_ptr(&self, c: u16) -> *mut u8 {
        unsafe { self.base.as_ptr().add(c as usize * BLOCK_SIZE + HEADER_SIZE) }
    }

    /// Address of the header of block `c`.
    #[inline]
    pub(crate) fn block_ptr(&self, c: u16) -> *const u8 {
        unsafe { self.base.as_ptr().add(c as usize * BLOCK_SIZE) }
    }

    /// Index of the block containing `ptr`. Truncating division is
    /// correct here: user pointers always sit 4 bytes into a block.
    #[inline]
    pub(crate) fn block_of(&self, ptr: *const u8) -> u16 {
        ((ptr as usize - self.base.as_ptr() as usize) / BLOCK_SIZE) as u16
    }

    /* ---------------------------------------------------------------
     * Free-list primitives. These assume exclusive access and leave
     * transient states in which the list invariants do not hold, so
     * they are never exposed outside the engines.
     */

    /// Split block `c` so that its first `blocks` sub-blocks stay
    /// indexed at `c` and the remainder becomes a new chain entry at
    /// `c + blocks`, flagged free iff `tail_free`.
    ///
    /// Free-ring pointers are left untouched: only the callers know
    /// whether the tail is joining the ring or being handed out, and
    /// `assimilate_up` relies on being able to split mid-coalesce
    /// without the ring being rewritten under it.
    fn split_block(&mut self, c: u16, blocks: u16, tail_free: bool) {
        let tail = c + blocks;
        let next = self.nblock(c).index();

        let tail_link = if tail_free {
            BlockLink::new(next).as_free()
        } else {
            BlockLink::new(next)
        };

        self.set_nblock(tail, tail_link);
        self.set_pblock(tail, BlockLink::new(c));

        self.set_pblock(next, BlockLink::new(tail));
        self.set_nblock(c, BlockLink::new(tail));
    }

    /// Takes `c` off the free ring and clears its free flag.
    fn unlink_free(&mut self, c: u16) {
        let next = self.nfree(c);
        let prev = self.pfree(c);

        self.set_nfree(prev, next);
        self.set_pfree(next, prev);

        self.set_nblock(c, self.nblock(c).as_used());
    }

    /// Folds the successor of `c` into `c` if that successor is free.
    /// No effect otherwise.
    fn assimilate_up(&mut self, c: u16) {
        let next = self.nblock(c).index();
        if !self.nblock(next).is_free() {
            return;
        }

        trace!("assimilate up: {} swallows {}", c, next);

        self.metric_remove(next);
        self.unlink_free(next);

        let after = self.nblock(next).index();
        self.set_pblock(after, BlockLink::new(c));
        self.set_nblock(c, BlockLink::new(after));
    }

    /// Unconditionally folds `c` into its predecessor and returns the
    /// predecessor's index, which now names the merged block.
    /// `make_free` stamps the merged block's flag.
    ///
    /// Callers must have assimilated up first where applicable; this
    /// never re-folds in the other direction.
    fn assimilate_down(&mut self, c: u16, make_free: bool) -> u16 {
        let prev = self.pblock(c).index();

        trace!("assimilate down: {} joins {}", c, prev);

        self.metric_remove(prev);

        let next = self.nblock(c).index();
        let merged = if make_free {
            BlockLink::new(next).as_free()
        } else {
            BlockLink::new(next)
        };

        self.set_nblock(prev, merged);
        self.set_pblock(next, BlockLink::new(prev));

        if make_free {
            self.metric_add(prev);
        }

        prev
    }

    /* ---------------------------------------------------------------
     * Engines.
     */

    /// Allocates at least `size` bytes and returns the address of the
    /// block body, or `None` when no free run is large enough.
    /// Zero-size requests allocate nothing.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            trace!("allocation of 0 bytes, nothing to do");
            return None;
        }

        let blocks = blocks_for(size);

        // Walk the free ring for a run of at least `blocks` blocks.
        let mut found: Option<(u16, u16)> = None;
        let mut cf = self.nfree(0);

        while cf != 0 {
            let run = self.nblock(cf).index() - cf;

            #[cfg(feature = "best-fit")]
            if run >= blocks && found.map_or(true, |(_, best)| run < best) {
                found = Some((cf, run));
            }

            #[cfg(feature = "first-fit")]
            if run >= blocks {
                found = Some((cf, run));
                break;
            }

            cf = self.nfree(cf);
        }

        let (cf, run) = match found {
            Some(found) => found,
            None => {
                trace!("cannot allocate {} blocks", blocks);
                return None;
            }
        };

        self.metric_remove(cf);

        if run == blocks {
            trace!("allocating {} blocks at {} - exact", blocks, cf);

            self.unlink_free(cf);
        } else {
            trace!("allocating {} blocks at {} - split", blocks, cf);

            // Hand the head of the run to the caller; the tail stays
            // free. The split moved the start of the run from `cf` to
            // `cf + blocks` without touching the ring, so the tail now
            // inherits the run's ring neighbours.
            self.split_block(cf, blocks, true);
            self.metric_add(cf + blocks);

            let tail = cf + blocks;
            let ring_prev = self.pfree(cf);
            let ring_next = self.nfree(cf);

            self.set_nfree(ring_prev, tail);
            self.set_pfree(tail, ring_prev);
            self.set_pfree(ring_next, tail);
            self.set_nfree(tail, ring_next);
        }

        Some(unsafe { NonNull::new_unchecked(self.data_ptr(cf)) })
    }

    /// Returns `ptr` to the heap, coalescing with free neighbours.
    /// Null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer previously returned by one
    /// of the allocation entry points of this heap.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            trace!("free of a null pointer, nothing to do");
            return;
        }

        self.free_block(self.block_of(ptr));
    }

    fn free_block(&mut self, c: u16) {
        trace!("freeing block {}", c);

        // Swallow a free successor first, so that the predecessor
        // merge (or the ring insert) below sees the final extent of
        // the block and a second coalescing pass is never needed.
        self.assimilate_up(c);

        let prev = self.pblock(c).index();
        if self.nblock(prev).is_free() {
            // The predecessor already sits on the ring; it only grows.
            self.assimilate_down(c, true);
        } else {
            // Push onto the head of the free ring.
            self.metric_add(c);

            let head = self.nfree(0);
            self.set_pfree(head, c);
            self.set_nfree(c, head);
            self.set_pfree(c, 0);
            self.set_nfree(0, c);

            self.set_nblock(c, self.nblock(c).as_free());
        }
    }

    /// Resizes the allocation at `ptr` to `size` bytes, preserving the
    /// prefix of the old contents.
    ///
    /// Follows the usual contract: a null `ptr` allocates, a zero
    /// `size` frees. Growth prefers merging free neighbours in place
    /// over relocating; when nothing fits, the old block is left
    /// untouched and `None` is returned.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer previously returned by one
    /// of the allocation entry points of this heap.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> Option<NonNull<u8>> {
        if ptr.is_null() {
            trace!("realloc of a null pointer, allocating");
            return self.allocate(size);
        }

        if size == 0 {
            trace!("realloc to 0 bytes, freeing");
            self.free(ptr);
            return None;
        }

        let blocks = blocks_for(size);
        let mut c = self.block_of(ptr);
        let mut block_size = self.nblock(c).index() - c;
        let cur_bytes = bytes_in(block_size);

        // Neighbour extents, non-zero only when the neighbour is free.
        let next = self.nblock(c).index();
        let next_free = if self.nblock(next).is_free() {
            self.nblock(next).index() - next
        } else {
            0
        };

        let prev = self.pblock(c).index();
        let prev_free = if self.nblock(prev).is_free() {
            c - prev
        } else {
            0
        };

        trace!(
            "realloc wants {} blocks, has {} (prev free {}, next free {})",
            blocks,
            block_size,
            prev_free,
            next_free
        );

        let mut ptr = ptr;

        if block_size >= blocks {
            // Same size or smaller: keep in place.
            trace!("realloc fits in place");
        } else if block_size + next_free == blocks {
            // The free successor tops us up exactly. Preferred over
            // the general up-merge: an exact merge leaves no tail to
            // split off, so it cannot fragment the free pool.
            trace!("realloc exact fit using the next block");

            self.assimilate_up(c);
            block_size += next_free;
        } else if prev_free == 0 && block_size + next_free >= blocks {
            trace!("realloc using the next block");

            self.assimilate_up(c);
            block_size += next_free;
        } else if prev_free + block_size >= blocks {
            // Grow backwards into the free predecessor; the payload
            // moves down to the merged block's body.
            trace!("realloc using the previous block");

            self.unlink_free(prev);
            c = self.assimilate_down(c, false);

            let body = self.data_ptr(c);
            ptr::copy(ptr, body, cur_bytes);
            ptr = body;

            block_size += prev_free;
        } else if prev_free + block_size + next_free >= blocks {
            trace!("realloc using both neighbouring blocks");

            self.assimilate_up(c);
            self.unlink_free(prev);
            c = self.assimilate_down(c, false);

            let body = self.data_ptr(c);
            ptr::copy(ptr, body, cur_bytes);
            ptr = body;

            block_size += prev_free + next_free;
        } else {
            // Nothing adjacent fits: relocate. On failure the old
            // block stays valid and reachable through the original
            // pointer.
            match self.allocate(size) {
                Some(fresh) => {
                    trace!("realloc relocating to a fresh block");

                    ptr::copy_nonoverlapping(ptr, fresh.as_ptr(), cur_bytes);
                    self.free(ptr);
                    ptr = fresh.as_ptr();
                }
                None => {
                    trace!("realloc failed, keeping the old block");
                    return None;
                }
            }

            block_size = blocks;
        }

        // Give back whatever the merges over-collected.
        if block_size > blocks {
            self.split_block(c, blocks, false);
            self.free_block(c + blocks);
        }

        Some(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// Allocates room for `count` items of `item_size` bytes and zeroes
    /// it. Fails on overflow of the total size.
    pub fn zero_allocate(&mut self, count: usize, item_size: usize) -> Option<NonNull<u8>> {
        let size = count.checked_mul(item_size)?;
        let ptr = self.allocate(size)?;

        unsafe { ptr::write_bytes(ptr.as_ptr(), 0x00, size) };

        Some(ptr)
    }

    /// Checks every structural invariant of the heap: the chain
    /// ascends with matching backlinks, the free flag agrees with ring
    /// membership, and no two chain-adjacent blocks are both free.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let mut flagged = 0u16;
        let mut prev = 0u16;
        let mut prev_was_free = false;
        let mut c = self.nblock(0).index();

        while c != 0 {
            assert!(c > prev, "block chain must ascend: {} after {}", c, prev);
            assert_eq!(
                self.pblock(c).index(),
                prev,
                "chain backlink broken at {}",
                c
            );

            let free = self.nblock(c).is_free();
            if free {
                assert!(!prev_was_free, "adjacent free blocks at {}", c);
                flagged += 1;
            }

            prev_was_free = free;
            prev = c;
            c = self.nblock(c).index();
        }

        let mut ring = 0u16;
        let mut p = 0u16;
        let mut f = self.nfree(0);

        while f != 0 {
            assert!(
                self.nblock(f).is_free(),
                "ring member {} is not flagged free",
                f
            );
            assert_eq!(self.pfree(f), p, "free ring backlink broken at {}", f);

            ring += 1;
            assert!(ring <= self.numblocks, "free ring does not terminate");

            p = f;
            f = self.nfree(f);
        }

        assert_eq!(ring, flagged, "free ring size disagrees with free flags");
    }

    /// Free runs as (start, blocks) pairs, in chain order.
    #[cfg(test)]
    pub(crate) fn free_runs(&self) -> ([(u16, u16); 8], usize) {
        let mut runs = [(0u16, 0u16); 8];
        let mut n = 0;
        let mut c = self.nblock(0).index();

        while c != 0 {
            if self.nblock(c).is_free() {
                runs[n] = (c, self.nblock(c).index() - c);
                n += 1;
            }
            c = self.nblock(c).index();
        }

        (runs, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BLOCK_BODY_SIZE;

    #[repr(align(8))]
    struct Region<const N: usize>([u8; N]);

    impl<const N: usize> Region<N> {
        fn new() -> Self {
            Self([0; N])
        }

        fn heap(&mut self) -> Heap {
            let base = NonNull::new(self.0.as_mut_ptr()).unwrap();
            unsafe { Heap::init_region(base, N).unwrap() }
        }
    }

    fn fill(ptr: NonNull<u8>, len: usize, seed: u8) {
        for i in 0..len {
            unsafe { ptr.as_ptr().add(i).write(seed.wrapping_add(i as u8)) };
        }
    }

    fn check_fill(ptr: NonNull<u8>, len: usize, seed: u8) {
        for i in 0..len {
            let got = unsafe { ptr.as_ptr().add(i).read() };
            assert_eq!(got, seed.wrapping_add(i as u8), "payload byte {}", i);
        }
    }

    #[test]
    fn init_writes_the_sentinel_layout() {
        let mut region = Region::<128>::new();
        let heap = region.heap();

        assert_eq!(heap.numblocks, 16);
        assert_eq!(heap.nblock(0).index(), 1);
        assert!(!heap.nblock(0).is_free());
        assert_eq!(heap.nfree(0), 1);
        assert_eq!(heap.pfree(0), 1);

        assert_eq!(heap.nblock(1).index(), 15);
        assert!(heap.nblock(1).is_free());
        assert_eq!(heap.pblock(15).index(), 1);
        assert_eq!(heap.nblock(15).index(), 0);

        heap.assert_invariants();
        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(1, 14)]);
    }

    #[test]
    fn init_rejects_unusable_regions() {
        let mut region = Region::<128>::new();
        let base = NonNull::new(region.0.as_mut_ptr()).unwrap();

        // Too small for the sentinels plus one allocatable block.
        assert_eq!(
            unsafe { Heap::init_region(base, 16) }.err(),
            Some(HeapError::RegionTooSmall)
        );

        // More blocks than a 15-bit index can address. Validation runs
        // before any write, so the bogus size is never dereferenced.
        assert_eq!(
            unsafe { Heap::init_region(base, (MAX_BLOCKS + 1) * BLOCK_SIZE) }.err(),
            Some(HeapError::RegionTooLarge)
        );

        let unaligned = NonNull::new(unsafe { region.0.as_mut_ptr().add(1) }).unwrap();
        assert_eq!(
            unsafe { Heap::init_region(unaligned, 64) }.err(),
            Some(HeapError::Misaligned)
        );
    }

    #[test]
    fn allocate_free_round_trip_restores_the_heap() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        let ptr = heap.allocate(10).unwrap();
        assert_eq!(ptr.as_ptr(), heap.data_ptr(1));
        heap.assert_invariants();

        fill(ptr, 10, 0x40);
        check_fill(ptr, 10, 0x40);

        unsafe { heap.free(ptr.as_ptr()) };
        heap.assert_invariants();

        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(1, 14)]);
    }

    #[test]
    fn zero_sized_allocations_return_nothing() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        assert!(heap.allocate(0).is_none());
        assert!(heap.zero_allocate(0, 8).is_none());
        assert!(heap.zero_allocate(8, 0).is_none());
        heap.assert_invariants();
    }

    #[test]
    fn an_exact_fit_consumes_the_whole_run() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        // 14 blocks of payload: exactly the allocatable area.
        let ptr = heap.allocate(bytes_in(14)).unwrap();
        heap.assert_invariants();

        // The ring is empty now.
        assert_eq!(heap.nfree(0), 0);
        assert!(heap.allocate(1).is_none());

        unsafe { heap.free(ptr.as_ptr()) };
        heap.assert_invariants();

        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(1, 14)]);
    }

    #[test]
    fn oversized_requests_fail_cleanly() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        // One byte past the allocatable area.
        assert!(heap.allocate(bytes_in(14) + 1).is_none());
        assert!(heap.allocate(usize::MAX).is_none());
        heap.assert_invariants();
    }

    #[test]
    fn freeing_coalesces_with_the_following_block() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        let a = heap.allocate(4).unwrap();
        let b = heap.allocate(4).unwrap();

        unsafe { heap.free(a.as_ptr()) };
        heap.assert_invariants();
        unsafe { heap.free(b.as_ptr()) };
        heap.assert_invariants();

        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(1, 14)]);
    }

    #[test]
    fn freeing_coalesces_with_the_preceding_block() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        let a = heap.allocate(4).unwrap();
        let b = heap.allocate(4).unwrap();

        unsafe { heap.free(b.as_ptr()) };
        heap.assert_invariants();
        unsafe { heap.free(a.as_ptr()) };
        heap.assert_invariants();

        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(1, 14)]);
    }

    #[test]
    fn zero_allocate_zeroes_and_checks_overflow() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        let ptr = heap.allocate(12).unwrap();
        fill(ptr, 12, 0xAA);
        unsafe { heap.free(ptr.as_ptr()) };

        let ptr = heap.zero_allocate(3, 4).unwrap();
        for i in 0..12 {
            assert_eq!(unsafe { ptr.as_ptr().add(i).read() }, 0);
        }

        assert!(heap.zero_allocate(usize::MAX, 2).is_none());
        heap.assert_invariants();
    }

    #[cfg(feature = "best-fit")]
    #[test]
    fn best_fit_prefers_the_tightest_run() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        // Carve the chain into: free(1..4), used(4), free(5), used(6),
        // free(7..15).
        let a = heap.allocate(bytes_in(3)).unwrap();
        let _g1 = heap.allocate(4).unwrap();
        let b = heap.allocate(4).unwrap();
        let _g2 = heap.allocate(4).unwrap();

        unsafe { heap.free(a.as_ptr()) };
        unsafe { heap.free(b.as_ptr()) };
        heap.assert_invariants();

        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(1, 3), (5, 1), (7, 8)]);

        // A one-block request must take the one-block run, not the
        // earlier, larger one.
        let tight = heap.allocate(BLOCK_BODY_SIZE).unwrap();
        assert_eq!(tight.as_ptr(), heap.data_ptr(5));
        heap.assert_invariants();
    }

    #[test]
    fn splitting_hands_out_the_head_and_keeps_the_tail_free() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        let a = heap.allocate(bytes_in(2)).unwrap();
        assert_eq!(a.as_ptr(), heap.data_ptr(1));
        heap.assert_invariants();

        // The tail of the initial run is still on the ring.
        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(3, 12)]);
        assert_eq!(heap.nfree(0), 3);
    }

    #[test]
    fn realloc_in_place_when_the_block_already_fits() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        let p = heap.allocate(bytes_in(2)).unwrap();
        fill(p, 12, 0x10);

        // Shrinking keeps the pointer and the surviving prefix, and
        // the split-off tail coalesces back into the free pool.
        let q = unsafe { heap.reallocate(p.as_ptr(), 4) }.unwrap();
        assert_eq!(q, p);
        check_fill(q, 4, 0x10);
        heap.assert_invariants();

        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(2, 13)]);
    }

    #[test]
    fn realloc_grows_into_an_exactly_fitting_next_block() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        let a = heap.allocate(4).unwrap();
        let b = heap.allocate(4).unwrap();
        let _guard = heap.allocate(4).unwrap();

        fill(a, 4, 0x20);
        unsafe { heap.free(b.as_ptr()) };

        // Block 2 is a one-block free run; one more block is exactly
        // what twelve bytes need.
        let grown = unsafe { heap.reallocate(a.as_ptr(), bytes_in(2)) }.unwrap();
        assert_eq!(grown, a);
        check_fill(grown, 4, 0x20);
        heap.assert_invariants();

        // The swallowed block left the ring.
        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(4, 11)]);
    }

    #[test]
    fn realloc_grows_forward_and_returns_the_excess() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        let a = heap.allocate(4).unwrap();
        let b = heap.allocate(bytes_in(2)).unwrap();
        let _guard = heap.allocate(4).unwrap();

        fill(a, 4, 0x30);
        unsafe { heap.free(b.as_ptr()) };

        // Two free blocks follow, one is enough: the up-merge takes
        // both and the split gives one back.
        let grown = unsafe { heap.reallocate(a.as_ptr(), bytes_in(2)) }.unwrap();
        assert_eq!(grown, a);
        check_fill(grown, 4, 0x30);
        heap.assert_invariants();

        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(3, 1), (5, 10)]);
    }

    #[test]
    fn realloc_grows_backward_and_moves_the_payload() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        let a = heap.allocate(4).unwrap();
        let b = heap.allocate(4).unwrap();
        let _guard = heap.allocate(4).unwrap();

        fill(b, 4, 0x50);
        unsafe { heap.free(a.as_ptr()) };

        // The successor of b is used, the predecessor is free: the
        // payload moves down into the merged block.
        let grown = unsafe { heap.reallocate(b.as_ptr(), bytes_in(2)) }.unwrap();
        assert_eq!(grown.as_ptr(), heap.data_ptr(1));
        check_fill(grown, 4, 0x50);
        heap.assert_invariants();

        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(4, 11)]);
    }

    #[test]
    fn realloc_grows_into_both_neighbours() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        let a = heap.allocate(4).unwrap();
        let b = heap.allocate(4).unwrap();
        let _guard = heap.allocate(4).unwrap();

        fill(b, 4, 0x60);
        unsafe { heap.free(a.as_ptr()) };
        unsafe { heap.free(_guard.as_ptr()) };

        // Neither neighbour alone suffices for four blocks, together
        // with the block itself they do.
        let grown = unsafe { heap.reallocate(b.as_ptr(), bytes_in(4)) }.unwrap();
        assert_eq!(grown.as_ptr(), heap.data_ptr(1));
        check_fill(grown, 4, 0x60);
        heap.assert_invariants();

        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(5, 10)]);
    }

    #[test]
    fn realloc_relocates_when_nothing_adjacent_fits() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        let p = heap.allocate(4).unwrap();
        let _wall = heap.allocate(4).unwrap();

        fill(p, 4, 0x70);

        // Growing past the wall forces a fresh allocation further up.
        let moved = unsafe { heap.reallocate(p.as_ptr(), bytes_in(3)) }.unwrap();
        assert_eq!(moved.as_ptr(), heap.data_ptr(3));
        check_fill(moved, 4, 0x70);
        heap.assert_invariants();

        // The old block was freed.
        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(1, 1), (6, 9)]);
    }

    #[test]
    fn failed_realloc_leaves_the_old_block_untouched() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        // Fill the heap so that only two scattered one-block runs
        // remain.
        let p = heap.allocate(bytes_in(2)).unwrap();
        let x = heap.allocate(4).unwrap();
        let _q = heap.allocate(4).unwrap();
        let y = heap.allocate(4).unwrap();
        let _rest = heap.allocate(bytes_in(9)).unwrap();

        fill(p, 12, 0x80);
        unsafe { heap.free(x.as_ptr()) };
        unsafe { heap.free(y.as_ptr()) };
        heap.assert_invariants();

        let (runs_before, n_before) = heap.free_runs();

        // Four blocks are nowhere to be found.
        let res = unsafe { heap.reallocate(p.as_ptr(), bytes_in(4)) };
        assert!(res.is_none());

        // The original allocation and the heap are exactly as before.
        check_fill(p, 12, 0x80);
        heap.assert_invariants();
        let (runs_after, n_after) = heap.free_runs();
        assert_eq!(&runs_before[..n_before], &runs_after[..n_after]);
    }

    #[test]
    fn realloc_follows_the_standard_contract_at_the_edges() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        // Null pointer: plain allocation.
        let p = unsafe { heap.reallocate(ptr::null_mut(), 10) }.unwrap();
        assert_eq!(p.as_ptr(), heap.data_ptr(1));

        // Zero size: plain free.
        assert!(unsafe { heap.reallocate(p.as_ptr(), 0) }.is_none());
        heap.assert_invariants();

        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(1, 14)]);
    }

    #[test]
    fn free_of_null_is_a_no_op() {
        let mut region = Region::<128>::new();
        let mut heap = region.heap();

        let a = heap.allocate(4).unwrap();
        unsafe { heap.free(ptr::null_mut()) };
        heap.assert_invariants();

        unsafe { heap.free(a.as_ptr()) };
        unsafe { heap.free(ptr::null_mut()) };
        heap.assert_invariants();

        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(1, 14)]);
    }

    #[test]
    fn the_free_ring_survives_a_single_entry() {
        let mut region = Region::<32>::new();
        let mut heap = region.heap();

        // Four blocks: sentinel, one allocatable run of two, sentinel.
        assert_eq!(heap.numblocks, 4);
        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(1, 2)]);

        let p = heap.allocate(4).unwrap();
        heap.assert_invariants();

        unsafe { heap.free(p.as_ptr()) };
        heap.assert_invariants();

        let (runs, n) = heap.free_runs();
        assert_eq!(&runs[..n], &[(1, 2)]);
    }
}
