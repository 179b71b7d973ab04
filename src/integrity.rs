//! Structural verification of the heap lists.
//!
//! The check runs in two passes. The first walks the free ring,
//! verifying the backlinks and leaving a transient mark (the free flag
//! on the `prev` link) on every ring member. The second walks the
//! block chain, verifying ascent and backlinks and requiring that the
//! mark agrees with the block's own free flag, clearing marks as it
//! goes. A block flagged free but missing from the ring, or vice
//! versa, cannot survive both passes.

use log::error;

use crate::heap::Heap;

impl Heap {
    /// Verifies every list invariant of the heap.
    ///
    /// Returns `false` and invokes the registered corruption handler
    /// when anything is out of place. Marks left behind by a failed
    /// check are irrelevant: the heap is already broken.
    pub fn integrity_check(&mut self) -> bool {
        let ok = self.verify_lists();

        if !ok {
            crate::run_corruption_handler();
        }

        ok
    }

    fn verify_lists(&mut self) -> bool {
        // First pass: the free ring.
        let mut prev: u16 = 0;

        loop {
            let cur = self.nfree(prev);

            if cur >= self.numblocks {
                error!(
                    "heap integrity broken: next free {} out of range (in block {})",
                    cur, prev
                );
                return false;
            }

            if cur == 0 {
                break;
            }

            if self.pfree(cur) != prev {
                error!(
                    "heap integrity broken: free links don't match: {} -> {}, but {} -> {}",
                    prev,
                    cur,
                    cur,
                    self.pfree(cur)
                );
                return false;
            }

            self.set_pblock(cur, self.pblock(cur).as_free());

            prev = cur;
        }

        // Second pass: the block chain.
        let mut prev: u16 = 0;

        loop {
            let cur = self.nblock(prev).index();

            if cur >= self.numblocks {
                error!(
                    "heap integrity broken: next block {} out of range (in block {})",
                    cur, prev
                );
                return false;
            }

            if cur == 0 {
                break;
            }

            if self.nblock(cur).is_free() != self.pblock(cur).is_free() {
                error!(
                    "heap integrity broken: free flag out of sync with the ring at block {}",
                    cur
                );
                return false;
            }

            if cur <= prev {
                error!(
                    "heap integrity broken: next block {} does not ascend from {}",
                    cur, prev
                );
                return false;
            }

            self.set_pblock(cur, self.pblock(cur).as_used());

            if self.pblock(cur).index() != prev {
                error!(
                    "heap integrity broken: block links don't match: {} -> {}, but {} -> {}",
                    prev,
                    cur,
                    cur,
                    self.pblock(cur).index()
                );
                return false;
            }

            prev = cur;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::NonNull;

    use crate::block::BlockLink;
    use crate::heap::Heap;

    #[repr(align(8))]
    struct Region([u8; 128]);

    fn heap(region: &mut Region) -> Heap {
        let base = NonNull::new(region.0.as_mut_ptr()).unwrap();
        unsafe { Heap::init_region(base, 128).unwrap() }
    }

    #[test]
    fn a_live_heap_passes() {
        let mut region = Region([0; 128]);
        let mut heap = heap(&mut region);

        assert!(heap.integrity_check());

        let a = heap.allocate(10).unwrap();
        let b = heap.allocate(4).unwrap();
        assert!(heap.integrity_check());

        unsafe { heap.free(a.as_ptr()) };
        assert!(heap.integrity_check());

        let _ = unsafe { heap.reallocate(b.as_ptr(), 20) };
        assert!(heap.integrity_check());
    }

    #[test]
    fn the_check_survives_repeated_runs() {
        // The transient marks must be gone after a passing check, or a
        // second run would flag phantom corruption.
        let mut region = Region([0; 128]);
        let mut heap = heap(&mut region);

        let _a = heap.allocate(4).unwrap();
        let b = heap.allocate(4).unwrap();
        unsafe { heap.free(b.as_ptr()) };

        assert!(heap.integrity_check());
        assert!(heap.integrity_check());
    }

    #[test]
    fn a_broken_chain_backlink_is_caught() {
        let mut region = Region([0; 128]);
        let mut heap = heap(&mut region);

        let _a = heap.allocate(4).unwrap();
        let _b = heap.allocate(4).unwrap();

        heap.set_pblock(2, BlockLink::new(9));
        assert!(!heap.integrity_check());
    }

    #[test]
    fn a_descending_chain_link_is_caught() {
        let mut region = Region([0; 128]);
        let mut heap = heap(&mut region);

        let _a = heap.allocate(4).unwrap();
        let _b = heap.allocate(4).unwrap();

        heap.set_nblock(2, BlockLink::new(1));
        assert!(!heap.integrity_check());
    }

    #[test]
    fn an_out_of_range_free_link_is_caught() {
        let mut region = Region([0; 128]);
        let mut heap = heap(&mut region);

        let a = heap.allocate(4).unwrap();
        unsafe { heap.free(a.as_ptr()) };

        heap.set_nfree(0, 999);
        assert!(!heap.integrity_check());
    }

    #[test]
    fn a_flag_desync_is_caught() {
        let mut region = Region([0; 128]);
        let mut heap = heap(&mut region);

        let _a = heap.allocate(4).unwrap();

        // Flag a used block as free without putting it on the ring.
        heap.set_nblock(1, heap.nblock(1).as_free());
        assert!(!heap.integrity_check());
    }
}
