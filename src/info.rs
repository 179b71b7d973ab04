//! Heap introspection: walking the block chain and deriving usage and
//! fragmentation figures from it.
//!
//! Getting debug information out of the heap only takes a single pass
//! over the block chain: the free flag and the distance to the next
//! block tell the whole story of every entry. The walk fills the
//! [`HeapInfo`] record kept inside the handle.

use core::ptr::{self, NonNull};

use bytemuck::Zeroable;
use log::debug;

use crate::config::BLOCK_SIZE;
use crate::heap::Heap;

/// Aggregate state of the heap, refreshed by [`Heap::introspect`].
///
/// Entries are chain entries (one allocation or one free run); blocks
/// are the fixed-size cells they span. The two sentinels are counted in
/// neither.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Zeroable)]
pub struct HeapInfo {
    pub total_entries: u16,
    pub used_entries: u16,
    pub free_entries: u16,

    pub total_blocks: u16,
    pub used_blocks: u16,
    pub free_blocks: u16,

    /// Sum of squared free-run sizes, feeding the fragmentation
    /// metric.
    pub free_blocks_squared: u32,
    pub max_free_contiguous_blocks: u16,

    /// `100 * used / free` blocks, or -1 when nothing is free.
    pub usage_metric: i32,

    /// 0 when the free pool is one contiguous run, approaching 100 as
    /// it shatters.
    pub fragmentation_metric: i32,
}

impl Heap {
    /// Walks the block chain and refreshes the heap-info record.
    ///
    /// When `probe` equals the base address of a free block, the walk
    /// notes the hit and hands the probe back once the record is
    /// complete: a non-null result means the pointer sits on the free
    /// list. `force` additionally dumps the block table through the
    /// logger at debug level.
    pub fn introspect(&mut self, probe: *const u8, force: bool) -> Option<NonNull<u8>> {
        self.info = HeapInfo::zeroed();

        let mut hit: Option<NonNull<u8>> = None;
        let mut c = self.nblock(0).index();

        while self.nblock(c).index() != 0 {
            let run = self.nblock(c).index() - c;

            self.info.total_entries += 1;
            self.info.total_blocks += run;

            if self.nblock(c).is_free() {
                self.info.free_entries += 1;
                self.info.free_blocks += run;
                self.info.free_blocks_squared += u32::from(run) * u32::from(run);

                if self.info.max_free_contiguous_blocks < run {
                    self.info.max_free_contiguous_blocks = run;
                }

                if force {
                    debug!(
                        "|B {:5}|NB {:5}|PB {:5}|Z {:5}|NF {:5}|PF {:5}|",
                        c,
                        self.nblock(c).index(),
                        self.pblock(c).index(),
                        run,
                        self.nfree(c),
                        self.pfree(c)
                    );
                }

                if hit.is_none() && probe == self.block_ptr(c) {
                    hit = Some(unsafe { NonNull::new_unchecked(self.block_ptr(c) as *mut u8) });
                }
            } else {
                self.info.used_entries += 1;
                self.info.used_blocks += run;

                if force {
                    debug!(
                        "|B {:5}|NB {:5}|PB {:5}|Z {:5}|                 |",
                        c,
                        self.nblock(c).index(),
                        self.pblock(c).index(),
                        run
                    );
                }
            }

            c = self.nblock(c).index();
        }

        self.compute_usage_metric();
        self.compute_fragmentation_metric();

        if force {
            debug!(
                "entries: total {:5} used {:5} free {:5}",
                self.info.total_entries, self.info.used_entries, self.info.free_entries
            );
            debug!(
                "blocks:  total {:5} used {:5} free {:5}",
                self.info.total_blocks, self.info.used_blocks, self.info.free_blocks
            );
            debug!("usage metric:         {:5}", self.info.usage_metric);
            debug!("fragmentation metric: {:5}", self.info.fragmentation_metric);
        }

        hit
    }

    /// The heap-info record as of the last refresh.
    pub fn info(&self) -> &HeapInfo {
        &self.info
    }

    /// Bytes currently sitting in free blocks.
    pub fn free_heap_bytes(&mut self) -> usize {
        #[cfg(not(feature = "inline-metrics"))]
        let _ = self.introspect(ptr::null(), false);

        self.info.free_blocks as usize * BLOCK_SIZE
    }

    /// Size in bytes of the largest contiguous free run.
    pub fn max_free_contiguous_bytes(&mut self) -> usize {
        let _ = self.introspect(ptr::null(), false);

        self.info.max_free_contiguous_blocks as usize * BLOCK_SIZE
    }

    /// Used-to-free block ratio, scaled to percent. -1 when no free
    /// blocks remain.
    pub fn usage_metric(&mut self) -> i32 {
        #[cfg(feature = "inline-metrics")]
        {
            self.info.used_blocks = self.numblocks - 2 - self.info.free_blocks;
            self.compute_usage_metric();
        }

        #[cfg(not(feature = "inline-metrics"))]
        let _ = self.introspect(ptr::null(), false);

        self.info.usage_metric
    }

    /// One minus the coefficient of variation of the free-run sizes,
    /// scaled to percent. 0 when the free pool is one contiguous run.
    pub fn fragmentation_metric(&mut self) -> i32 {
        #[cfg(feature = "inline-metrics")]
        self.compute_fragmentation_metric();

        #[cfg(not(feature = "inline-metrics"))]
        let _ = self.introspect(ptr::null(), false);

        self.info.fragmentation_metric
    }

    fn compute_usage_metric(&mut self) {
        if self.info.free_blocks == 0 {
            self.info.usage_metric = -1;
        } else {
            self.info.usage_metric =
                i32::from(self.info.used_blocks) * 100 / i32::from(self.info.free_blocks);
        }
    }

    fn compute_fragmentation_metric(&mut self) {
        if self.info.free_blocks == 0 {
            self.info.fragmentation_metric = 0;
        } else {
            self.info.fragmentation_metric = 100
                - (isqrt(self.info.free_blocks_squared) * 100 / u32::from(self.info.free_blocks))
                    as i32;
        }
    }

    /* ---------------------------------------------------------------
     * Inline metric hooks, called by the engines at the points where a
     * free run appears, grows, shrinks or disappears. Adding a run of
     * b blocks contributes (+b, +b^2) to the accumulators; removing
     * contributes the negatives.
     */

    #[cfg(feature = "inline-metrics")]
    pub(crate) fn metric_init(&mut self) {
        self.info.free_blocks = self.numblocks - 2;
        self.info.free_blocks_squared =
            u32::from(self.info.free_blocks) * u32::from(self.info.free_blocks);
    }

    #[cfg(feature = "inline-metrics")]
    pub(crate) fn metric_add(&mut self, c: u16) {
        let run = self.nblock(c).index() - c;

        self.info.free_blocks += run;
        self.info.free_blocks_squared += u32::from(run) * u32::from(run);
    }

    #[cfg(feature = "inline-metrics")]
    pub(crate) fn metric_remove(&mut self, c: u16) {
        let run = self.nblock(c).index() - c;

        self.info.free_blocks -= run;
        self.info.free_blocks_squared -= u32::from(run) * u32::from(run);
    }

    #[cfg(not(feature = "inline-metrics"))]
    #[inline]
    pub(crate) fn metric_init(&mut self) {}

    #[cfg(not(feature = "inline-metrics"))]
    #[inline]
    pub(crate) fn metric_add(&mut self, _c: u16) {}

    #[cfg(not(feature = "inline-metrics"))]
    #[inline]
    pub(crate) fn metric_remove(&mut self, _c: u16) {}
}

/// Integer square root, rounding down.
const fn isqrt(v: u32) -> u32 {
    if v < 2 {
        return v;
    }

    let mut x = v;
    let mut next = (x + v / x) / 2;

    while next < x {
        x = next;
        next = (x + v / x) / 2;
    }

    x
}
