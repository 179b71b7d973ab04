//! Build-time configuration of the heap geometry.
//!
//! Everything in here is a compile-time decision: the heap image is not
//! portable across builds that disagree on these values.

use core::cell::UnsafeCell;

/// User-data bytes carried by a single block.
///
/// A block is this many bytes plus the 4-byte chain header, so the
/// default of 4 yields 8-byte blocks. Must be at least 4 so that a free
/// block body can hold the two free-ring link words.
pub const BLOCK_BODY_SIZE: usize = 4;

/// Bytes taken by the chain header (`next`/`prev` link words) at the
/// start of every block.
pub const HEADER_SIZE: usize = 4;

/// Total size of one block in bytes.
pub const BLOCK_SIZE: usize = BLOCK_BODY_SIZE + HEADER_SIZE;

/// Alignment guaranteed for every pointer handed out by the allocator,
/// and required of the heap region itself. Alignment stronger than this
/// is not supported.
pub const BODY_ALIGN: usize = 4;

/// Size in bytes of the built-in region used by [`crate::init`].
///
/// Hosts that own a dedicated memory region (a linker-placed pool, a
/// page-provisioned arena) should ignore this and call
/// [`crate::init_heap`] instead.
pub const HEAP_SIZE: usize = 4096;

/// Region backing the argument-less [`crate::init`].
#[repr(align(8))]
struct DefaultRegion(UnsafeCell<[u8; HEAP_SIZE]>);

// SAFETY: the region is only ever handed to the global heap, whose
// Mutex serializes all access.
unsafe impl Sync for DefaultRegion {}

static DEFAULT_REGION: DefaultRegion = DefaultRegion(UnsafeCell::new([0; HEAP_SIZE]));

/// Base address of the built-in [`HEAP_SIZE`]-byte region used by
/// [`crate::init`].
///
/// This crate-owned static region is the portable stand-in for a
/// fixed, build-time heap address: on a hosted target the linker picks
/// where it lives. Hosts whose heap sits at a hardware- or
/// linker-given address call [`crate::init_heap`] with their own base
/// instead.
pub fn heap_addr() -> *mut u8 {
    DEFAULT_REGION.0.get().cast()
}

/// Width of the in-band length word written ahead of every poisoned
/// allocation.
#[cfg(feature = "poison-check")]
pub type PoisonLen = u16;

/// Guard bytes written immediately before the user region of a
/// poisoned allocation.
#[cfg(feature = "poison-check")]
pub const POISON_SIZE_BEFORE: usize = 4;

/// Guard bytes written immediately after the user region of a
/// poisoned allocation.
#[cfg(feature = "poison-check")]
pub const POISON_SIZE_AFTER: usize = 4;
