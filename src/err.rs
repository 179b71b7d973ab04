//! Error types raised by the allocator.

use core::fmt::Debug;

/// `BaseError` is a common trait implemented by every error type
/// defined in this crate.
///
/// It is dependent on the [`Debug`] trait, so that any error can be
/// reported through the logger hook or a panic message.
pub trait BaseError: Debug {}

/// `CanFail` is a return type for operations that are allowed to fail,
/// and don't need to return anything.
pub type CanFail<T> = Result<(), T>;

/// `HeapError` covers everything that can go wrong while setting up or
/// checking a heap.
///
/// Allocation failure is deliberately not represented here: running out
/// of memory is an expected outcome and is reported as a null result by
/// the allocation entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The supplied region cannot hold the two sentinel blocks plus at
    /// least one allocatable block.
    RegionTooSmall,

    /// The supplied region holds more blocks than a 15-bit index can
    /// address.
    RegionTooLarge,

    /// The supplied region does not satisfy the block body alignment.
    Misaligned,

    /// `init_heap` (or a one-shot hook registration) was attempted a
    /// second time.
    AlreadyInitialized,
}

impl BaseError for HeapError {}
