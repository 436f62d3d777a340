//! Allocators backing control blocks.
//!
//! The allocator used for a control block is injected as a type
//! parameter on the handle types rather than hard-wired, so the
//! primitive can be exercised against instrumented allocators in
//! isolation. [`SystemAllocator`] is the default and forwards to the
//! global allocator.

use std::alloc::{self, handle_alloc_error, Layout};
use std::ptr::NonNull;

/// Allocation interface for control blocks.
///
/// Implementations are infallible from the caller's point of view: an
/// exhausted allocator must divert to [`handle_alloc_error`] instead of
/// returning. Control blocks always have a non-zero size, so
/// implementations never see zero-sized layouts.
pub trait BlockAllocator {
    /// Allocates a block of memory fitting `layout`.
    fn allocate(&self, layout: Layout) -> NonNull<u8>;

    /// Deallocates the block of memory at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`] on the same
    /// allocator with the same `layout`, and must not be used again
    /// afterwards.
    ///
    /// [`allocate`]: BlockAllocator::allocate
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The default block allocator, backed by [`std::alloc`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SystemAllocator;

impl BlockAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> NonNull<u8> {
        debug_assert!(layout.size() != 0, "control blocks are never zero-sized");

        // Safety: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc(layout) };
        match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => handle_alloc_error(layout),
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // Safety: forwarded from the caller's contract; the pointer
        // came from `alloc::alloc` with this layout.
        unsafe { alloc::dealloc(ptr.as_ptr(), layout) }
    }
}
