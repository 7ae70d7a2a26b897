use crate::{
    handle::TaskHandle,
    loom::sync::atomic::{AtomicPtr, Ordering::*},
};
use alloc::{boxed::Box, vec::Vec};
use core::{fmt, marker::PhantomData, ptr::NonNull};

/// A fixed-capacity, circularly indexed array of task slots.
///
/// Every index passed to a `Buffer` is a logical position in the owning
/// deque; it is reduced modulo the capacity here, and nowhere else.
///
/// Slots are atomic pointers so that a thief's speculative read of a slot the
/// owner is concurrently overwriting is well-defined. The buffer itself never
/// takes ownership of a handle: whoever wins the claim on a logical index
/// converts the pointer back with [`TaskHandle::from_ptr`].
pub(crate) struct Buffer<H: TaskHandle> {
    slots: Box<[AtomicPtr<H::Target>]>,
    _handle: PhantomData<H>,
}

impl<H: TaskHandle> Buffer<H> {
    #[track_caller]
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "a work-stealing deque must have a non-zero capacity");
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(core::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            _handle: PhantomData,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, index: usize) -> &AtomicPtr<H::Target> {
        &self.slots[index % self.slots.len()]
    }

    /// Store `handle` at logical position `index`.
    ///
    /// The store is relaxed; publishing it to other threads is the caller's
    /// job.
    #[inline]
    pub(crate) fn write(&self, index: usize, handle: H) {
        let ptr = H::into_ptr(handle);
        self.slot(index).store(ptr.as_ptr(), Relaxed);
    }

    /// Read the pointer stored at logical position `index`, without claiming
    /// it.
    ///
    /// # Safety
    ///
    /// A handle must have been written to `index` before the caller
    /// synchronized with that write.
    #[inline]
    pub(crate) unsafe fn read(&self, index: usize) -> NonNull<H::Target> {
        let ptr = self.slot(index).load(Relaxed);
        debug_assert!(
            !ptr.is_null(),
            "read an empty work-stealing deque slot at index {index}; this is a bug in `hyphae`!"
        );
        NonNull::new_unchecked(ptr)
    }
}

// Slots are handed between threads, but never shared: a handle is only ever
// recovered by the single thread that won its claim.
unsafe impl<H: TaskHandle + Send> Send for Buffer<H> {}
unsafe impl<H: TaskHandle + Send> Sync for Buffer<H> {}

impl<H: TaskHandle> fmt::Debug for Buffer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn indices_wrap_around() {
        let buf = Buffer::<Box<usize>>::new(4);
        buf.write(1, Box::new(1));
        buf.write(6, Box::new(6));
        unsafe {
            assert_eq!(*Box::from_ptr(buf.read(5)), 1);
            assert_eq!(*Box::from_ptr(buf.read(2)), 6);
        }
    }

    #[test]
    #[should_panic]
    fn zero_capacity() {
        let _ = Buffer::<Box<usize>>::new(0);
    }
}
