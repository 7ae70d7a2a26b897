//! Pointer-sized task handles.
//!
//! A deque slot is a single machine word. Rather than storing arbitrary values
//! (which would make the speculative slot read performed by a thief a data
//! race), the deques in this crate store raw pointers, and convert them to and
//! from an owning handle type through the [`TaskHandle`] trait. A handle is
//! only turned back into its owning form once the caller has won the right to
//! the slot it was read from.
use alloc::{boxed::Box, sync::Arc};
use core::{pin::Pin, ptr::NonNull};

/// Trait implemented by owning handles to tasks which can be stored in a
/// work-stealing deque.
///
/// A quintessential example of a `TaskHandle` is [`Box`]. Handles which are
/// also [`Copy`], such as `&'static T`, do not own the task they point to; the
/// scheduler remains responsible for its lifetime, exactly as if the deque
/// stored a raw address.
///
/// # Safety
///
/// This is unsafe to implement because the deques rely on the following
/// invariants:
///
/// - [`into_ptr`] must return a pointer which remains valid until it is
///   passed back to [`from_ptr`].
/// - Calling [`from_ptr`] on a pointer returned by [`into_ptr`] must recover
///   a handle equivalent to the one that was converted.
///
/// [`into_ptr`]: TaskHandle::into_ptr
/// [`from_ptr`]: TaskHandle::from_ptr
pub unsafe trait TaskHandle: Sized {
    /// The task type this handle points to.
    type Target;

    /// Convert this handle to a raw pointer, taking ownership of it in the
    /// process.
    fn into_ptr(self) -> NonNull<Self::Target>;

    /// Convert a raw pointer back into an owning handle.
    ///
    /// # Safety
    ///
    /// The pointer must have been returned by [`TaskHandle::into_ptr`], and,
    /// unless `Self` is [`Copy`], this function may be called at most once
    /// for each call to `into_ptr`.
    unsafe fn from_ptr(ptr: NonNull<Self::Target>) -> Self;
}

unsafe impl<T> TaskHandle for Box<T> {
    type Target = T;

    #[inline]
    fn into_ptr(self) -> NonNull<T> {
        NonNull::from(Box::leak(self))
    }

    #[inline]
    unsafe fn from_ptr(ptr: NonNull<T>) -> Self {
        Box::from_raw(ptr.as_ptr())
    }
}

unsafe impl<T> TaskHandle for Pin<Box<T>> {
    type Target = T;

    #[inline]
    fn into_ptr(self) -> NonNull<T> {
        // Safety: the pointer is only ever converted back into a `Pin<Box<T>>`
        // by `from_ptr`, so the pointee is never moved.
        unsafe { NonNull::from(Box::leak(Pin::into_inner_unchecked(self))) }
    }

    #[inline]
    unsafe fn from_ptr(ptr: NonNull<T>) -> Self {
        Pin::new_unchecked(Box::from_raw(ptr.as_ptr()))
    }
}

unsafe impl<T> TaskHandle for Arc<T> {
    type Target = T;

    #[inline]
    fn into_ptr(self) -> NonNull<T> {
        let ptr = Arc::into_raw(self) as *mut T;
        // Safety: `Arc::into_raw` never returns a null pointer.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    #[inline]
    unsafe fn from_ptr(ptr: NonNull<T>) -> Self {
        Arc::from_raw(ptr.as_ptr() as *const T)
    }
}

unsafe impl<T: Sync + 'static> TaskHandle for &'static T {
    type Target = T;

    #[inline]
    fn into_ptr(self) -> NonNull<T> {
        NonNull::from(self)
    }

    #[inline]
    unsafe fn from_ptr(ptr: NonNull<T>) -> Self {
        &*ptr.as_ptr()
    }
}
