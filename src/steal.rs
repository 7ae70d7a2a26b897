//! Result types shared by the work-stealing deques.
use core::fmt;

/// The outcome of a [`chase_lev::Stealer::steal`] or
/// [`idempotent::Stealer::steal`] call.
///
/// [`Retry`](Steal::Retry) is distinct from [`Empty`](Steal::Empty): it means
/// the deque had an item, but another thread claimed it (or changed the deque)
/// between this thief's read and its compare-and-swap. Nothing was removed,
/// and the caller should try again.
///
/// [`chase_lev::Stealer::steal`]: crate::chase_lev::Stealer::steal
/// [`idempotent::Stealer::steal`]: crate::idempotent::Stealer::steal
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Steal<H> {
    /// The deque was empty at the time of stealing.
    Empty,
    /// Lost the race for the item to another concurrent operation.
    Retry,
    /// An item was stolen, and now belongs exclusively to the thief.
    Success(H),
}

/// Error returned by `push` when a deque is full.
///
/// The rejected handle is returned to the caller, which must either run the
/// task itself or hand it elsewhere.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PushError<H> {
    /// The deque already holds as many items as its capacity.
    Full(H),
}

// === impl Steal ===

impl<H> Steal<H> {
    /// Returns the stolen item, if there was one.
    #[inline]
    pub fn success(self) -> Option<H> {
        match self {
            Steal::Success(handle) => Some(handle),
            _ => None,
        }
    }

    /// Returns `true` if the deque was empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Steal::Empty)
    }

    /// Returns `true` if the steal lost a race and should be retried.
    #[inline]
    pub fn is_retry(&self) -> bool {
        matches!(self, Steal::Retry)
    }

    /// Returns `true` if an item was stolen.
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Steal::Success(_))
    }
}

// === impl PushError ===

impl<H> PushError<H> {
    /// Returns the handle that could not be pushed.
    #[inline]
    pub fn into_inner(self) -> H {
        match self {
            PushError::Full(handle) => handle,
        }
    }
}

impl<H> fmt::Debug for PushError<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.debug_tuple("Full").field(&format_args!("..")).finish(),
        }
    }
}

impl<H> fmt::Display for PushError<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("work-stealing deque is full"),
        }
    }
}

impl<H> core::error::Error for PushError<H> {}
