//! A fixed-capacity Chase-Lev work-stealing deque.
//!
//! One owner thread pushes and pops items at the *bottom* of the deque, using
//! a [`Worker`]. Any number of thief threads steal items from the *top* of the
//! deque, using [`Stealer`]s. Ownership of every logical index is arbitrated by
//! a single compare-and-swap on `top`; the owner only pays for that CAS when it
//! races thieves for the very last item.
//!
//! Based on ["Dynamic Circular Work-Stealing Deque"][chase-lev] by David Chase
//! and Yossi Lev, with the memory orderings from ["Correct and Efficient
//! Work-Stealing for Weak Memory Models"][le2013] by Lê et al. The buffer is
//! never grown: a `push` onto a full deque hands the item back.
//!
//! [chase-lev]: https://doi.org/10.1145/1073970.1073974
//! [le2013]: https://doi.org/10.1145/2442516.2442524
use crate::{
    buffer::Buffer,
    handle::TaskHandle,
    loom::sync::{
        atomic::{self, AtomicIsize, Ordering::*},
        Arc,
    },
    steal::{PushError, Steal},
    util::{Backoff, CachePadded},
};
use core::{cell::Cell, fmt, marker::PhantomData};

/// The owner side of a Chase-Lev work-stealing deque.
///
/// A `Worker` may be moved to another thread, but not shared: only one thread
/// can ever push or pop.
pub struct Worker<H: TaskHandle> {
    inner: Arc<Inner<H>>,
    _not_sync: PhantomData<Cell<()>>,
}

/// A handle for stealing items from the top of a [`Worker`]'s deque.
///
/// `Stealer`s may be freely cloned and shared between threads.
pub struct Stealer<H: TaskHandle> {
    inner: Arc<Inner<H>>,
}

struct Inner<H: TaskHandle> {
    /// The index one past the most recently pushed item. Only the owner
    /// writes this.
    bottom: CachePadded<AtomicIsize>,

    /// The index of the next item to steal. Only ever increases, and (except
    /// for the owner's last-item race) only by a thief's CAS.
    top: CachePadded<AtomicIsize>,

    buffer: Buffer<H>,
}

// === impl Worker ===

impl<H: TaskHandle> Worker<H> {
    /// Returns a new, empty deque which can hold up to `capacity` items.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero or greater than `isize::MAX`.
    #[must_use]
    #[track_caller]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity <= isize::MAX as usize,
            "capacity {capacity} exceeds the maximum deque capacity"
        );
        Self {
            inner: Arc::new(Inner {
                bottom: CachePadded(AtomicIsize::new(0)),
                top: CachePadded(AtomicIsize::new(0)),
                buffer: Buffer::new(capacity),
            }),
            _not_sync: PhantomData,
        }
    }

    /// Returns a new [`Stealer`] for this deque.
    #[must_use]
    pub fn stealer(&self) -> Stealer<H> {
        Stealer {
            inner: self.inner.clone(),
        }
    }

    /// Push an item onto the bottom of the deque.
    ///
    /// # Returns
    ///
    /// - `Ok(())` if the item was pushed.
    /// - [`Err`]`(`[`PushError::Full`]`)` if the deque already holds
    ///   [`capacity`](Self::capacity) items. The item is returned.
    pub fn push(&self, handle: H) -> Result<(), PushError<H>> {
        let inner = &*self.inner;
        let b = inner.bottom.load(Relaxed);
        let t = inner.top.load(Acquire);
        if b - t > inner.capacity() - 1 {
            test_trace!(b, t, "push: full");
            return Err(PushError::Full(handle));
        }

        inner.buffer.write(b as usize, handle);
        // Publish the slot before the new `bottom`: a thief that acquires the
        // new `bottom` must see the item.
        atomic::fence(Release);
        inner.bottom.store(b + 1, Relaxed);
        test_trace!(b, t, "push");
        Ok(())
    }

    /// Pop the most recently pushed item from the bottom of the deque.
    ///
    /// Returns `None` if the deque is empty, or if a thief won the race for
    /// the last item.
    pub fn pop(&self) -> Option<H> {
        let inner = &*self.inner;
        // Announce the claim on the bottom slot before looking at `top`.
        let b = inner.bottom.load(Relaxed) - 1;
        inner.bottom.store(b, Relaxed);
        atomic::fence(SeqCst);
        let t = inner.top.load(Relaxed);

        if t > b {
            // Already empty.
            inner.bottom.store(b + 1, Relaxed);
            test_trace!(b, t, "pop: empty");
            return None;
        }

        let ptr = unsafe {
            // Safety: `t <= b`, so the owner wrote slot `b` on an earlier push.
            inner.buffer.read(b as usize)
        };

        if t < b {
            // More than one item left; no thief can reach slot `b`.
            test_trace!(b, t, "pop");
            return Some(unsafe { H::from_ptr(ptr) });
        }

        // This is the last item, and thieves may be racing for it.
        let won = inner
            .top
            .compare_exchange(t, t + 1, SeqCst, Relaxed)
            .is_ok();
        inner.bottom.store(b + 1, Relaxed);
        test_trace!(b, t, won, "pop: last item");
        if won {
            Some(unsafe {
                // Safety: the CAS on `top` gave us index `t`.
                H::from_ptr(ptr)
            })
        } else {
            None
        }
    }

    /// Returns the number of items in the deque.
    ///
    /// Thieves may concurrently remove items, so this is only a snapshot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the deque contains no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the maximum number of items this deque can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.buffer.capacity()
    }
}

impl<H: TaskHandle> fmt::Debug for Worker<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker").field("deque", &self.inner).finish()
    }
}

// === impl Stealer ===

impl<H: TaskHandle> Stealer<H> {
    /// Attempt to steal the least recently pushed item from the top of the
    /// deque.
    ///
    /// # Returns
    ///
    /// - [`Steal::Success`] with the item, which now belongs to the caller.
    /// - [`Steal::Empty`] if there was nothing to steal.
    /// - [`Steal::Retry`] if another thread claimed the item first. Nothing
    ///   was removed, and the caller may try again.
    pub fn steal(&self) -> Steal<H> {
        let inner = &*self.inner;
        let t = inner.top.load(Acquire);
        atomic::fence(SeqCst);
        let b = inner.bottom.load(Acquire);
        if t >= b {
            return Steal::Empty;
        }

        // This read may race with the owner popping the same slot. That's
        // fine: the value is only used if the CAS below wins index `t`.
        let ptr = unsafe {
            // Safety: `t < b`, and acquiring `bottom` synchronized with the
            // push that wrote slot `t`.
            inner.buffer.read(t as usize)
        };
        if inner
            .top
            .compare_exchange(t, t + 1, SeqCst, Relaxed)
            .is_err()
        {
            test_trace!(b, t, "steal: lost race");
            return Steal::Retry;
        }

        test_trace!(b, t, "steal");
        Steal::Success(unsafe {
            // Safety: the CAS on `top` gave us index `t`.
            H::from_ptr(ptr)
        })
    }

    /// Steal an item, retrying with an exponential backoff whenever the steal
    /// loses a race.
    ///
    /// Returns `None` only once the deque is observed to be empty.
    pub fn steal_until_settled(&self) -> Option<H> {
        let mut boff = Backoff::new();
        loop {
            match self.steal() {
                Steal::Success(handle) => return Some(handle),
                Steal::Empty => return None,
                Steal::Retry => boff.spin(),
            }
        }
    }

    /// Returns the number of items in the deque.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the deque contains no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<H: TaskHandle> Clone for Stealer<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H: TaskHandle> fmt::Debug for Stealer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stealer").field("deque", &self.inner).finish()
    }
}

// === impl Inner ===

impl<H: TaskHandle> Inner<H> {
    #[inline]
    fn capacity(&self) -> isize {
        self.buffer.capacity() as isize
    }

    fn len(&self) -> usize {
        let t = self.top.load(Acquire);
        let b = self.bottom.load(Acquire);
        // `bottom` is transiently one below `top` while the owner pops from an
        // empty deque.
        (b - t).max(0) as usize
    }
}

impl<H: TaskHandle> Drop for Inner<H> {
    fn drop(&mut self) {
        let t = self.top.load(Relaxed);
        let b = self.bottom.load(Relaxed);
        for i in t..b {
            unsafe {
                // Safety: we are the last reference to the deque, so every
                // item between `top` and `bottom` is unclaimed.
                drop(H::from_ptr(self.buffer.read(i as usize)));
            }
        }
    }
}

impl<H: TaskHandle> fmt::Debug for Inner<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deque")
            .field("top", &self.top.load(Relaxed))
            .field("bottom", &self.bottom.load(Relaxed))
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(all(loom, test))]
mod loom {
    use super::*;
    use crate::loom::{self, alloc::Track, thread};
    use alloc::{boxed::Box, vec::Vec};

    type Entry = Box<Track<usize>>;

    fn entry(val: usize) -> Entry {
        Box::new(Track::new(val))
    }

    #[test]
    fn push_while_stealing() {
        loom::model(|| {
            let worker = Worker::<Entry>::new(2);
            let stealer = worker.stealer();

            let thief = thread::spawn(move || {
                let mut stolen = Vec::new();
                for _ in 0..2 {
                    if let Some(entry) = stealer.steal_until_settled() {
                        stolen.push(*entry.get_ref());
                    }
                }
                stolen
            });

            worker.push(entry(1)).unwrap();
            worker.push(entry(2)).unwrap();

            let stolen = thief.join().unwrap();
            // Stealing is FIFO, so the thief got a prefix of the pushes.
            assert_eq!(&stolen[..], &[1, 2][..stolen.len()]);
            // Whatever the thief left behind is still in the deque.
            assert_eq!(worker.len(), 2 - stolen.len());
        })
    }

    #[test]
    fn thieves_never_share_an_item() {
        loom::model(|| {
            let worker = Worker::<Entry>::new(2);
            worker.push(entry(1)).unwrap();
            worker.push(entry(2)).unwrap();

            let thieves: Vec<_> = (0..2)
                .map(|_| {
                    let stealer = worker.stealer();
                    thread::spawn(move || stealer.steal_until_settled().map(|e| *e.get_ref()))
                })
                .collect();

            let mut stolen: Vec<usize> = thieves
                .into_iter()
                .filter_map(|thief| thief.join().unwrap())
                .collect();
            stolen.sort_unstable();
            assert_eq!(stolen, [1, 2]);
            assert!(worker.is_empty());
        })
    }

    #[test]
    fn owner_and_thief_race_for_last_item() {
        loom::model(|| {
            let worker = Worker::<Entry>::new(2);
            let stealer = worker.stealer();
            worker.push(entry(1)).unwrap();

            let thief = thread::spawn(move || stealer.steal().success().map(|e| *e.get_ref()));

            let popped = worker.pop().map(|e| *e.get_ref());
            let stolen = thief.join().unwrap();
            // Exactly one side wins the item.
            assert!(
                popped.is_some() ^ stolen.is_some(),
                "popped: {popped:?}, stolen: {stolen:?}"
            );
            assert_eq!(popped.or(stolen), Some(1));
            assert!(worker.is_empty());
            assert_eq!(worker.pop().map(|e| *e.get_ref()), None);
        })
    }

    #[test]
    fn dropping_worker_drops_items() {
        // Loom's leak checking fails this test if the deque leaks the items
        // still in it when the last handle is dropped.
        loom::model(|| {
            let worker = Worker::<Entry>::new(4);
            let stealer = worker.stealer();
            worker.push(entry(1)).unwrap();
            worker.push(entry(2)).unwrap();
            worker.push(entry(3)).unwrap();

            let thief = thread::spawn(move || {
                let _ = stealer.steal();
            });

            drop(worker.pop());
            drop(worker);
            thief.join().unwrap();
        })
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use std::sync::Arc as StdArc;

    #[test]
    fn pop_empty() {
        let worker = Worker::<Box<u32>>::new(4);
        assert_eq!(worker.pop(), None);
        // Popping an empty deque must leave it usable.
        worker.push(Box::new(1)).unwrap();
        assert_eq!(worker.pop(), Some(Box::new(1)));
        assert_eq!(worker.pop(), None);
        assert_eq!(worker.len(), 0);
    }

    #[test]
    fn steal_empty() {
        let worker = Worker::<Box<u32>>::new(4);
        assert_eq!(worker.stealer().steal(), Steal::Empty);
    }

    #[test]
    fn pop_is_lifo() {
        let worker = Worker::new(8);
        for i in 0..8 {
            worker.push(Box::new(i)).unwrap();
        }
        for i in (0..8).rev() {
            assert_eq!(worker.pop(), Some(Box::new(i)));
        }
        assert_eq!(worker.pop(), None);
    }

    #[test]
    fn steal_is_fifo() {
        let worker = Worker::new(8);
        let stealer = worker.stealer();
        for i in 0..5 {
            worker.push(Box::new(i)).unwrap();
        }
        for i in 0..5 {
            assert_eq!(stealer.steal(), Steal::Success(Box::new(i)));
        }
        assert_eq!(stealer.steal(), Steal::Empty);
    }

    #[test]
    fn full_deque_returns_item() {
        let worker = Worker::new(3);
        for i in 0..3 {
            worker.push(Box::new(i)).unwrap();
        }
        let err = worker.push(Box::new(3)).unwrap_err();
        assert_eq!(*err.into_inner(), 3);
        assert_eq!(worker.len(), 3);

        // Making room lets the next push through.
        assert!(worker.stealer().steal().is_success());
        worker.push(Box::new(4)).unwrap();
        assert_eq!(worker.len(), 3);
    }

    #[test]
    fn owner_and_thieves_split_the_deque() {
        let worker = Worker::new(4);
        let thief1 = worker.stealer();
        let thief2 = thief1.clone();
        worker.push(Box::new('A')).unwrap();
        worker.push(Box::new('B')).unwrap();
        worker.push(Box::new('C')).unwrap();

        assert_eq!(worker.pop(), Some(Box::new('C')));
        assert_eq!(thief1.steal(), Steal::Success(Box::new('A')));
        assert_eq!(thief2.steal(), Steal::Success(Box::new('B')));
        assert_eq!(thief1.steal(), Steal::Empty);
        assert_eq!(worker.pop(), None);
    }

    #[test]
    fn indices_wrap_around_the_buffer() {
        let worker = Worker::new(2);
        let stealer = worker.stealer();
        for i in 0..100 {
            worker.push(Box::new(i)).unwrap();
            worker.push(Box::new(i + 1000)).unwrap();
            assert_eq!(stealer.steal().success(), Some(Box::new(i)));
            assert_eq!(worker.pop(), Some(Box::new(i + 1000)));
        }
        assert!(worker.is_empty());
    }

    #[test]
    fn drop_releases_remaining_items() {
        let task = StdArc::new(());
        {
            let worker = Worker::new(4);
            let stealer = worker.stealer();
            for _ in 0..4 {
                worker.push(task.clone()).unwrap();
            }
            drop(stealer.steal());
            assert_eq!(StdArc::strong_count(&task), 4);
            drop(worker);
            // The stealer keeps the deque alive.
            assert_eq!(StdArc::strong_count(&task), 4);
        }
        assert_eq!(StdArc::strong_count(&task), 1);
    }

    #[test]
    fn steal_until_settled_drains() {
        let worker = Worker::new(16);
        for i in 0..16 {
            worker.push(Box::new(i)).unwrap();
        }
        let stealer = worker.stealer();
        let mut n = 0;
        while let Some(item) = stealer.steal_until_settled() {
            assert_eq!(*item, n);
            n += 1;
        }
        assert_eq!(n, 16);
    }

    #[test]
    fn stealer_is_send_sync() {
        crate::util::assert_send_sync::<Stealer<Box<u32>>>();
        crate::util::assert_send::<Worker<Box<u32>>>();
    }

    #[test]
    #[should_panic]
    fn zero_capacity() {
        let _ = Worker::<Box<u32>>::new(0);
    }

    #[test]
    fn concurrent_exactly_once() {
        use std::{sync::Mutex, thread, vec::Vec};

        const ITEMS: usize = if cfg!(miri) { 100 } else { 10_000 };
        const THIEVES: usize = 3;

        crate::loom::model(|| {
            let worker = Worker::<Box<usize>>::new(64);
            let seen = StdArc::new(Mutex::new(Vec::new()));
            let done = StdArc::new(core::sync::atomic::AtomicBool::new(false));

            let thieves: Vec<_> = (0..THIEVES)
                .map(|_| {
                    let stealer = worker.stealer();
                    let seen = seen.clone();
                    let done = done.clone();
                    thread::spawn(move || {
                        let mut mine = Vec::new();
                        loop {
                            match stealer.steal() {
                                Steal::Success(item) => mine.push(*item),
                                Steal::Retry => {}
                                Steal::Empty if done.load(SeqCst) => break,
                                Steal::Empty => thread::yield_now(),
                            }
                        }
                        seen.lock().unwrap().extend(mine);
                    })
                })
                .collect();

            let mut popped = Vec::new();
            let mut next = 0;
            while next < ITEMS {
                match worker.push(Box::new(next)) {
                    Ok(()) => next += 1,
                    Err(PushError::Full(item)) => {
                        drop(item);
                        if let Some(item) = worker.pop() {
                            popped.push(*item);
                        }
                    }
                }
                if next % 3 == 0 {
                    if let Some(item) = worker.pop() {
                        popped.push(*item);
                    }
                }
            }
            while let Some(item) = worker.pop() {
                popped.push(*item);
            }
            done.store(true, SeqCst);
            for thief in thieves {
                thief.join().unwrap();
            }

            let mut seen = StdArc::try_unwrap(seen).unwrap().into_inner().unwrap();
            seen.extend(popped);
            seen.sort_unstable();
            assert_eq!(seen, (0..ITEMS).collect::<Vec<_>>());
        })
    }
}
