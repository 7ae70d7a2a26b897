//! A reservation cache that deduplicates expensive builds.
//!
//! A [`ReservationCache`] maps a key (for instance, a compilation unit paired
//! with the context it is compiled for) to an [`Artifact`]. The first thread to
//! [`reserve`] a key inserts an empty placeholder artifact and becomes its
//! *producer*; every later reservation of that key gets the same artifact back.
//!
//! The whole table is guarded by a single reentrant lock, which a
//! [`Reservation`] keeps held until it is fulfilled or dropped. A thread that
//! wants an artifact another thread is still producing therefore blocks in
//! [`reserve`] rather than duplicating the work, and by the time it acquires
//! the lock the producer has finished. Because the lock is reentrant, a
//! producer may reserve further keys (such as the dependencies of the thing it
//! is building) while holding its own reservation.
//!
//! Entries are never evicted on completion: they serve as memoized results
//! until a garbage collector calls [`sweep`] with the set of artifacts it
//! still considers reachable.
//!
//! ```
//! use hyphae::reservation::ReservationCache;
//!
//! let cache = ReservationCache::<&str, String>::new();
//!
//! let reservation = cache.reserve("main");
//! assert!(reservation.is_new());
//! // ...do the expensive work, then publish it.
//! let artifact = reservation.fulfill(String::from("compiled main"));
//! assert!(artifact.is_complete());
//!
//! let again = cache.reserve("main");
//! assert!(!again.is_new());
//! assert_eq!(again.artifact().get().map(String::as_str), Some("compiled main"));
//! ```
//!
//! [`reserve`]: ReservationCache::reserve
//! [`sweep`]: ReservationCache::sweep
use core::{cell::UnsafeCell, fmt, hash::Hash, marker::PhantomData, time::Duration};
use lock_api::RawReentrantMutex;
use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
    thread::{self, ThreadId},
};


type RawLock = RawReentrantMutex<parking_lot::RawMutex, parking_lot::RawThreadId>;

/// A table of in-flight and completed build artifacts, guaranteeing that at
/// most one thread produces the artifact for any given key.
///
/// See the [module-level documentation](self) for details.
pub struct ReservationCache<K, V> {
    lock: RawLock,
    /// Only accessed while `lock` is held, through `Locked::with_table`.
    table: UnsafeCell<HashMap<K, Entry<V>>>,
}

/// An artifact handle tracked by a [`ReservationCache`].
///
/// An artifact starts out as an empty placeholder and is filled in exactly
/// once, when the [`Reservation`] that created it is fulfilled.
pub struct Artifact<V> {
    value: OnceLock<V>,
}

/// A held reservation of one key in a [`ReservationCache`].
///
/// While a `Reservation` exists, the current thread holds the cache's lock:
/// other threads calling [`ReservationCache::reserve`] block until it is
/// released. It is released by [`fulfill`](Self::fulfill), or by dropping the
/// `Reservation`.
///
/// If the reservation [created](Self::is_new) its entry and is dropped without
/// being fulfilled, the entry is *abandoned*: it is removed from the cache, so
/// that a later reservation of the same key may try again.
#[must_use = "a `Reservation` holds the cache's lock until it is fulfilled or dropped"]
pub struct Reservation<'cache, K: Hash + Eq + Clone, V> {
    locked: Locked<'cache, K, V>,
    key: K,
    producer: ThreadId,
    artifact: Arc<Artifact<V>>,
    is_new: bool,
    fulfilled: bool,
}

/// Errors returned by [`ReservationCache::try_reserve`] and
/// [`ReservationCache::reserve_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ReserveError {
    /// Another thread currently holds the cache's lock.
    #[error("the reservation cache is locked by another thread")]
    WouldBlock,
    /// The cache's lock could not be acquired before the timeout elapsed.
    #[error("timed out after {timeout:?} waiting for the reservation cache")]
    TimedOut {
        /// How long the caller waited.
        timeout: Duration,
    },
}

struct Entry<V> {
    producer: ThreadId,
    artifact: Arc<Artifact<V>>,
}

/// Proof that the current thread holds the cache's lock. Unlocks on drop.
struct Locked<'cache, K, V> {
    cache: &'cache ReservationCache<K, V>,
    // The lock must be released by the thread that acquired it.
    _not_send: PhantomData<*const ()>,
}

// === impl ReservationCache ===

impl<K, V> ReservationCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Returns a new, empty `ReservationCache`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Returns a new, empty `ReservationCache` with room for at least
    /// `capacity` entries before its table reallocates.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lock: RawLock::INIT,
            table: UnsafeCell::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Reserve `key`, blocking until the cache's lock is available.
    ///
    /// If no entry exists for `key`, a placeholder [`Artifact`] is inserted
    /// and the current thread becomes its producer; the returned reservation
    /// [`is_new`](Reservation::is_new) and must be
    /// [fulfilled](Reservation::fulfill). Otherwise, the existing artifact is
    /// returned. Unless it is this thread's own pending reservation (a
    /// reentrant call), the artifact is complete.
    ///
    /// This never fails. If the producer of `key` never releases its
    /// reservation, this blocks forever; use [`reserve_timeout`] to bound the
    /// wait.
    ///
    /// [`reserve_timeout`]: Self::reserve_timeout
    pub fn reserve(&self, key: K) -> Reservation<'_, K, V> {
        self.lock.lock();
        self.reserve_locked(self.locked(), key)
    }

    /// Reserve `key` if the cache's lock can be acquired without blocking.
    ///
    /// # Returns
    ///
    /// - `Ok(`[`Reservation`]`)` as returned by [`reserve`](Self::reserve).
    /// - [`Err`]`(`[`ReserveError::WouldBlock`]`)` if another thread holds
    ///   the lock.
    pub fn try_reserve(&self, key: K) -> Result<Reservation<'_, K, V>, ReserveError> {
        if !self.lock.try_lock() {
            return Err(ReserveError::WouldBlock);
        }
        Ok(self.reserve_locked(self.locked(), key))
    }

    /// Reserve `key`, waiting at most `timeout` for the cache's lock.
    ///
    /// # Returns
    ///
    /// - `Ok(`[`Reservation`]`)` as returned by [`reserve`](Self::reserve).
    /// - [`Err`]`(`[`ReserveError::TimedOut`]`)` if the lock was not acquired
    ///   in time.
    pub fn reserve_timeout(
        &self,
        key: K,
        timeout: Duration,
    ) -> Result<Reservation<'_, K, V>, ReserveError> {
        if !self.lock.try_lock_for(timeout) {
            tracing::debug!(?timeout, "timed out waiting for the reservation cache");
            return Err(ReserveError::TimedOut { timeout });
        }
        Ok(self.reserve_locked(self.locked(), key))
    }

    /// Returns the artifact for `key`, if there is one, blocking until the
    /// cache's lock is available.
    pub fn lookup(&self, key: &K) -> Option<Arc<Artifact<V>>> {
        self.lock.lock();
        self.locked()
            .with_table(|table| table.get(key).map(|entry| entry.artifact.clone()))
    }

    /// Remove every entry whose artifact is not reachable.
    ///
    /// This is intended to be called by a garbage collector once it has
    /// finished marking: `is_reachable` is called once per entry, and entries
    /// for which it returns `false` are removed. Sweeping takes the cache's
    /// lock, so it never runs concurrently with another thread's
    /// reservation.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self, mut is_reachable: impl FnMut(&Arc<Artifact<V>>) -> bool) -> usize {
        self.lock.lock();
        let locked = self.locked();

        // `is_reachable` runs outside of `with_table`, so that it may use the
        // cache itself.
        let entries = locked.with_table(|table| {
            table
                .iter()
                .map(|(key, entry)| (key.clone(), entry.artifact.clone()))
                .collect::<Vec<_>>()
        });
        let dead = entries
            .into_iter()
            .filter(|(_, artifact)| !is_reachable(artifact))
            .collect::<Vec<_>>();

        let removed = locked.with_table(|table| {
            dead.iter()
                .filter_map(|(key, artifact)| remove_if_same(table, key, artifact))
                .collect::<Vec<_>>()
        });
        drop(locked);

        let swept = removed.len();
        tracing::debug!(swept, "swept unreachable artifacts");
        swept
    }

    /// Returns the number of entries in the cache, blocking until the cache's
    /// lock is available.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock.lock();
        self.locked().with_table(|table| table.len())
    }

    /// Returns `true` if the cache has no entries, blocking until the cache's
    /// lock is available.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if any thread currently holds the cache's lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    /// Must only be called immediately after acquiring `self.lock`.
    fn locked(&self) -> Locked<'_, K, V> {
        debug_assert!(self.lock.is_owned_by_current_thread());
        Locked {
            cache: self,
            _not_send: PhantomData,
        }
    }

    fn reserve_locked<'cache>(
        &'cache self,
        locked: Locked<'cache, K, V>,
        key: K,
    ) -> Reservation<'cache, K, V> {
        let current = thread::current().id();
        let (producer, artifact, is_new) = locked.with_table(|table| {
            if let Some(entry) = table.get(&key) {
                return (entry.producer, entry.artifact.clone(), false);
            }
            let artifact = Arc::new(Artifact::placeholder());
            table.insert(
                key.clone(),
                Entry {
                    producer: current,
                    artifact: artifact.clone(),
                },
            );
            (current, artifact, true)
        });

        tracing::trace!(
            ?producer,
            is_new,
            complete = artifact.is_complete(),
            "reserved artifact"
        );
        Reservation {
            locked,
            key,
            producer,
            artifact,
            is_new,
            fulfilled: false,
        }
    }
}

impl<K, V> Default for ReservationCache<K, V>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> fmt::Debug for ReservationCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Reading the table would require taking the lock, which may block.
        f.debug_struct("ReservationCache")
            .field("locked", &self.lock.is_locked())
            .finish_non_exhaustive()
    }
}

// Artifacts are shared between every thread that reserves their key.
unsafe impl<K: Send, V: Send + Sync> Send for ReservationCache<K, V> {}
unsafe impl<K: Send, V: Send + Sync> Sync for ReservationCache<K, V> {}

/// Removes the entry for `key`, unless it has since been replaced by a
/// different artifact.
fn remove_if_same<K: Hash + Eq, V>(
    table: &mut HashMap<K, Entry<V>>,
    key: &K,
    artifact: &Arc<Artifact<V>>,
) -> Option<Entry<V>> {
    let same = table
        .get(key)
        .is_some_and(|entry| Arc::ptr_eq(&entry.artifact, artifact));
    if same {
        table.remove(key)
    } else {
        None
    }
}

// === impl Locked ===

impl<K, V> Locked<'_, K, V> {
    /// Access the table.
    ///
    /// `f` must not call back into the cache, and must not drop values whose
    /// destructors might. Values removed from the table should be returned
    /// and dropped by the caller instead.
    fn with_table<T>(&self, f: impl FnOnce(&mut HashMap<K, Entry<V>>) -> T) -> T {
        unsafe {
            // Safety: the existence of `self` means this thread holds the
            // lock, and `f` cannot reenter the cache, so this is the only
            // live reference to the table.
            f(&mut *self.cache.table.get())
        }
    }
}

impl<K, V> Drop for Locked<'_, K, V> {
    fn drop(&mut self) {
        unsafe {
            // Safety: a `Locked` is only constructed after acquiring the lock,
            // and it cannot leave the thread that acquired it.
            self.cache.lock.unlock()
        }
    }
}

// === impl Reservation ===

impl<K, V> Reservation<'_, K, V>
where
    K: Hash + Eq + Clone,
{
    /// Returns the reserved artifact.
    ///
    /// If this reservation [`is_new`](Self::is_new), the artifact is an empty
    /// placeholder until the reservation is fulfilled.
    #[must_use]
    pub fn artifact(&self) -> &Arc<Artifact<V>> {
        &self.artifact
    }

    /// Returns the identity of the thread which created this reservation's
    /// entry.
    ///
    /// A reservation that did not create the entry can tell whether the
    /// entry is its own thread's pending reservation by comparing this with
    /// the current thread's ID.
    #[must_use]
    pub fn producer(&self) -> ThreadId {
        self.producer
    }

    /// Returns `true` if this reservation created its entry, and is therefore
    /// responsible for [fulfilling](Self::fulfill) it.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Returns the reserved key.
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Publish the produced `value` and release the cache's lock.
    ///
    /// Returns the now-complete artifact.
    ///
    /// Only the reservation that created its entry fulfills it. Any other
    /// reservation (one that found an existing artifact, whether complete or
    /// this thread's own pending one) releases the lock by being dropped.
    ///
    /// # Panics
    ///
    /// If this reservation did not create its entry (i.e. it is not
    /// [`is_new`](Self::is_new)): only the producer may fulfill an artifact.
    #[track_caller]
    pub fn fulfill(mut self, value: V) -> Arc<Artifact<V>> {
        assert!(
            self.is_new,
            "only the reservation that created an entry may fulfill it"
        );
        let filled = self.artifact.value.set(value).is_ok();
        assert!(filled, "an artifact must only be fulfilled once");
        self.fulfilled = true;
        tracing::debug!(producer = ?self.producer, "fulfilled artifact");
        self.artifact.clone()
    }
}

impl<K, V> Drop for Reservation<'_, K, V>
where
    K: Hash + Eq + Clone,
{
    fn drop(&mut self) {
        if !self.is_new || self.fulfilled {
            return;
        }

        tracing::warn!(
            producer = ?self.producer,
            "reservation dropped without being fulfilled; abandoning it"
        );
        let abandoned = self
            .locked
            .with_table(|table| remove_if_same(table, &self.key, &self.artifact));
        drop(abandoned);
        // `self.locked` releases the lock once this returns.
    }
}

impl<K, V> fmt::Debug for Reservation<'_, K, V>
where
    K: Hash + Eq + Clone + fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("key", &self.key)
            .field("producer", &self.producer)
            .field("artifact", &self.artifact)
            .field("is_new", &self.is_new)
            .finish()
    }
}

// === impl Artifact ===

impl<V> Artifact<V> {
    fn placeholder() -> Self {
        Self {
            value: OnceLock::new(),
        }
    }

    /// Returns the artifact's value, or `None` if it is still a placeholder.
    #[must_use]
    pub fn get(&self) -> Option<&V> {
        self.value.get()
    }

    /// Returns `true` once the artifact's producer has fulfilled it.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.value.get().is_some()
    }
}

impl<V: fmt::Debug> fmt::Debug for Artifact<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value.get() {
            Some(value) => f.debug_tuple("Artifact").field(value).finish(),
            None => f.write_str("Artifact(<pending>)"),
        }
    }
}
