//! Futex-backed mutex.
//!
//! The collaborator the condition variable hands waiters back to. The lock
//! word follows the 0/1/2 scheme (free, held, held-contended) so the word
//! doubles as the futex the condvar requeues signalled waiters onto. A
//! separate `waiters` counter records threads parked on the word — including
//! requeued condvar waiters, which never pass through [`Mutex::lock`] while
//! parking — and unlock wakes whenever either signal says someone is there.

use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::errno;
use crate::sys;
use crate::sys::futex;

// ---------------------------------------------------------------------------
// Mutex kind constants
// ---------------------------------------------------------------------------

/// Normal (default) mutex — no error checking, no recursive locking.
pub const MUTEX_NORMAL: i32 = 0;
/// Recursive mutex — the owning thread can re-lock without deadlock.
pub const MUTEX_RECURSIVE: i32 = 1;
/// Error-checking mutex — returns EDEADLK on recursive lock.
pub const MUTEX_ERRORCHECK: i32 = 2;
/// Default mutex kind (alias for NORMAL).
pub const MUTEX_DEFAULT: i32 = MUTEX_NORMAL;

/// Or'd into the kind word to mark a process-shared mutex.
pub const MUTEX_SHARED_BIT: i32 = 128;

/// Mask selecting the kind from the kind word.
pub const MUTEX_KIND_MASK: i32 = 15;

const UNLOCKED: i32 = 0;
const LOCKED: i32 = 1;
const CONTENDED: i32 = 2;

/// Returns true if `kind` names a supported mutex kind (shared bit allowed).
#[must_use]
pub const fn valid_mutex_kind(kind: i32) -> bool {
    matches!(
        kind & !MUTEX_SHARED_BIT,
        MUTEX_NORMAL | MUTEX_RECURSIVE | MUTEX_ERRORCHECK
    )
}

// ---------------------------------------------------------------------------
// Mutex
// ---------------------------------------------------------------------------

/// A futex-backed mutex with owner tracking for the checking kinds.
pub struct Mutex {
    lock: AtomicI32,
    waiters: AtomicI32,
    owner: AtomicI32,
    recursion: AtomicU32,
    kind: i32,
}

impl Mutex {
    /// New unlocked mutex of the given kind; `kind` may carry
    /// [`MUTEX_SHARED_BIT`].
    #[must_use]
    pub const fn new(kind: i32) -> Mutex {
        Mutex {
            lock: AtomicI32::new(UNLOCKED),
            waiters: AtomicI32::new(0),
            owner: AtomicI32::new(0),
            recursion: AtomicU32::new(0),
            kind,
        }
    }

    /// The kind word, shared bit included.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> i32 {
        self.kind
    }

    /// The kind with the shared bit masked off.
    #[inline]
    #[must_use]
    pub fn kind_bits(&self) -> i32 {
        self.kind & MUTEX_KIND_MASK
    }

    /// Whether this mutex is process-shared.
    #[inline]
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.kind & MUTEX_SHARED_BIT != 0
    }

    /// Tid of the current holder (0 when tracking is off or unheld).
    #[inline]
    #[must_use]
    pub fn owner_tid(&self) -> i32 {
        self.owner.load(Ordering::Acquire)
    }

    /// The futex word. Condvar unwait requeues signalled waiters onto it.
    #[inline]
    pub fn lock_word(&self) -> &AtomicI32 {
        &self.lock
    }

    /// The parked-thread counter. Condvar unwait adjusts it when it parks a
    /// waiter on the lock word behind this mutex's back.
    #[inline]
    pub fn waiters(&self) -> &AtomicI32 {
        &self.waiters
    }

    fn track_owner(&self) -> bool {
        self.kind_bits() != MUTEX_NORMAL
    }

    /// Acquire, parking on contention. Returns 0, EDEADLK, or EAGAIN.
    pub fn lock(&self) -> i32 {
        let tid = sys::self_tid();
        if self.track_owner() && self.owner.load(Ordering::Acquire) == tid {
            if self.kind_bits() == MUTEX_ERRORCHECK {
                return errno::EDEADLK;
            }
            // Recursive relock: bump the depth, saturating with EAGAIN.
            let depth = self.recursion.load(Ordering::Relaxed);
            if depth == u32::MAX {
                return errno::EAGAIN;
            }
            self.recursion.store(depth + 1, Ordering::Relaxed);
            return 0;
        }

        if self
            .lock
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.waiters.fetch_add(1, Ordering::Relaxed);
            // Acquire as contended so the next unlock issues a wake.
            while self.lock.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
                futex::wait(&self.lock, CONTENDED, !self.is_shared());
            }
            self.waiters.fetch_sub(1, Ordering::Relaxed);
        }

        if self.track_owner() {
            self.owner.store(tid, Ordering::Release);
        }
        0
    }

    /// Acquire without blocking. Returns 0, EBUSY, EDEADLK, or EAGAIN.
    pub fn try_lock(&self) -> i32 {
        let tid = sys::self_tid();
        if self.track_owner() && self.owner.load(Ordering::Acquire) == tid {
            if self.kind_bits() == MUTEX_ERRORCHECK {
                return errno::EDEADLK;
            }
            let depth = self.recursion.load(Ordering::Relaxed);
            if depth == u32::MAX {
                return errno::EAGAIN;
            }
            self.recursion.store(depth + 1, Ordering::Relaxed);
            return 0;
        }
        if self
            .lock
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return errno::EBUSY;
        }
        if self.track_owner() {
            self.owner.store(tid, Ordering::Release);
        }
        0
    }

    /// Release. Returns 0, or EPERM for a checked unlock by a non-owner.
    pub fn unlock(&self) -> i32 {
        if self.track_owner() {
            if self.owner.load(Ordering::Acquire) != sys::self_tid() {
                return errno::EPERM;
            }
            let depth = self.recursion.load(Ordering::Relaxed);
            if depth > 0 {
                self.recursion.store(depth - 1, Ordering::Relaxed);
                return 0;
            }
            self.owner.store(0, Ordering::Release);
        }
        let prior = self.lock.swap(UNLOCKED, Ordering::Release);
        // Requeued condvar waiters park on the word without marking it
        // contended; the counter is the only trace of them.
        if prior == CONTENDED || self.waiters.load(Ordering::Relaxed) > 0 {
            futex::wake(&self.lock, 1, !self.is_shared());
        }
        0
    }
}
