//! Condition variable core.
//!
//! Waiters park on a futex word and are handed back to the associated mutex
//! by signal/broadcast. In the private (single-process) case each waiter is
//! a stack-allocated node on a doubly linked list hanging off the condvar:
//! new nodes are pushed at `head`, signalling walks from `tail`, so wake
//! order is enqueue order. A signaller detaches a batch of nodes from the
//! tail, and from that point the batch is protected by the user mutex
//! instead of the condvar's internal lock; the per-node `barrier` word keeps
//! each signalled waiter from touching the batch until the signaller has
//! finished with it. In the process-shared case another process cannot see a
//! waiter's stack, so waiters share the condvar's `seq` word and a counter,
//! and no list exists.
//!
//! A node is only ever removed by its owning thread (timeout/cancel) or
//! consumed by a signaller, with the WAITING→SIGNALED / WAITING→LEAVING
//! state CAS deciding races. No thread touches a node after its owning thread returns
//! from the wait; the `notify` handshake and the barrier locks exist to
//! enforce exactly that.

use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicUsize, Ordering};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

use crate::cancel;
use crate::errno;
use crate::mutex::{MUTEX_NORMAL, Mutex};
use crate::ssd;
use crate::sys;
use crate::sys::futex;
use crate::time::{CLOCK_REALTIME, Timespec, valid_cond_clock, valid_timespec_nsec};

// ---------------------------------------------------------------------------
// Waiter state machine
// ---------------------------------------------------------------------------

/// Parked, on the condvar list, owned by the condvar lock.
const WAITING: i32 = 0;
/// Claimed by a signaller; on a detached batch, owned by the user mutex.
const SIGNALED: i32 = 1;
/// Removing itself on timeout or cancellation.
const LEAVING: i32 = 2;

/// `waiters` value seen by the last leaver once the destroyer has parked:
/// the destruction-pending bit plus one remaining waiter.
const LAST_WAITER_PENDING_DESTROY: i32 = i32::MIN + 1;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A condition variable bound to a clock, private or process-shared.
pub struct Cond {
    /// Internal list lock (private case). SSD discipline: see [`crate::ssd`].
    lock: AtomicI32,
    /// Futex word for the process-shared case; bumped per wake operation.
    seq: AtomicI32,
    /// Attached-waiter count for the process-shared case. The destroyer ORs
    /// in the sign bit and parks on this word until the low bits drain.
    waiters: AtomicI32,
    /// Mutex registered by the first process-shared waiter.
    assoc_mutex: AtomicUsize,
    head: AtomicPtr<Waiter>,
    tail: AtomicPtr<Waiter>,
    clock: i32,
    shared: bool,
}

/// Per-wait node, automatic storage of the waiting thread.
struct Waiter {
    prev: AtomicPtr<Waiter>,
    next: AtomicPtr<Waiter>,
    state: AtomicI32,
    /// Born locked; released by the signaller once the batch is consistent.
    barrier: AtomicI32,
    /// Set once a peer has moved this waiter's kernel wait onto the mutex.
    requeued: AtomicI32,
    /// Signaller's quiescence counter, installed when the signaller loses
    /// the state race to a leaver.
    notify: AtomicPtr<AtomicI32>,
    /// Result of the final mutex reacquisition; wins over the wait result.
    mutex_ret: AtomicI32,
    cond: *const Cond,
    mutex: *const Mutex,
    shared: bool,
}

impl Waiter {
    fn new(cond: &Cond, mutex: &Mutex, shared: bool) -> Waiter {
        Waiter {
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
            state: AtomicI32::new(WAITING),
            barrier: AtomicI32::new(if shared { 0 } else { 1 }),
            requeued: AtomicI32::new(0),
            notify: AtomicPtr::new(ptr::null_mut()),
            mutex_ret: AtomicI32::new(0),
            cond,
            mutex,
            shared,
        }
    }
}

/// Runs [`unwait`] exactly once when the wait frame exits, whether by normal
/// return or by a cancellation unwind.
struct UnwaitGuard<'a> {
    node: &'a Waiter,
}

impl Drop for UnwaitGuard<'_> {
    fn drop(&mut self) {
        unwait(self.node);
    }
}

// ---------------------------------------------------------------------------
// Condvar operations
// ---------------------------------------------------------------------------

impl Cond {
    /// New condvar measured against `clock_id` (unknown clocks fall back to
    /// CLOCK_REALTIME), private or process-shared.
    #[must_use]
    pub fn new(clock_id: i32, shared: bool) -> Cond {
        let clock = if valid_cond_clock(clock_id) {
            clock_id
        } else {
            CLOCK_REALTIME
        };
        Cond {
            lock: AtomicI32::new(0),
            seq: AtomicI32::new(0),
            waiters: AtomicI32::new(0),
            assoc_mutex: AtomicUsize::new(0),
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            clock,
            shared,
        }
    }

    /// The clock timed waits are measured against.
    #[inline]
    #[must_use]
    pub fn clock(&self) -> i32 {
        self.clock
    }

    /// Whether this condvar uses process-shared semantics.
    #[inline]
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Number of currently attached waiters.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        if self.shared {
            let w = self.waiters.load(Ordering::Acquire);
            (w & i32::MAX).max(0) as usize
        } else {
            let mut count = 0;
            ssd::lock(&self.lock);
            let mut p = self.head.load(Ordering::Relaxed);
            while !p.is_null() {
                count += 1;
                // SAFETY: nodes reachable from `head` are attached waiters;
                // attached nodes are kept alive by their parked owners and
                // only unlinked under the lock held here.
                p = unsafe { (*p).next.load(Ordering::Relaxed) };
            }
            ssd::unlock(&self.lock);
            count
        }
    }

    /// Block until signalled, with the caller holding `mutex`.
    ///
    /// Same contract as [`Cond::timed_wait`] without a deadline.
    pub fn wait(&self, mutex: &Mutex) -> i32 {
        self.timed_wait(mutex, None)
    }

    /// Block until signalled or `deadline` passes, with the caller holding
    /// `mutex`.
    ///
    /// On every return path — normal wake, timeout, or cancellation unwind —
    /// the caller holds `mutex` again. Returns 0 on wake, `ETIMEDOUT` on
    /// expiry, `EPERM` if an ownership-tracking mutex is not held by the
    /// caller, `EINVAL` for a malformed deadline (or, process-shared only, a
    /// second mutex while waiters are attached), or `EOWNERDEAD` propagated
    /// from the reacquisition. Spurious wakeups are possible; callers re-test
    /// their predicate.
    ///
    /// This is a cancellation point. A cancelling wait reacquires the mutex
    /// before the unwind leaves this frame; a cancellation that loses the
    /// race to a signaller is left pending and the wait returns 0.
    pub fn timed_wait(&self, mutex: &Mutex, deadline: Option<Timespec>) -> i32 {
        if mutex.kind_bits() != MUTEX_NORMAL && mutex.owner_tid() != sys::self_tid() {
            return errno::EPERM;
        }
        if let Some(ts) = deadline {
            if !valid_timespec_nsec(ts.tv_nsec) {
                return errno::EINVAL;
            }
        }
        // Pre-enqueue cancellation point: a pending request unwinds here,
        // before there is any node to clean up and with the mutex untouched.
        cancel::testcancel();

        let node = Waiter::new(self, mutex, self.shared);
        let fut: &AtomicI32;
        let seq: i32;
        if self.shared {
            let maddr = mutex as *const Mutex as usize;
            if let Err(registered) = self.assoc_mutex.compare_exchange(
                0,
                maddr,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                if registered != maddr {
                    return errno::EINVAL;
                }
            }
            fut = &self.seq;
            seq = self.seq.load(Ordering::Acquire);
            self.waiters.fetch_add(1, Ordering::AcqRel);
        } else {
            ssd::lock(&self.lock);
            let me = (&raw const node).cast_mut();
            let old_head = self.head.load(Ordering::Relaxed);
            node.next.store(old_head, Ordering::Relaxed);
            self.head.store(me, Ordering::Relaxed);
            if old_head.is_null() {
                self.tail.store(me, Ordering::Relaxed);
            } else {
                // SAFETY: `old_head` is an attached node, alive and only
                // mutated under the list lock held here.
                unsafe { (*old_head).prev.store(me, Ordering::Relaxed) };
            }
            ssd::unlock(&self.lock);
            fut = &node.state;
            seq = WAITING;
        }

        let _ = mutex.unlock();

        let guard = UnwaitGuard { node: &node };
        let waited = catch_unwind(AssertUnwindSafe(|| {
            let mut e;
            loop {
                e = cancel::cancellable_timedwait(fut, seq, self.clock, deadline, !node.shared);
                if fut.load(Ordering::Acquire) != seq {
                    break;
                }
                if e != 0 && e != errno::EINTR {
                    break;
                }
            }
            if e == errno::EINTR { 0 } else { e }
        }));
        drop(guard);
        let e = match waited {
            Ok(e) => e,
            Err(payload) => {
                // A cancellation unwind that lost the state race to a
                // signaller has consumed a wake; the wait completes normally
                // and the request stays pending for the next cancellation
                // point. Unwait already ran via the guard either way.
                if payload.downcast_ref::<cancel::Cancelled>().is_some()
                    && !node.shared
                    && node.state.load(Ordering::Acquire) == SIGNALED
                {
                    0
                } else {
                    resume_unwind(payload);
                }
            }
        };

        let mutex_ret = node.mutex_ret.load(Ordering::Acquire);
        if mutex_ret != 0 { mutex_ret } else { e }
    }

    /// Wake up to `n` waiters, oldest first. [`Cond::signal`] and
    /// [`Cond::broadcast`] are the two usual instances. Returns 0.
    pub fn wake(&self, n: i32) -> i32 {
        if self.shared {
            self.wake_shared(n)
        } else {
            self.wake_private(n)
        }
    }

    /// Wake at most one waiter.
    pub fn signal(&self) -> i32 {
        self.wake(1)
    }

    /// Wake all current waiters.
    pub fn broadcast(&self) -> i32 {
        self.wake(i32::MAX)
    }

    /// Tear down a process-shared condvar: park until every attached waiter
    /// has left. A private condvar has nothing to drain — its list pins the
    /// waiters' stacks, which outlive their wait calls by construction.
    pub fn destroy(&self) {
        if self.shared && self.waiters.load(Ordering::Acquire) != 0 {
            self.waiters.fetch_or(i32::MIN, Ordering::AcqRel);
            self.seq.fetch_add(1, Ordering::AcqRel);
            futex::wake(&self.seq, i32::MAX, false);
            loop {
                let cur = self.waiters.load(Ordering::Acquire);
                if cur & i32::MAX == 0 {
                    break;
                }
                futex::wait(&self.waiters, cur, false);
            }
        }
    }

    fn wake_shared(&self, n: i32) -> i32 {
        if self.waiters.load(Ordering::Acquire) == 0 {
            return 0;
        }
        self.seq.fetch_add(1, Ordering::AcqRel);
        // No requeue here: without per-waiter nodes the mutex waiter count
        // could not be restored afterwards, so the woken threads contend on
        // the mutex directly.
        futex::wake(&self.seq, n, false);
        0
    }

    fn wake_private(&self, n: i32) -> i32 {
        let refs = AtomicI32::new(0);
        let mut remaining = n;
        let mut batch: *mut Waiter = ptr::null_mut();

        ssd::lock(&self.lock);
        let mut p = self.tail.load(Ordering::Relaxed);
        while remaining != 0 && !p.is_null() {
            // SAFETY: `p` is reachable from the list, hence an attached (or
            // concurrently leaving) node whose storage is pinned until its
            // owner passes the notify handshake below.
            unsafe {
                if (*p)
                    .state
                    .compare_exchange(WAITING, SIGNALED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Lost the race to a leaver: it must decrement `refs`
                    // before it may pass its removal.
                    refs.fetch_add(1, Ordering::AcqRel);
                    (*p).notify
                        .store((&raw const refs).cast_mut(), Ordering::Release);
                } else {
                    remaining -= 1;
                    if batch.is_null() {
                        batch = p;
                    }
                }
                p = (*p).prev.load(Ordering::Relaxed);
            }
        }
        // Split: everything at or below the last examined node detaches;
        // `p` (first unexamined, younger) becomes the new tail.
        // SAFETY: boundary nodes are attached and mutated under the lock.
        unsafe {
            if !p.is_null() {
                let boundary = (*p).next.load(Ordering::Relaxed);
                if !boundary.is_null() {
                    (*boundary).prev.store(ptr::null_mut(), Ordering::Relaxed);
                }
                (*p).next.store(ptr::null_mut(), Ordering::Relaxed);
            } else {
                self.head.store(ptr::null_mut(), Ordering::Relaxed);
            }
            self.tail.store(p, Ordering::Relaxed);
        }
        ssd::unlock(&self.lock);

        // Quiescence: every waiter seen mid-leave must finish unlinking
        // itself before any barrier is released, or it could observe the
        // batch links while they are still ours.
        loop {
            let cur = refs.load(Ordering::Acquire);
            if cur == 0 {
                break;
            }
            futex::wait(&refs, cur, true);
        }

        // Hand the batch over, oldest outward. Only the terminal node gets a
        // kernel wake; the rest reach the mutex via the unwait requeue chain.
        let mut p = batch;
        while !p.is_null() {
            // SAFETY: `p` is a signalled node; its owner is blocked on its
            // state word or its barrier until the unlock below, so the node
            // is alive. `younger` is read before the barrier release because
            // the node may be gone afterwards.
            unsafe {
                let younger = (*p).prev.load(Ordering::Acquire);
                if (*p).next.load(Ordering::Acquire).is_null() {
                    futex::wake(&(*p).state, 1, true);
                }
                ssd::unlock(&(*p).barrier);
                p = younger;
            }
        }
        0
    }
}

// ---------------------------------------------------------------------------
// Unwait: cancellation hook and normal-return tail
// ---------------------------------------------------------------------------

/// Detach `node` and reacquire the user mutex. Runs exactly once per wait,
/// on every exit path, via [`UnwaitGuard`].
fn unwait(node: &Waiter) {
    // SAFETY: the back-references were formed from live borrows in
    // `timed_wait` and the condvar/mutex outlive the wait call.
    let mutex = unsafe { &*node.mutex };

    if node.shared {
        // SAFETY: as above.
        let cond = unsafe { &*node.cond };
        let waiters_addr = cond.waiters.as_ptr() as usize;
        let old = cond.waiters.fetch_sub(1, Ordering::AcqRel);
        if old == LAST_WAITER_PENDING_DESTROY {
            // SAFETY: the destroyer parked on this word is the only thread
            // that may free the condvar, and it cannot have done so before
            // this wake is issued against the captured address.
            unsafe { futex::wake_addr(waiters_addr, 1, false) };
        } else if old == 1 {
            cond.assoc_mutex.store(0, Ordering::Release);
        }
        node.mutex_ret.store(mutex.lock(), Ordering::Release);
        return;
    }

    let oldstate = match node.state.compare_exchange(
        WAITING,
        LEAVING,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(v) | Err(v) => v,
    };

    if oldstate == WAITING {
        // Still on the condvar list: no signaller has claimed this node, and
        // none can now return without seeing LEAVING and waiting on the
        // notify handshake, so the condvar is safe to touch.
        // SAFETY: as above.
        let cond = unsafe { &*node.cond };
        let me = (node as *const Waiter).cast_mut();
        ssd::lock(&cond.lock);
        let prev = node.prev.load(Ordering::Relaxed);
        let next = node.next.load(Ordering::Relaxed);
        // SAFETY: neighbours are list nodes mutated only under the lock.
        unsafe {
            if cond.head.load(Ordering::Relaxed) == me {
                cond.head.store(next, Ordering::Relaxed);
            } else if !prev.is_null() {
                (*prev).next.store(next, Ordering::Relaxed);
            }
            if cond.tail.load(Ordering::Relaxed) == me {
                cond.tail.store(prev, Ordering::Relaxed);
            } else if !next.is_null() {
                (*next).prev.store(prev, Ordering::Relaxed);
            }
        }
        ssd::unlock(&cond.lock);

        let notify = node.notify.load(Ordering::Acquire);
        if !notify.is_null() {
            // SAFETY: the pointer targets a signaller's counter, and the
            // signaller cannot leave its quiescence loop before this
            // decrement lands; only the wake may race its frame teardown,
            // which the raw-address wake tolerates.
            unsafe {
                if (*notify).fetch_sub(1, Ordering::AcqRel) == 1 {
                    futex::wake_addr(notify as usize, 1, true);
                }
            }
        }
    }

    node.mutex_ret.store(mutex.lock(), Ordering::Release);

    if oldstate == WAITING {
        return;
    }

    // Signalled path. The mutex is all that protects the detached batch; if
    // it cannot be taken, touching the batch would corrupt peer stacks, so
    // park this thread forever instead.
    let mutex_ret = node.mutex_ret.load(Ordering::Relaxed);
    if mutex_ret != 0 && mutex_ret != errno::EOWNERDEAD {
        let dead = AtomicI32::new(0);
        loop {
            ssd::lock(&dead);
        }
    }

    // Wait until the signaller has finished mutating the batch.
    ssd::lock(&node.barrier);

    // A kernel requeue parked this thread on the mutex word without going
    // through the mutex's own accounting; the extra count is undone here.
    if node.requeued.load(Ordering::Relaxed) != 0 {
        mutex.waiters().fetch_sub(1, Ordering::AcqRel);
    }

    let me = (node as *const Waiter).cast_mut();
    // SAFETY: the batch is protected by the mutex held since the lock call
    // above; every node on it belongs to a waiter still parked behind its
    // barrier or its state word.
    unsafe {
        // Hand one successor to the mutex: oldest not-yet-requeued first.
        let mut p = me;
        while !(*p).next.load(Ordering::Relaxed).is_null() {
            p = (*p).next.load(Ordering::Relaxed);
        }
        if p == me {
            p = (*me).prev.load(Ordering::Relaxed);
        }
        while !p.is_null() && (*p).requeued.load(Ordering::Relaxed) != 0 {
            p = (*p).prev.load(Ordering::Relaxed);
        }
        if p == me {
            p = (*me).prev.load(Ordering::Relaxed);
        }
        if !p.is_null() {
            (*p).requeued.store(1, Ordering::Relaxed);
            mutex.waiters().fetch_add(1, Ordering::AcqRel);
            // The kernel refuses to requeue from a private futex onto a
            // process-shared one, so a shared mutex gets a straight wake
            // alongside the attempt, and EINVAL falls back to the
            // non-private form.
            let wake_count = if mutex.is_shared() { 1 } else { 0 };
            if futex::requeue(&(*p).state, mutex.lock_word(), wake_count, 1, true)
                == Err(errno::EINVAL)
            {
                let _ = futex::requeue(&(*p).state, mutex.lock_word(), 0, 1, false);
            }
        }

        // Leave the batch.
        let prev = (*me).prev.load(Ordering::Relaxed);
        let next = (*me).next.load(Ordering::Relaxed);
        if !next.is_null() {
            (*next).prev.store(prev, Ordering::Relaxed);
        }
        if !prev.is_null() {
            (*prev).next.store(next, Ordering::Relaxed);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
