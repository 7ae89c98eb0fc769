//! Deferred thread cancellation.
//!
//! Cancellation is cooperative: another thread requests it through a
//! [`CancelHandle`], and the target acts on it only at cancellation points —
//! [`testcancel`] and the cancellable futex wait. Acting on it means
//! unwinding the thread with a [`Cancelled`] payload, so drop guards along
//! the unwind path (the condvar's unwait guard in particular) restore their
//! invariants before control escapes.
//!
//! A pending request must be able to interrupt a thread already asleep in
//! the kernel. The waiting side publishes the futex word it is about to
//! sleep on; the cancelling side sets the pending flag, then wakes the
//! published word until the registration is withdrawn. SeqCst on the
//! flag/word accesses guarantees at least one side observes the other.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::panic::panic_any;
use std::sync::Arc;

use crate::sys::futex;
use crate::time::Timespec;

/// Unwind payload carried by a cancelled thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

#[derive(Default)]
struct CancelState {
    pending: AtomicBool,
    wait_word: AtomicUsize,
    wait_private: AtomicBool,
}

thread_local! {
    static CURRENT: Arc<CancelState> = Arc::new(CancelState::default());
}

/// A handle through which another thread can cancel this one.
#[derive(Clone)]
pub struct CancelHandle(Arc<CancelState>);

/// Handle to the calling thread's cancellation state.
#[must_use]
pub fn handle() -> CancelHandle {
    CancelHandle(CURRENT.with(Arc::clone))
}

impl CancelHandle {
    /// Request cancellation, interrupting a cancellable wait in progress.
    ///
    /// A single wake would not be enough: it can reach the kernel in the
    /// window after the target has published its wait word but before it
    /// has parked, where it finds no waiter and is lost. So the wake is
    /// repeated until the target withdraws the registration, which it does
    /// on every path out of the futex call; a woken target re-tests
    /// `pending` before parking again, so the loop always terminates.
    pub fn cancel(&self) {
        self.0.pending.store(true, Ordering::SeqCst);
        loop {
            let addr = self.0.wait_word.load(Ordering::SeqCst);
            if addr == 0 {
                break;
            }
            let private = self.0.wait_private.load(Ordering::SeqCst);
            // SAFETY: `addr` was published by a thread inside
            // `cancellable_timedwait`, which keeps the word alive until it
            // clears the registration; a stale wake is at worst spurious.
            unsafe { futex::wake_addr(addr, i32::MAX, private) };
            std::thread::yield_now();
        }
    }

    /// Whether a cancellation request is pending (test aid).
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.0.pending.load(Ordering::SeqCst)
    }
}

/// Cancellation point: unwind the calling thread if cancellation is pending.
pub fn testcancel() {
    let pending = CURRENT.with(|st| st.pending.load(Ordering::SeqCst));
    if pending {
        panic_any(Cancelled);
    }
}

/// Futex timed wait that doubles as a cancellation point.
///
/// A pending cancellation is acted on only while `word` still holds
/// `expected`: once a signaller has moved the word on, the wake has been
/// consumed and must not be lost, so the wait returns normally and the
/// request stays pending for a later cancellation point.
pub fn cancellable_timedwait(
    word: &AtomicI32,
    expected: i32,
    clock: i32,
    deadline: Option<Timespec>,
    private: bool,
) -> i32 {
    CURRENT.with(|st| {
        st.wait_private.store(private, Ordering::SeqCst);
        st.wait_word.store(word.as_ptr() as usize, Ordering::SeqCst);
        if st.pending.load(Ordering::SeqCst) && word.load(Ordering::SeqCst) == expected {
            st.wait_word.store(0, Ordering::SeqCst);
            panic_any(Cancelled);
        }
        let e = futex::timedwait(word, expected, clock, deadline, private);
        st.wait_word.store(0, Ordering::SeqCst);
        e
    })
}
