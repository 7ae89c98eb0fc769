//! Futex wait/wake/requeue operations.
//!
//! Thin wrappers over the `futex` syscall taking `&AtomicI32` words, so the
//! address validity obligation is discharged by the borrow. Timed waits use
//! `FUTEX_WAIT_BITSET`, which accepts an absolute deadline natively and
//! selects the clock via `FUTEX_CLOCK_REALTIME`.

use core::sync::atomic::AtomicI32;

use super::sys_futex;
use crate::errno;
use crate::time::{CLOCK_REALTIME, Timespec};

const FUTEX_WAIT: i32 = 0;
const FUTEX_WAKE: i32 = 1;
const FUTEX_REQUEUE: i32 = 3;
const FUTEX_WAIT_BITSET: i32 = 9;
const FUTEX_PRIVATE_FLAG: i32 = 0x80;
const FUTEX_CLOCK_REALTIME: i32 = 256;
const FUTEX_BITSET_MATCH_ANY: u32 = 0xFFFF_FFFF;

#[inline]
fn private_flag(private: bool) -> i32 {
    if private { FUTEX_PRIVATE_FLAG } else { 0 }
}

#[inline]
fn word_ptr(word: &AtomicI32) -> *const i32 {
    word.as_ptr().cast_const()
}

/// Block on `word` while it holds `expected`, with no timeout.
///
/// Returns without distinguishing wake, value mismatch, or interruption;
/// callers re-test their predicate and loop.
pub fn wait(word: &AtomicI32, expected: i32, private: bool) {
    // SAFETY: `word` is a live aligned i32 for the duration of the call.
    let _ = unsafe {
        sys_futex(
            word_ptr(word),
            FUTEX_WAIT | private_flag(private),
            expected,
            0,
            0,
            0,
        )
    };
}

/// Block on `word` while it holds `expected`, until `deadline` on `clock`.
///
/// Returns 0 on wake or value mismatch, `EINTR` on signal delivery,
/// `ETIMEDOUT` once the absolute deadline has passed. All other kernel
/// results are folded into 0: the caller's retry loop re-reads the word and
/// decides.
pub fn timedwait(
    word: &AtomicI32,
    expected: i32,
    clock: i32,
    deadline: Option<Timespec>,
    private: bool,
) -> i32 {
    let result = match deadline {
        Some(ts) => {
            let mut op = FUTEX_WAIT_BITSET | private_flag(private);
            if clock == CLOCK_REALTIME {
                op |= FUTEX_CLOCK_REALTIME;
            }
            // SAFETY: `word` and `ts` are live for the duration of the call.
            unsafe {
                sys_futex(
                    word_ptr(word),
                    op,
                    expected,
                    (&raw const ts) as usize,
                    0,
                    FUTEX_BITSET_MATCH_ANY,
                )
            }
        }
        // SAFETY: `word` is live; a null timeout means wait indefinitely.
        None => unsafe {
            sys_futex(
                word_ptr(word),
                FUTEX_WAIT | private_flag(private),
                expected,
                0,
                0,
                0,
            )
        },
    };
    match result {
        Err(e) if e == errno::EINTR || e == errno::ETIMEDOUT => e,
        _ => 0,
    }
}

/// Wake up to `count` waiters blocked on `word`. Returns the number woken.
pub fn wake(word: &AtomicI32, count: i32, private: bool) -> usize {
    // SAFETY: `word` is a live aligned i32 for the duration of the call.
    unsafe {
        sys_futex(
            word_ptr(word),
            FUTEX_WAKE | private_flag(private),
            count,
            0,
            0,
            0,
        )
    }
    .unwrap_or(0)
}

/// Wake up to `count` waiters blocked on the word at `addr`.
///
/// # Safety
///
/// `addr` must be the address of an aligned 32-bit word that was valid when
/// captured. The kernel treats a stale address as an empty wait queue, so a
/// racing deallocation degrades to a missed or spurious wake, never a fault
/// in this process; the caller must be in a protocol where that is
/// acceptable.
pub unsafe fn wake_addr(addr: usize, count: i32, private: bool) {
    // SAFETY: per this function's contract.
    let _ = unsafe {
        sys_futex(
            addr as *const i32,
            FUTEX_WAKE | private_flag(private),
            count,
            0,
            0,
            0,
        )
    };
}

/// Wake `wake_count` waiters on `from` and move up to `requeue_count` of the
/// remainder onto `to` without waking them.
///
/// The kernel refuses some private/shared combinations with `EINVAL`; the
/// caller decides the fallback.
pub fn requeue(
    from: &AtomicI32,
    to: &AtomicI32,
    wake_count: i32,
    requeue_count: i32,
    private: bool,
) -> Result<usize, i32> {
    // SAFETY: both words are live aligned i32s for the duration of the call.
    unsafe {
        sys_futex(
            word_ptr(from),
            FUTEX_REQUEUE | private_flag(private),
            wake_count,
            requeue_count as usize,
            word_ptr(to) as usize,
            0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::CLOCK_MONOTONIC;
    use core::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_returns_on_value_mismatch() {
        let word = AtomicI32::new(5);
        // Expected value differs; the kernel returns EAGAIN immediately.
        wait(&word, 4, true);
    }

    #[test]
    fn wake_with_no_waiters_wakes_nobody() {
        let word = AtomicI32::new(0);
        assert_eq!(wake(&word, 1, true), 0);
        assert_eq!(wake(&word, i32::MAX, true), 0);
    }

    #[test]
    fn timedwait_past_deadline_times_out() {
        let word = AtomicI32::new(0);
        let e = timedwait(
            &word,
            0,
            CLOCK_MONOTONIC,
            Some(Timespec { tv_sec: 0, tv_nsec: 0 }),
            true,
        );
        assert_eq!(e, errno::ETIMEDOUT);
    }

    #[test]
    fn timedwait_mismatch_is_folded_to_zero() {
        let word = AtomicI32::new(9);
        let e = timedwait(
            &word,
            3,
            CLOCK_MONOTONIC,
            Some(Timespec { tv_sec: 0, tv_nsec: 0 }),
            true,
        );
        assert_eq!(e, 0);
    }

    #[test]
    fn wake_releases_a_blocked_waiter() {
        let word = Arc::new(AtomicI32::new(0));
        let w = word.clone();
        let waiter = std::thread::spawn(move || {
            while w.load(Ordering::Acquire) == 0 {
                wait(&w, 0, true);
            }
        });
        std::thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        wake(&word, 1, true);
        waiter.join().unwrap();
    }

    #[test]
    fn requeue_moves_a_waiter_between_words() {
        let from = Arc::new(AtomicI32::new(0));
        let to = Arc::new(AtomicI32::new(0));
        let f = from.clone();
        let t = to.clone();
        let waiter = std::thread::spawn(move || {
            while f.load(Ordering::Acquire) == 0 {
                wait(&f, 0, true);
            }
            // Parked on `from`, requeued to `to`, released by the wake below.
        });
        std::thread::sleep(Duration::from_millis(50));
        // Move without waking: nothing observable yet from the waiter.
        let moved = requeue(&from, &to, 0, 1, true);
        assert!(moved.is_ok());
        from.store(1, Ordering::Release);
        // The waiter is parked on at most one of the two words.
        let woken = wake(&from, 1, true) + wake(&to, 1, true);
        assert!(woken <= 1);
        waiter.join().unwrap();
    }
}
