//! Self-synchronised-destruction-safe lock.
//!
//! A three-state spin/futex lock over a single 32-bit word: 0 free, 1 held
//! uncontended, 2 held contended. The release path is one atomic swap
//! followed by at most one wake; it never re-reads the word. That makes it
//! safe for the containing object to be freed by another thread the instant
//! the swap lands: the address only has to stay valid for the unlocker's
//! single wake, which is the unlocker's obligation, not the lock's.

use core::sync::atomic::{AtomicI32, Ordering};

use crate::sys::futex;

/// Acquire the lock word, parking on contention.
pub fn lock(l: &AtomicI32) {
    if l.compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    {
        return;
    }
    loop {
        // Force the contended state even if the holder released between the
        // CAS above and here; a free word makes this a no-op.
        let _ = l.compare_exchange(1, 2, Ordering::Relaxed, Ordering::Relaxed);
        futex::wait(l, 2, true);
        if l.compare_exchange(0, 2, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

/// Release the lock word, waking one parked thread if any registered.
///
/// The word's address is captured before the swap; after the swap only the
/// raw-address wake touches it. The caller must keep the word's storage
/// alive until this call returns.
pub fn unlock(l: &AtomicI32) {
    let addr = l.as_ptr() as usize;
    if l.swap(0, Ordering::Release) == 2 {
        // SAFETY: per this function's contract the storage outlives the
        // call; a wake that races a later reuse is merely spurious.
        unsafe { futex::wake_addr(addr, 1, true) };
    }
}
