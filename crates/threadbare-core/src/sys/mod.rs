//! Typed Linux syscall wrappers.
//!
//! Converts the raw trap return convention (negative errno in the result
//! register) into `Result<usize, i32>` and caches the calling thread's
//! kernel tid. Futex operations live in [`futex`].

pub mod futex;
mod raw;

use std::cell::Cell;

use crate::time::Timespec;

#[cfg(target_arch = "x86_64")]
const SYS_FUTEX: usize = 202;
#[cfg(target_arch = "x86_64")]
const SYS_GETTID: usize = 186;
#[cfg(target_arch = "x86_64")]
const SYS_CLOCK_GETTIME: usize = 228;

#[cfg(target_arch = "aarch64")]
const SYS_FUTEX: usize = 98;
#[cfg(target_arch = "aarch64")]
const SYS_GETTID: usize = 178;
#[cfg(target_arch = "aarch64")]
const SYS_CLOCK_GETTIME: usize = 113;

/// Decode a raw kernel return register into `Result<usize, i32>`.
#[inline]
fn decode(ret: usize) -> Result<usize, i32> {
    let signed = ret as isize;
    if (-4095..0).contains(&signed) {
        Err(-signed as i32)
    } else {
        Ok(ret)
    }
}

/// Issue the `futex` syscall.
///
/// Argument layout follows the kernel: `(uaddr, op, val, timeout_or_val2,
/// uaddr2, val3)`.
///
/// # Safety
///
/// `uaddr` (and `uaddr2`, if the op consumes it) must point to live, aligned
/// 32-bit words; `timeout_or_val2` must be a valid timespec pointer when the
/// op expects one.
pub unsafe fn sys_futex(
    uaddr: *const i32,
    op: i32,
    val: i32,
    timeout_or_val2: usize,
    uaddr2: usize,
    val3: u32,
) -> Result<usize, i32> {
    // SAFETY: caller guarantees pointer validity for the requested op.
    let ret = unsafe {
        raw::syscall6(
            SYS_FUTEX,
            uaddr as usize,
            op as usize,
            val as u32 as usize,
            timeout_or_val2,
            uaddr2,
            val3 as usize,
        )
    };
    decode(ret)
}

/// Read the given clock via `clock_gettime`.
pub fn sys_clock_gettime(clock_id: i32) -> Result<Timespec, i32> {
    let mut ts = Timespec::default();
    // SAFETY: `ts` is a live, properly sized output buffer for the call.
    let ret = unsafe {
        raw::syscall2(
            SYS_CLOCK_GETTIME,
            clock_id as usize,
            (&raw mut ts) as usize,
        )
    };
    decode(ret).map(|_| ts)
}

thread_local! {
    static TID: Cell<i32> = const { Cell::new(0) };
}

/// Kernel tid of the calling thread, fetched once and cached.
pub fn self_tid() -> i32 {
    TID.with(|slot| {
        let cached = slot.get();
        if cached != 0 {
            return cached;
        }
        // SAFETY: gettid takes no arguments and cannot fail.
        let tid = unsafe { raw::syscall0(SYS_GETTID) } as i32;
        slot.set(tid);
        tid
    })
}
