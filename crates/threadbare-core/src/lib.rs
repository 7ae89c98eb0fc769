//! Futex-backed synchronisation core.
//!
//! A condition variable built on the Linux futex, together with the pieces
//! it leans on: a futex mutex with owner tracking, deferred cancellation,
//! a self-synchronised-destruction lock, and the raw syscall plumbing.
//! Results are errno-style `i32` codes (0 on success) throughout; the
//! constants live in [`errno`].
//!
//! Linux only (x86_64 and aarch64).

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod cancel;
#[allow(unsafe_code)]
pub mod cond;
pub mod errno;
pub mod mutex;
#[allow(unsafe_code)]
pub mod ssd;
#[allow(unsafe_code)]
pub mod sys;
pub mod time;

pub use cond::Cond;
pub use mutex::{
    MUTEX_DEFAULT, MUTEX_ERRORCHECK, MUTEX_KIND_MASK, MUTEX_NORMAL, MUTEX_RECURSIVE,
    MUTEX_SHARED_BIT, Mutex, valid_mutex_kind,
};
pub use time::{CLOCK_MONOTONIC, CLOCK_REALTIME, Timespec, clock_now};
