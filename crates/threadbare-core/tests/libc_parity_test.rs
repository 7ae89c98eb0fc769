#![cfg(target_os = "linux")]

//! The errno values, clock ids, and timespec layout this crate hard-codes
//! must agree with the platform's libc.

use threadbare_core::{Timespec, errno, time};

#[test]
fn errno_constants_match_libc() {
    assert_eq!(errno::EPERM, libc::EPERM);
    assert_eq!(errno::EINTR, libc::EINTR);
    assert_eq!(errno::EAGAIN, libc::EAGAIN);
    assert_eq!(errno::EBUSY, libc::EBUSY);
    assert_eq!(errno::EINVAL, libc::EINVAL);
    assert_eq!(errno::EDEADLK, libc::EDEADLK);
    assert_eq!(errno::ETIMEDOUT, libc::ETIMEDOUT);
    assert_eq!(errno::EOWNERDEAD, libc::EOWNERDEAD);
}

#[test]
fn clock_ids_match_libc() {
    assert_eq!(time::CLOCK_REALTIME, libc::CLOCK_REALTIME);
    assert_eq!(time::CLOCK_MONOTONIC, libc::CLOCK_MONOTONIC);
}

#[test]
fn timespec_layout_matches_libc() {
    assert_eq!(
        std::mem::size_of::<Timespec>(),
        std::mem::size_of::<libc::timespec>()
    );
    assert_eq!(
        std::mem::align_of::<Timespec>(),
        std::mem::align_of::<libc::timespec>()
    );
}

#[test]
fn clock_now_tracks_libc_clock_gettime() {
    let mine = time::clock_now(time::CLOCK_REALTIME).unwrap();
    let mut theirs = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut theirs) };
    assert_eq!(rc, 0);
    // Same clock read back to back: within a couple of seconds of each other.
    assert!((mine.tv_sec - theirs.tv_sec).abs() <= 2);
}
