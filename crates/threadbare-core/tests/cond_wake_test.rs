#![cfg(target_os = "linux")]

//! Signal and partial-wake behaviour: at most n waiters leave per wake, and
//! they leave oldest first.

use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use threadbare_core::cond::Cond;
use threadbare_core::mutex::{MUTEX_NORMAL, Mutex};
use threadbare_core::time::{CLOCK_MONOTONIC, clock_now};

#[test]
fn single_signal_releases_single_waiter() {
    let c = Arc::new(Cond::new(CLOCK_MONOTONIC, false));
    let m = Arc::new(Mutex::new(MUTEX_NORMAL));
    let pre_mutex_waiters = m.waiters().load(std::sync::atomic::Ordering::Relaxed);

    let c2 = c.clone();
    let m2 = m.clone();
    let waiter = std::thread::spawn(move || {
        let deadline = clock_now(CLOCK_MONOTONIC).unwrap().add_millis(1_000);
        assert_eq!(m2.lock(), 0);
        let e = c2.timed_wait(&m2, Some(deadline));
        assert_eq!(m2.unlock(), 0);
        e
    });

    while c.waiter_count() == 0 {
        std::hint::spin_loop();
    }
    assert_eq!(c.signal(), 0);
    assert_eq!(waiter.join().unwrap(), 0);
    assert_eq!(c.waiter_count(), 0);
    assert_eq!(
        m.waiters().load(std::sync::atomic::Ordering::Relaxed),
        pre_mutex_waiters
    );
}

/// Spawn a waiter that reports its id once it has been woken and has
/// reacquired (and released) the mutex.
fn spawn_waiter(
    c: &Arc<Cond>,
    m: &Arc<Mutex>,
    id: usize,
    done: mpsc::Sender<usize>,
) -> std::thread::JoinHandle<()> {
    let c = c.clone();
    let m = m.clone();
    std::thread::spawn(move || {
        assert_eq!(m.lock(), 0);
        assert_eq!(c.wait(&m), 0);
        assert_eq!(m.unlock(), 0);
        done.send(id).unwrap();
    })
}

#[test]
fn wake_two_of_three_leaves_the_youngest() {
    let c = Arc::new(Cond::new(CLOCK_MONOTONIC, false));
    let m = Arc::new(Mutex::new(MUTEX_NORMAL));
    let (tx, rx) = mpsc::channel();

    let mut handles = Vec::new();
    for id in 1..=3 {
        handles.push(spawn_waiter(&c, &m, id, tx.clone()));
        // Pin the enqueue order: wait until this waiter is on the list
        // before starting the next.
        while c.waiter_count() < id {
            std::hint::spin_loop();
        }
    }

    assert_eq!(c.wake(2), 0);
    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // Oldest first.
    assert_eq!((first, second), (1, 2));

    // The youngest waiter is still attached and still blocked.
    assert_eq!(c.waiter_count(), 1);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    assert_eq!(c.broadcast(), 0);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(c.waiter_count(), 0);
}

#[test]
fn wake_counts_cap_at_list_length() {
    let c = Arc::new(Cond::new(CLOCK_MONOTONIC, false));
    let m = Arc::new(Mutex::new(MUTEX_NORMAL));
    let (tx, rx) = mpsc::channel();

    let mut handles = Vec::new();
    for id in 1..=2 {
        handles.push(spawn_waiter(&c, &m, id, tx.clone()));
        while c.waiter_count() < id {
            std::hint::spin_loop();
        }
    }

    // Asking for more wakes than waiters releases exactly the waiters.
    assert_eq!(c.wake(10), 0);
    let mut woken: Vec<usize> = Vec::new();
    woken.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    woken.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    woken.sort_unstable();
    assert_eq!(woken, vec![1, 2]);
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(c.waiter_count(), 0);
}
