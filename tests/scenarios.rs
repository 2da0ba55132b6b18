//! Timing scenarios: same-key writers serialize, everything else runs in parallel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};

use crossbeam_utils::thread::scope;
use keylock::KeyedRwLock;

mod common;

const THREADS: u32 = 10;
const HOLD: Duration = Duration::from_millis(200);

fn write_for(locks: &KeyedRwLock<u32>, key: u32) {
    locks.lock_writing(&key).unwrap();
    sleep(HOLD);
    locks.unlock_writing(&key).unwrap();
}

fn read_for(locks: &KeyedRwLock<u32>, key: u32) {
    locks.lock_reading(&key).unwrap();
    sleep(HOLD);
    locks.unlock_reading(&key).unwrap();
}

fn timed<F: FnOnce()>(f: F) -> Duration {
    let start = Instant::now();
    f();
    start.elapsed()
}

fn writers_on_one_key(locks: &KeyedRwLock<u32>) {
    let elapsed = timed(|| {
        scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|_| write_for(locks, 1234));
            }
        })
        .unwrap();
    });

    assert!(elapsed >= HOLD * THREADS, "elapsed {:?}", elapsed);
    assert!(locks.is_empty());
}

#[test]
fn writers_on_one_key_serialize() {
    common::setup_tracing();
    writers_on_one_key(&KeyedRwLock::new());
}

#[test]
fn fair_writers_on_one_key_serialize() {
    writers_on_one_key(&KeyedRwLock::fair());
}

#[test]
fn writers_on_distinct_keys_run_in_parallel() {
    let locks: KeyedRwLock<u32> = KeyedRwLock::new();
    let elapsed = timed(|| {
        scope(|scope| {
            for i in 0..THREADS {
                let locks = &locks;
                scope.spawn(move |_| write_for(locks, i));
            }
        })
        .unwrap();
    });

    assert!(elapsed >= HOLD, "elapsed {:?}", elapsed);
    assert!(elapsed < HOLD * 2, "elapsed {:?}", elapsed);
    assert!(locks.is_empty());
}

#[test]
fn readers_on_one_key_run_in_parallel() {
    let locks: KeyedRwLock<u32> = KeyedRwLock::new();
    let elapsed = timed(|| {
        scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|_| read_for(&locks, 1234));
            }
        })
        .unwrap();
    });

    assert!(elapsed >= HOLD, "elapsed {:?}", elapsed);
    assert!(elapsed < HOLD * 2, "elapsed {:?}", elapsed);
    assert!(locks.is_empty());
}

#[test]
fn holding_one_key_while_locking_another() {
    let locks: KeyedRwLock<u32> = KeyedRwLock::new();

    locks.lock_writing(&1).unwrap();
    locks.lock_writing(&2).unwrap();
    locks.unlock_writing(&1).unwrap();
    locks.unlock_writing(&2).unwrap();
    assert!(locks.is_empty());

    // A thread blocked on a contended key must not stall a holder locking a different key.
    let blocked = AtomicBool::new(true);
    locks.lock_writing(&1).unwrap();
    scope(|scope| {
        scope.spawn(|_| {
            locks.lock_writing(&1).unwrap();
            blocked.store(false, Ordering::SeqCst);
            locks.unlock_writing(&1).unwrap();
        });

        sleep(Duration::from_millis(50));
        locks.lock_reading(&2).unwrap();
        assert!(blocked.load(Ordering::SeqCst));
        locks.unlock_reading(&2).unwrap();
        locks.unlock_writing(&1).unwrap();
    })
    .unwrap();

    assert!(!blocked.load(Ordering::SeqCst));
    assert!(locks.is_empty());
}

#[test]
fn writer_excludes_readers() {
    let locks: KeyedRwLock<u32> = KeyedRwLock::new();
    let elapsed = timed(|| {
        scope(|scope| {
            scope.spawn(|_| write_for(&locks, 1));
            sleep(HOLD / 4);
            for _ in 0..THREADS {
                scope.spawn(|_| read_for(&locks, 1));
            }
        })
        .unwrap();
    });

    // The readers overlap with each other, but not with the writer.
    assert!(elapsed >= HOLD * 2, "elapsed {:?}", elapsed);
    assert!(elapsed < HOLD * 4, "elapsed {:?}", elapsed);
    assert!(locks.is_empty());
}
