//! Barrier coordinator behaviour under real threads

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use npuforge::sync::{BarrierCoordinator, BarrierKey, BarrierState};
use npuforge::NpuForgeError;
use proptest::prelude::*;

#[test]
fn test_nobody_released_before_last_arrival() {
    let coordinator = Arc::new(BarrierCoordinator::new(4));
    let released = Arc::new(AtomicUsize::new(0));
    let key = BarrierKey::grid(7);

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                coordinator.wait(key, 4).unwrap();
                released.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    while coordinator.state(key) != (BarrierState::Waiting { arrived: 3, expected: 4 }) {
        thread::sleep(Duration::from_millis(1));
    }
    thread::sleep(Duration::from_millis(20));
    assert_eq!(released.load(Ordering::SeqCst), 0);

    coordinator.wait(key, 4).unwrap();
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(released.load(Ordering::SeqCst), 3);
    assert_eq!(coordinator.state(key), BarrierState::Idle);
    assert_eq!(coordinator.releases(), 1);
}

#[test]
fn test_reused_tag_needs_fresh_arrivals() {
    let coordinator = Arc::new(BarrierCoordinator::new(3));
    let key = BarrierKey::grid(1);
    let rounds = 50;
    let counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                for round in 0..rounds {
                    counter.fetch_add(1, Ordering::SeqCst);
                    coordinator.wait(key, 3).unwrap();
                    // everyone of this round arrived before anyone left
                    assert!(counter.load(Ordering::SeqCst) >= 3 * (round + 1));
                    coordinator.wait(BarrierKey::grid(2), 3).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(coordinator.releases(), 2 * rounds as u64);
}

#[test]
fn test_core_scoped_keys_are_independent() {
    let coordinator = Arc::new(BarrierCoordinator::new(4));
    let handles: Vec<_> = (0..4)
        .map(|unit| {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || coordinator.wait(BarrierKey::core(9, unit / 2), 2))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(coordinator.releases(), 2);
}

#[test]
fn test_leader_value_is_broadcast() {
    let coordinator = Arc::new(BarrierCoordinator::new(3));
    let calls = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let coordinator = Arc::clone(&coordinator);
            let calls = Arc::clone(&calls);
            thread::spawn(move || {
                coordinator.wait_with(BarrierKey::grid(5), 3, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    42
                })
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_poison_wakes_waiters() {
    let coordinator = Arc::new(BarrierCoordinator::new(2));
    let waiter = {
        let coordinator = Arc::clone(&coordinator);
        thread::spawn(move || coordinator.wait(BarrierKey::grid(3), 2))
    };
    while coordinator.state(BarrierKey::grid(3)) == BarrierState::Idle {
        thread::sleep(Duration::from_millis(1));
    }
    coordinator.poison("unit c0t1 failed");

    let err = waiter.join().unwrap().unwrap_err();
    assert!(matches!(err, NpuForgeError::BarrierPoisoned(reason) if reason.contains("c0t1")));
    assert!(coordinator.is_poisoned());
    assert!(coordinator.wait(BarrierKey::grid(4), 1).is_err());
}

#[test]
fn test_mismatched_expectations_poison() {
    let coordinator = Arc::new(BarrierCoordinator::new(3));
    let first = {
        let coordinator = Arc::clone(&coordinator);
        thread::spawn(move || coordinator.wait(BarrierKey::grid(8), 3))
    };
    while coordinator.state(BarrierKey::grid(8)) == BarrierState::Idle {
        thread::sleep(Duration::from_millis(1));
    }

    let err = coordinator.wait(BarrierKey::grid(8), 2).unwrap_err();
    assert!(matches!(
        err,
        NpuForgeError::BarrierMismatch { tag: 8, expected: 3, actual: 2 }
    ));
    assert!(matches!(
        first.join().unwrap(),
        Err(NpuForgeError::BarrierPoisoned(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_every_round_releases_once(units in 1..8usize, rounds in 1..20usize) {
        let coordinator = Arc::new(BarrierCoordinator::new(units));
        let handles: Vec<_> = (0..units)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                thread::spawn(move || {
                    for _ in 0..rounds {
                        coordinator.wait(BarrierKey::grid(0), units)?;
                    }
                    Ok::<_, NpuForgeError>(())
                })
            })
            .collect();
        for handle in handles {
            prop_assert!(handle.join().unwrap().is_ok());
        }
        prop_assert_eq!(coordinator.releases(), rounds as u64);
    }

    #[test]
    fn test_oversubscription_rejected(live in 1..64usize, extra in 1..8usize) {
        let coordinator = BarrierCoordinator::new(live);
        let err = coordinator.wait(BarrierKey::grid(1), live + extra).unwrap_err();
        let is_oversubscribed = matches!(err, NpuForgeError::BarrierOversubscribed { .. });
        prop_assert!(is_oversubscribed);
    }
}
