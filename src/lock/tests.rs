//! Console lock protocol tests.
//!
//! Several locks share one fabric and are stepped from a single thread in a
//! fixed interleaving, so every scenario is deterministic.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::fabric::{Fabric, FabricConfig};

use super::console::{ConsoleLock, LockError, ReplyPolicy};

fn group(size: u32, policy: ReplyPolicy) -> Vec<ConsoleLock> {
    Fabric::build(size, &FabricConfig::default())
        .into_iter()
        .map(|endpoint| {
            let mut lock = ConsoleLock::new(endpoint, policy);
            lock.init();
            lock
        })
        .collect()
}

/// Step the locks in `order` until no round is left, exiting as soon as a
/// lock is granted. Returns ranks in grant order.
fn drain(locks: &mut [ConsoleLock], order: &[usize]) -> Vec<usize> {
    let mut grants = Vec::new();
    for _ in 0..1_000 {
        if locks.iter().all(|l| !l.wants_output()) {
            return grants;
        }
        for &i in order {
            locks[i].test().unwrap();
            if locks[i].lock().unwrap() {
                grants.push(i);
                locks[i].exit().unwrap();
            }
        }
    }
    panic!("rounds never drained; grants so far: {:?}", grants);
}

/// Like `drain`, but polls every lock before releasing anything and fails if
/// two are granted at once.
fn drain_exclusive(locks: &mut [ConsoleLock]) -> Vec<usize> {
    let mut grants = Vec::new();
    for _ in 0..1_000 {
        if locks.iter().all(|l| !l.wants_output()) {
            return grants;
        }
        for lock in locks.iter_mut() {
            lock.test().unwrap();
        }
        let granted: Vec<usize> = (0..locks.len())
            .filter(|&i| locks[i].lock().unwrap())
            .collect();
        assert!(granted.len() <= 1, "overlapping grants: {:?}", granted);
        for i in granted {
            grants.push(i);
            locks[i].exit().unwrap();
        }
    }
    panic!("rounds never drained; grants so far: {:?}", grants);
}

#[test]
fn test_single_worker_is_granted_immediately() {
    let mut locks = group(1, ReplyPolicy::RequestOrder);

    assert!(!locks[0].lock().unwrap());
    locks[0].request().unwrap();
    assert!(locks[0].lock().unwrap());
    locks[0].exit().unwrap();
    assert!(!locks[0].wants_output());
}

/// Three workers, one job each, stamps serialized by causality.
/// The lowest stamp prints first even when the highest is polled first.
#[test]
fn test_causally_ordered_requests_print_in_stamp_order() {
    let mut locks = group(3, ReplyPolicy::RequestOrder);

    let s0 = locks[0].request().unwrap();
    locks[1].test().unwrap();
    let s1 = locks[1].request().unwrap();
    locks[2].test().unwrap();
    let s2 = locks[2].request().unwrap();
    assert!(s0 < s1 && s1 < s2, "stamps {} {} {}", s0, s1, s2);

    let grants = drain(&mut locks, &[2, 1, 0]);
    assert_eq!(grants, vec![0, 1, 2]);
}

/// Equal stamps. Only exclusivity is asserted, not who wins.
#[test]
fn test_tied_stamps_never_overlap() {
    let mut locks = group(2, ReplyPolicy::RequestOrder);

    let s0 = locks[0].request().unwrap();
    let s1 = locks[1].request().unwrap();
    assert_eq!(s0, s1);

    let mut grants = drain_exclusive(&mut locks);
    grants.sort_unstable();
    assert_eq!(grants, vec![0, 1]);
}

#[test]
fn test_three_way_tie_never_overlaps() {
    let mut locks = group(3, ReplyPolicy::RequestOrder);
    let stamps: Vec<u64> = locks.iter_mut().map(|l| l.request().unwrap()).collect();
    assert!(stamps.iter().all(|&s| s == stamps[0]));

    let mut grants = drain_exclusive(&mut locks);
    grants.sort_unstable();
    assert_eq!(grants, vec![0, 1, 2]);
}

/// The local-clock rule replies to everything, so tied requests are granted
/// together.
#[test]
fn test_local_clock_policy_grants_concurrently() {
    let mut locks = group(2, ReplyPolicy::LocalClock);

    locks[0].request().unwrap();
    locks[1].request().unwrap();
    locks[0].test().unwrap();
    locks[1].test().unwrap();

    assert_eq!(locks[0].deferred_count(), 0);
    assert_eq!(locks[1].deferred_count(), 0);
    assert!(locks[0].lock().unwrap());
    assert!(locks[1].lock().unwrap());
}

#[test]
fn test_rounds_granted_in_request_order() {
    let mut locks = group(2, ReplyPolicy::RequestOrder);

    let first = locks[0].request().unwrap();
    let second = locks[0].request().unwrap();
    assert!(first < second);
    locks[1].test().unwrap();

    // Both rounds have their replies, but only the head is reported.
    assert!(locks[0].lock().unwrap());
    assert!(locks[0].lock().unwrap());
    assert_eq!(locks[0].pending_rounds(), 2);
    assert_eq!(locks[0].head_stamp(), Some(first));

    locks[0].exit().unwrap();
    assert_eq!(locks[0].head_stamp(), Some(second));
    assert!(locks[0].lock().unwrap());
    locks[0].exit().unwrap();
    assert!(!locks[0].wants_output());
}

#[test]
fn test_deferred_reply_sent_once_after_release() {
    let mut locks = group(2, ReplyPolicy::RequestOrder);

    locks[0].request().unwrap();
    locks[1].test().unwrap();
    locks[1].request().unwrap();

    locks[0].test().unwrap();
    assert_eq!(locks[0].deferred_count(), 1);

    // Still held back however often worker 0 services requests.
    for _ in 0..5 {
        locks[0].test().unwrap();
        assert!(!locks[1].lock().unwrap());
    }

    assert!(locks[0].lock().unwrap());
    locks[0].exit().unwrap();
    assert_eq!(locks[0].deferred_count(), 0);

    assert!(locks[1].lock().unwrap());
    locks[1].exit().unwrap();

    // A duplicate reply would grant the next round before worker 0 answers it.
    locks[1].request().unwrap();
    assert!(!locks[1].lock().unwrap());
    locks[0].test().unwrap();
    assert!(locks[1].lock().unwrap());
    locks[1].exit().unwrap();
}

#[test]
fn test_release_answers_earlier_request_while_later_round_waits() {
    let mut locks = group(2, ReplyPolicy::RequestOrder);

    let r1 = locks[0].request().unwrap();
    locks[1].test().unwrap();
    let theirs = locks[1].request().unwrap();
    locks[0].test().unwrap();
    assert_eq!(locks[0].deferred_count(), 1);

    let r2 = locks[0].request().unwrap();
    assert!(r1 < theirs && theirs < r2);
    locks[1].test().unwrap();
    assert_eq!(locks[1].deferred_count(), 1);

    assert!(locks[0].lock().unwrap());
    locks[0].exit().unwrap();
    // Worker 1's request precedes the new head, so it is answered now.
    assert_eq!(locks[0].deferred_count(), 0);
    assert!(locks[0].wants_output());

    assert!(locks[1].lock().unwrap());
    assert!(!locks[0].lock().unwrap());
    locks[1].exit().unwrap();

    assert!(locks[0].lock().unwrap());
    locks[0].exit().unwrap();
}

#[test]
fn test_exit_requires_granted_round() {
    let mut locks = group(2, ReplyPolicy::RequestOrder);

    assert!(matches!(locks[0].exit(), Err(LockError::NoActiveRound)));

    locks[0].request().unwrap();
    match locks[0].exit() {
        Err(LockError::NotGranted { received, expected }) => {
            assert_eq!(received, 0);
            assert_eq!(expected, 1);
        }
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_service_requires_init() {
    let mut endpoints = Fabric::build(2, &FabricConfig::default());
    let mut lock = ConsoleLock::new(endpoints.remove(0), ReplyPolicy::RequestOrder);
    assert!(matches!(lock.test(), Err(LockError::NotInitialised)));
}

#[test]
fn test_completed_sends_are_pruned() {
    let mut locks = group(3, ReplyPolicy::RequestOrder);

    locks[0].request().unwrap();
    assert_eq!(locks[0].in_flight_sends(), 2);
    locks[0].test().unwrap();
    assert_eq!(locks[0].in_flight_sends(), 0);
}

#[test]
fn test_random_interleavings_keep_exclusion_and_monotonic_clocks() {
    const WORKERS: usize = 4;
    const JOBS_EACH: usize = 3;

    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..20 {
        let mut locks = group(WORKERS as u32, ReplyPolicy::RequestOrder);
        let mut to_issue = vec![JOBS_EACH; WORKERS];
        let mut last_clock = vec![0u64; WORKERS];
        let mut grants = 0;

        for _ in 0..100_000 {
            if grants == WORKERS * JOBS_EACH {
                break;
            }

            let i = rng.gen_range(0..WORKERS);
            if to_issue[i] > 0 && rng.gen_bool(0.3) {
                locks[i].request().unwrap();
                to_issue[i] -= 1;
            }
            locks[i].test().unwrap();

            let granted: Vec<usize> = (0..WORKERS).filter(|&j| locks[j].lock().unwrap()).collect();
            assert!(granted.len() <= 1, "overlapping grants: {:?}", granted);
            if granted.first() == Some(&i) {
                locks[i].exit().unwrap();
                grants += 1;
            }

            for (j, lock) in locks.iter().enumerate() {
                assert!(lock.clock() >= last_clock[j]);
                last_clock[j] = lock.clock();
            }
        }

        assert_eq!(grants, WORKERS * JOBS_EACH);
        assert!(locks.iter().all(|l| l.deferred_count() == 0));
    }
}
