use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};

use idlease_bank::{Bank, BankError};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Polls until the identifier is free or the deadline passes.
fn reclaimed_within(bank: &Bank, id: u32, deadline: Duration) -> bool {
    let limit = Instant::now() + deadline;
    while Instant::now() < limit {
        if bank.query(id).is_none() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn expired_lease_is_reclaimed_and_reused() {
    init_tracing();
    let bank = Bank::new(0, 8);
    let lease = bank
        .allocate("short-lived", Duration::from_millis(50))
        .expect("allocate");
    assert!(reclaimed_within(&bank, lease.id, Duration::from_secs(5)));

    // The reclaimed identifier sits at the head of the free chain.
    let next = bank
        .allocate("successor", Duration::from_secs(300))
        .expect("reallocate");
    assert_eq!(next.id, lease.id);
    assert_eq!(
        bank.release(lease.id, lease.token),
        Err(BankError::InvalidToken)
    );
    bank.shutdown();
}

#[test]
fn zero_ttl_expires_promptly() {
    init_tracing();
    let bank = Bank::new(0, 8);
    let lease = bank.allocate("ephemeral", Duration::ZERO).expect("allocate");
    assert!(reclaimed_within(&bank, lease.id, Duration::from_secs(2)));
    bank.shutdown();
}

#[test]
fn reset_extends_a_lease_past_its_original_deadline() {
    init_tracing();
    let bank = Bank::new(0, 8);
    let lease = bank
        .allocate("extended", Duration::from_secs(1))
        .expect("allocate");
    bank.reset(lease.id, Duration::from_secs(30), lease.token)
        .expect("reset");

    thread::sleep(Duration::from_millis(2_500));
    assert_eq!(bank.query(lease.id).as_deref(), Some("extended"));
    bank.release(lease.id, lease.token).expect("release");
    bank.shutdown();
}

#[test]
fn reset_can_also_shorten_a_lease() {
    init_tracing();
    let bank = Bank::new(0, 8);
    let lease = bank
        .allocate("shortened", Duration::from_secs(300))
        .expect("allocate");
    bank.reset(lease.id, Duration::from_millis(50), lease.token)
        .expect("reset");
    assert!(reclaimed_within(&bank, lease.id, Duration::from_secs(5)));
    bank.shutdown();
}

#[test]
fn reset_does_not_rotate_the_token() {
    let bank = Bank::new(0, 8);
    let lease = bank
        .allocate("steady", Duration::from_secs(1))
        .expect("allocate");
    bank.reset(lease.id, Duration::from_secs(300), lease.token)
        .expect("reset");
    bank.release(lease.id, lease.token)
        .expect("release with the original token");
    bank.shutdown();
}

#[test]
fn a_released_timer_never_disturbs_the_next_holder() {
    init_tracing();
    let bank = Bank::new(0, 4);
    let first = bank
        .allocate("first", Duration::from_millis(200))
        .expect("allocate");
    bank.release(first.id, first.token).expect("release");

    let second = bank
        .allocate("second", Duration::from_secs(300))
        .expect("reallocate");
    assert_eq!(second.id, first.id);
    thread::sleep(Duration::from_millis(600));
    assert_eq!(bank.query(second.id).as_deref(), Some("second"));
    bank.shutdown();
}

#[test]
fn expiration_recovers_an_exhausted_range() {
    init_tracing();
    let bank = Bank::new(0, 4);
    for n in 0..4 {
        bank.allocate(format!("c{n}"), Duration::from_millis(80))
            .expect("fill range");
    }
    assert_eq!(
        bank.allocate("blocked", Duration::from_secs(60)),
        Err(BankError::AllIdentifiersInUse)
    );

    let limit = Instant::now() + Duration::from_secs(5);
    let mut recovered = 0;
    while recovered < 4 && Instant::now() < limit {
        match bank.allocate("recovered", Duration::from_secs(60)) {
            Ok(_) => recovered += 1,
            Err(BankError::AllIdentifiersInUse) => thread::sleep(Duration::from_millis(10)),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!(recovered, 4);
    bank.shutdown();
}

#[test]
fn concurrent_churn_preserves_exclusive_ownership() {
    let bank = Bank::new(0, 64);
    let mut workers = Vec::new();
    for t in 0..8 {
        let bank = bank.clone();
        workers.push(thread::spawn(move || {
            let me = format!("worker-{t}");
            for _ in 0..40 {
                let lease = bank
                    .allocate(me.clone(), Duration::from_secs(60))
                    .expect("allocate");
                assert_eq!(bank.query(lease.id).as_deref(), Some(me.as_str()));
                bank.release(lease.id, lease.token).expect("release");
            }
        }));
    }
    for worker in workers {
        worker.join().expect("churn worker");
    }

    // Every lease came back, so the whole range allocates exactly once more.
    for _ in 0..64 {
        bank.allocate("sweep", Duration::from_secs(60))
            .expect("allocate after churn");
    }
    assert_eq!(
        bank.allocate("sweep", Duration::from_secs(60)),
        Err(BankError::AllIdentifiersInUse)
    );
    bank.shutdown();
}

#[test]
fn concurrent_allocations_never_collide() {
    let bank = Bank::new(0, 0);
    let mut workers = Vec::new();
    for t in 0..6 {
        let bank = bank.clone();
        workers.push(thread::spawn(move || {
            (0..50)
                .map(|n| {
                    bank.allocate(format!("w{t}-{n}"), Duration::from_secs(60))
                        .expect("allocate")
                        .id
                })
                .collect::<Vec<_>>()
        }));
    }
    let mut seen = HashSet::new();
    for worker in workers {
        for id in worker.join().expect("allocating worker") {
            assert!(seen.insert(id), "identifier {id} granted twice");
        }
    }
    assert_eq!(seen.len(), 300);
    bank.shutdown();
}

#[test]
fn shutdown_races_with_traffic_without_hanging() {
    let bank = Bank::new(0, 0);
    let mut workers = Vec::new();
    for t in 0..4 {
        let bank = bank.clone();
        workers.push(thread::spawn(move || {
            for n in 0..200 {
                match bank.allocate(format!("w{t}-{n}"), Duration::from_millis(50)) {
                    Ok(lease) => {
                        let _ = bank.release(lease.id, lease.token);
                    }
                    Err(BankError::Terminated) => break,
                    Err(err) => panic!("unexpected error: {err}"),
                }
            }
        }));
    }
    thread::sleep(Duration::from_millis(30));
    bank.shutdown();
    for worker in workers {
        worker.join().expect("traffic worker");
    }
    assert_eq!(
        bank.allocate("late", Duration::from_secs(1)),
        Err(BankError::Terminated)
    );
    assert_eq!(bank.query(0), None);
}
