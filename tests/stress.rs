//! Multi-threaded stress tests: contention, conservation invariants and
//! retry/wake-up churn.

use std::thread;

use rand::Rng;
use txcell::{atomically, Stm, TVar};

const ACCOUNT_TOTAL: i64 = 100;

/// Thousands of concurrent transfers conserve the total at every
/// observation, not just at the end.
#[test]
fn concurrent_transfers_conserve_sum() {
    let a = TVar::new(ACCOUNT_TOTAL);
    let b = TVar::new(0i64);

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let a = a.clone();
            let b = b.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..2500 {
                    let amount = rng.gen_range(1i64..=3);
                    let (from, to) = if worker % 2 == 0 {
                        (a.clone(), b.clone())
                    } else {
                        (b.clone(), a.clone())
                    };
                    let transfer = from
                        .update(move |x| x - amount)
                        .zip_right(to.update(move |x| x + amount));
                    atomically(&transfer);
                }
            })
        })
        .collect();

    let observer = {
        let a = a.clone();
        let b = b.clone();
        thread::spawn(move || {
            for _ in 0..200 {
                let (x, y) = atomically(&a.read().zip(b.read()));
                assert_eq!(x + y, ACCOUNT_TOTAL);
            }
        })
    };

    for worker in workers {
        worker.join().unwrap();
    }
    observer.join().unwrap();

    let (x, y) = atomically(&a.read().zip(b.read()));
    assert_eq!(x + y, ACCOUNT_TOTAL);
}

/// No update is lost under heavy write contention.
#[test]
fn contended_counter_exact() {
    let counter = TVar::new(0u64);

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    atomically(&counter.update(|x| x + 1));
                }
            })
        })
        .collect();

    for handle in threads {
        handle.join().unwrap();
    }

    assert_eq!(counter.read_atomic(), 8 * 500);
}

/// Handoff through a one-slot mailbox exercises retry and wake-up in both
/// directions; every message arrives exactly once and in order.
#[test]
fn mailbox_handoff() {
    const MESSAGES: u32 = 500;

    let slot: TVar<Option<u32>> = TVar::new(None);

    let producer = {
        let slot = slot.clone();
        thread::spawn(move || {
            for message in 0..MESSAGES {
                let writer = slot.clone();
                let put = slot.read().and_then(move |current| match current {
                    None => writer.write(Some(message)),
                    Some(_) => Stm::retry(),
                });
                atomically(&put);
            }
        })
    };

    let consumer = {
        let slot = slot.clone();
        thread::spawn(move || {
            let mut received = Vec::new();
            for _ in 0..MESSAGES {
                let clearer = slot.clone();
                let take = slot.read().and_then(move |current| match current {
                    Some(value) => clearer.write(None).map_to(value),
                    None => Stm::retry(),
                });
                received.push(atomically(&take));
            }
            received
        })
    };

    producer.join().unwrap();
    let received = consumer.join().unwrap();
    assert_eq!(received, (0..MESSAGES).collect::<Vec<_>>());
}

/// Readers observing two vars never see a torn write.
#[test]
fn paired_writes_are_never_torn() {
    let left = TVar::new(0u64);
    let right = TVar::new(0u64);

    let writer = {
        let left = left.clone();
        let right = right.clone();
        thread::spawn(move || {
            for i in 1..=1000 {
                atomically(&left.write(i).zip_right(right.write(i)));
            }
        })
    };

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let left = left.clone();
            let right = right.clone();
            thread::spawn(move || {
                for _ in 0..500 {
                    let (x, y) = atomically(&left.read().zip(right.read()));
                    assert_eq!(x, y);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}
