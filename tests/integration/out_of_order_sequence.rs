#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sombra_records::primitives::concurrency::OutOfOrderSequence;
use sombra_records::types::{Result, StoreError};

const WRITERS: usize = 4;
const PER_WRITER: i64 = 500;

#[test]
fn concurrent_offers_reach_the_highest_number() {
    let sequence = Arc::new(OutOfOrderSequence::new(0, 8, [0i64; 2]));
    let total = WRITERS as i64 * PER_WRITER;
    let mut numbers: Vec<i64> = (1..=total).collect();
    numbers.shuffle(&mut ChaCha8Rng::seed_from_u64(0x5eed));

    let waiter = {
        let sequence = Arc::clone(&sequence);
        thread::spawn(move || sequence.wait_for(total, Duration::from_secs(30)))
    };

    let handles: Vec<_> = numbers
        .chunks(PER_WRITER as usize)
        .map(|chunk| {
            let sequence = Arc::clone(&sequence);
            let chunk = chunk.to_vec();
            thread::spawn(move || {
                for number in chunk {
                    sequence
                        .offer(number, [number, number * 10])
                        .expect("offer within window");
                    let (gap_free, meta) = sequence.get();
                    assert_eq!(meta, [gap_free, gap_free * 10]);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread panicked");
    }

    assert!(waiter.join().expect("waiter thread panicked"));
    assert_eq!(sequence.get(), (total, [total, total * 10]));
    assert_eq!(sequence.highest_ever_seen(), total);
    assert!(sequence.snapshot().pending.is_empty());
}

#[test]
fn waiting_times_out_on_a_gap() -> Result<()> {
    let sequence = OutOfOrderSequence::new(10, 4, ());
    assert!(!sequence.offer(12, ())?);
    assert!(sequence.seen(12));
    assert!(!sequence.seen(11));
    assert!(!sequence.wait_for(12, Duration::from_millis(20)));
    assert!(sequence.wait_for(10, Duration::ZERO));

    assert!(sequence.offer(11, ())?);
    assert_eq!(sequence.highest_gap_free_number(), 12);
    assert!(sequence.wait_for(12, Duration::from_millis(20)));
    Ok(())
}

#[test]
fn reset_discards_pending_offers() -> Result<()> {
    let sequence = OutOfOrderSequence::new(0, 2, 0u32);
    sequence.offer(3, 3)?;
    sequence.offer(9, 9)?;
    assert_eq!(sequence.snapshot().pending, vec![3, 9]);
    sequence.set(20, 200);
    assert_eq!(sequence.get(), (20, 200));
    assert!(sequence.snapshot().pending.is_empty());
    assert!(!sequence.offer(15, 150)?);
    assert!(sequence.offer(21, 210)?);
    assert_eq!(sequence.get(), (21, 210));
    Ok(())
}

#[test]
fn far_ahead_offers_are_rejected_without_growing() -> Result<()> {
    let sequence = OutOfOrderSequence::new(0, 8, 0i64);
    assert!(matches!(
        sequence.offer(1 << 40, 1),
        Err(StoreError::Invalid(_))
    ));
    assert!(sequence.snapshot().pending.is_empty());
    assert_eq!(sequence.highest_ever_seen(), 0);
    assert!(sequence.offer(1, 1)?);
    Ok(())
}
