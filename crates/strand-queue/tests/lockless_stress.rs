//! Exactly-once delivery under heavy producer/consumer contention.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use strand_queue::LocklessList;

#[test]
fn basic_ops_round_trip() {
    let list = LocklessList::new();
    assert!(list.is_empty());

    let op_count = 2u32;
    for idx in 0..op_count {
        list.push_back(idx);
        assert!(!list.is_empty());
    }

    let mut seen = vec![false; op_count as usize];
    loop {
        let was_empty = list.is_empty();
        match list.pop_front() {
            None => {
                assert!(was_empty);
                break;
            }
            Some(value) => {
                assert!(!was_empty);
                seen[value as usize] = true;
            }
        }
    }
    for (idx, popped) in seen.iter().enumerate() {
        assert!(popped, "value {idx} never popped");
    }
}

#[test]
fn concurrent_push_pop_delivers_exactly_once() {
    const PUSH_THREADS: usize = 30;
    const POP_THREADS: usize = 10;
    const CALLS_PER_THREAD: usize = 50_000;
    const TOTAL: usize = PUSH_THREADS * CALLS_PER_THREAD;

    let list = Arc::new(LocklessList::new());
    let slots: Arc<Vec<AtomicBool>> =
        Arc::new((0..TOTAL).map(|_| AtomicBool::new(false)).collect());
    let producing = Arc::new(AtomicBool::new(true));
    let popped = Arc::new(AtomicUsize::new(0));

    let pushers: Vec<_> = (0..PUSH_THREADS)
        .map(|thread_index| {
            let list = Arc::clone(&list);
            thread::spawn(move || {
                for call_index in 0..CALLS_PER_THREAD {
                    list.push_back((thread_index * CALLS_PER_THREAD + call_index) as u32);
                }
            })
        })
        .collect();

    let poppers: Vec<_> = (0..POP_THREADS)
        .map(|_| {
            let list = Arc::clone(&list);
            let slots = Arc::clone(&slots);
            let producing = Arc::clone(&producing);
            let popped = Arc::clone(&popped);
            thread::spawn(move || loop {
                match list.pop_front() {
                    Some(value) => {
                        let duplicate = slots[value as usize].swap(true, Ordering::SeqCst);
                        assert!(!duplicate, "value {value} popped twice");
                        popped.fetch_add(1, Ordering::SeqCst);
                    }
                    None => {
                        if !producing.load(Ordering::SeqCst) && list.is_empty() {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    for handle in pushers {
        handle.join().unwrap();
    }
    producing.store(false, Ordering::SeqCst);
    for handle in poppers {
        handle.join().unwrap();
    }

    assert_eq!(popped.load(Ordering::SeqCst), TOTAL);
    for (index, slot) in slots.iter().enumerate() {
        assert!(slot.load(Ordering::SeqCst), "value {index} never popped");
    }
}
