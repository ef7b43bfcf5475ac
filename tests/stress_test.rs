//! Stress tests for queue ordering under load

use dispatchkit::prelude::*;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn runtime() -> Runtime {
    Runtime::new(Config::builder().num_threads(8).build().unwrap()).unwrap()
}

/// Start/end tickets drawn from one global clock.
#[derive(Debug, Clone, Copy)]
struct Span {
    barrier: bool,
    start: usize,
    end: usize,
}

#[test]
#[ignore] // Run with --ignored flag
fn stress_test_random_barrier_layouts() {
    let rt = runtime();
    let mut rng = rand::thread_rng();

    for _ in 0..50 {
        let queue = rt.concurrent_queue();
        let clock = Arc::new(AtomicUsize::new(0));
        let spans = Arc::new(Mutex::new(Vec::new()));

        let layout: Vec<bool> = (0..200).map(|_| rng.gen_bool(0.1)).collect();

        for (index, &barrier) in layout.iter().enumerate() {
            let (clock, spans) = (clock.clone(), spans.clone());
            let task = move || {
                let start = clock.fetch_add(1, Ordering::SeqCst);
                std::hint::spin_loop();
                let end = clock.fetch_add(1, Ordering::SeqCst);
                spans.lock().push((index, Span { barrier, start, end }));
            };
            if barrier {
                queue.submit_barrier(task);
            } else {
                queue.submit(task);
            }
        }

        queue.submit_barrier_and_wait(|| {});

        let mut spans = spans.lock().clone();
        spans.sort_by_key(|(index, _)| *index);
        assert_eq!(spans.len(), layout.len());

        for (i, (_, span)) in spans.iter().enumerate() {
            if !span.barrier {
                continue;
            }
            for (j, (_, other)) in spans.iter().enumerate() {
                if j < i {
                    assert!(other.end < span.start, "task {} overlapped barrier {}", j, i);
                } else if j > i {
                    assert!(other.start > span.end, "task {} started before barrier {}", j, i);
                }
            }
        }
    }
}

#[test]
#[ignore]
fn stress_test_many_serial_queues() {
    let rt = runtime();
    let queues: Vec<TaskQueue> = (0..32).map(|_| rt.serial_queue()).collect();
    let logs: Vec<Arc<Mutex<Vec<usize>>>> = (0..32).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();

    for i in 0..1_000 {
        for (queue, log) in queues.iter().zip(&logs) {
            let log = log.clone();
            queue.submit(move || log.lock().push(i));
        }
    }

    for queue in &queues {
        queue.submit_and_wait(|| {});
    }

    for log in &logs {
        assert_eq!(*log.lock(), (0..1_000).collect::<Vec<_>>());
    }
}

#[test]
#[ignore]
fn stress_test_group_reuse() {
    let rt = runtime();
    let queue = rt.concurrent_queue();
    let group = CompletionGroup::new();
    let counter = Arc::new(AtomicUsize::new(0));

    for round in 1..=100 {
        for _ in 0..100 {
            let counter = counter.clone();
            queue.submit_in_group(
                move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                },
                &group,
            );
        }
        group.wait();
        assert_eq!(counter.load(Ordering::Relaxed), round * 100);
    }
}

#[test]
#[ignore]
fn stress_test_semaphore_ping_pong() {
    let rt = runtime();
    let queue = rt.concurrent_queue();
    let ping = CountingSemaphore::new(0);
    let pong = CountingSemaphore::new(0);

    let (ping_rx, pong_tx) = (ping.clone(), pong.clone());
    queue.submit(move || {
        for _ in 0..10_000 {
            ping_rx.wait();
            pong_tx.signal();
        }
    });

    for _ in 0..10_000 {
        ping.signal();
        pong.wait();
    }

    assert_eq!(ping.value(), 0);
    assert_eq!(pong.value(), 0);
}
