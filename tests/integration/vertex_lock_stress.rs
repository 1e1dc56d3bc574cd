#![allow(missing_docs)]

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use sombra_durable::graph::GraphContext;
use sombra_durable::primitives::concurrency::{
    LockState, VertexDescriptor, VertexLock, VertexType, MAX_READERS, MAX_WRITE_RECURSION,
};
use sombra_durable::types::ThreadTag;
use sombra_durable::{ObjectId, Result, SombraError};

/// Threads in the mixed reader/writer run; as many as a vertex admits readers.
const THREADS: usize = MAX_READERS as usize;
const ROUNDS: usize = 100;
/// Threads serializing through the graph context.
const WRITERS: usize = 16;
const PATIENCE: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug)]
enum Step {
    LockWritable,
    UnlockWritable,
    LockReadonly,
    UnlockReadonly,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        Just(Step::LockWritable),
        Just(Step::UnlockWritable),
        Just(Step::LockReadonly),
        Just(Step::UnlockReadonly),
    ]
}

proptest! {
    #[test]
    fn descriptor_tracks_a_counting_model(steps in prop::collection::vec(step(), 1..400)) {
        let tid = ThreadTag::current();
        let mut d = VertexDescriptor::new(VertexType::VERTEX);
        let (mut writes, mut reads) = (0i8, 0i8);
        for step in steps {
            match step {
                Step::LockWritable => {
                    let expected = reads == 0 && writes < MAX_WRITE_RECURSION;
                    prop_assert_eq!(d.lockable_as_writable(tid), expected);
                    if expected {
                        writes += 1;
                        prop_assert_eq!(d.lock_writable(tid), writes);
                    }
                }
                Step::UnlockWritable if writes > 0 => {
                    writes -= 1;
                    prop_assert_eq!(d.unlock_writable(tid), writes);
                }
                Step::LockReadonly => {
                    let expected = writes == 0 && reads < MAX_READERS;
                    prop_assert_eq!(d.lockable_as_readonly(), expected);
                    if expected {
                        reads += 1;
                        prop_assert_eq!(d.lock_readonly(), reads);
                    }
                }
                Step::UnlockReadonly if reads > 0 => {
                    reads -= 1;
                    prop_assert_eq!(d.unlock_readonly(), reads);
                }
                _ => {}
            }
            prop_assert_eq!(d.semaphore(), writes.max(reads));
            prop_assert_eq!(d.lock_state() == LockState::Idle, writes == 0 && reads == 0);
            prop_assert_eq!(d.writer() == Some(tid), writes > 0);
            prop_assert_eq!(d.vertex_type(), VertexType::VERTEX);
        }
    }
}

#[test]
fn writers_exclude_readers_and_each_other() {
    let lock = Arc::new(VertexLock::new(VertexType::VERTEX));
    // -1 while a writer is inside, otherwise the number of readers inside.
    let occupancy = Arc::new(AtomicI32::new(0));
    let writes = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let lock = Arc::clone(&lock);
            let occupancy = Arc::clone(&occupancy);
            let writes = Arc::clone(&writes);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for round in 0..ROUNDS {
                    if (i + round) % 3 == 0 {
                        if lock.acquire_writable(Some(PATIENCE)).is_err() {
                            continue;
                        }
                        // Reentry by the owner never blocks.
                        assert_eq!(lock.acquire_writable(Some(Duration::ZERO)).expect("reentry"), 2);
                        assert_eq!(occupancy.swap(-1, Ordering::SeqCst), 0);
                        writes.fetch_add(1, Ordering::Relaxed);
                        thread::yield_now();
                        assert_eq!(occupancy.swap(0, Ordering::SeqCst), -1);
                        assert_eq!(lock.release_writable(), 1);
                        assert_eq!(lock.release_writable(), 0);
                    } else {
                        lock.acquire_readonly(Some(PATIENCE)).expect("readonly");
                        assert!(occupancy.fetch_add(1, Ordering::SeqCst) >= 0);
                        thread::yield_now();
                        assert!(occupancy.fetch_sub(1, Ordering::SeqCst) >= 1);
                        lock.release_readonly();
                    }
                    thread::sleep(Duration::from_micros(50));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked");
    }
    assert!(writes.load(Ordering::Relaxed) > 0);
    let idle = lock.snapshot();
    assert_eq!(idle.lock_state(), LockState::Idle);
    assert_eq!(idle.semaphore(), 0);
}

#[test]
fn concurrent_writers_serialize_rank_updates() -> Result<()> {
    let ctx = GraphContext::new("stress");
    ctx.create_vertex("counter", VertexType::VERTEX)?.close()?;
    let counter = ObjectId::from_name("counter");
    let barrier = Arc::new(Barrier::new(WRITERS));
    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<()> {
                barrier.wait();
                for _ in 0..ROUNDS / 4 {
                    let mut writer = ctx.open_vertex(counter, Some(Duration::from_secs(10)))?;
                    let rank = ctx.store().vertex(counter).map_or(0, |v| v.rank);
                    writer.set_rank(rank + 1)?;
                    writer.close()?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked")?;
    }
    let rank = ctx.read_vertex(counter, None, |v| v.rank)?;
    assert_eq!(rank, (WRITERS * (ROUNDS / 4)) as u64);
    assert_eq!(ctx.writable_count(), 0);
    Ok(())
}

#[test]
fn readers_past_the_ceiling_wait_for_a_free_slot() {
    let lock = Arc::new(VertexLock::new(VertexType::VERTEX));
    let holders = MAX_READERS as usize;
    let filled = Arc::new(Barrier::new(holders + 1));
    let leave = Arc::new(Barrier::new(holders + 1));
    let handles: Vec<_> = (0..holders)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let filled = Arc::clone(&filled);
            let leave = Arc::clone(&leave);
            thread::spawn(move || {
                lock.acquire_readonly(Some(PATIENCE)).expect("readonly");
                filled.wait();
                leave.wait();
                lock.release_readonly();
            })
        })
        .collect();
    filled.wait();
    let full = lock.snapshot();
    assert_eq!(full.semaphore(), MAX_READERS);
    assert!(!full.lockable_as_readonly());

    let late = {
        let lock = Arc::clone(&lock);
        thread::spawn(move || {
            let count = lock.acquire_readonly(Some(PATIENCE)).expect("late reader");
            lock.release_readonly();
            count
        })
    };
    assert!(matches!(
        lock.acquire_readonly(Some(Duration::from_millis(20))),
        Err(SombraError::Timeout(_))
    ));
    assert_eq!(lock.snapshot().semaphore(), MAX_READERS);

    leave.wait();
    for handle in handles {
        handle.join().expect("holder panicked");
    }
    let count = late.join().expect("late reader panicked");
    assert!((1..=MAX_READERS).contains(&count));
    assert_eq!(lock.snapshot().lock_state(), LockState::Idle);
}

#[test]
fn reader_count_never_passes_the_ceiling_under_contention() {
    let lock = Arc::new(VertexLock::new(VertexType::VERTEX));
    let threads = MAX_READERS as usize + 16;
    let inside = Arc::new(AtomicI32::new(0));
    let peak = Arc::new(AtomicI32::new(0));
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let peak = Arc::clone(&peak);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ROUNDS / 2 {
                    let count = lock.acquire_readonly(Some(PATIENCE)).expect("readonly");
                    assert!(count <= MAX_READERS);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(200));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    lock.release_readonly();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("reader panicked");
    }
    assert!(peak.load(Ordering::SeqCst) <= i32::from(MAX_READERS));
    assert_eq!(lock.snapshot().semaphore(), 0);
}
