use forkjoin_scheduler::{Scheduler, SchedulerConfig};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Installs a `tracing` subscriber that writes to the test harness's
/// captured output. Safe to call from every test in this file even though
/// they run on separate threads in parallel: `try_init` is a no-op past
/// the first caller instead of panicking on re-init.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn exactly_once_execution_across_independent_jobs() {
    init_tracing();
    // Property 1: K independent jobs each increment a shared counter exactly once.
    let scheduler = Scheduler::new(SchedulerConfig::new(3)).unwrap();
    let counter = Arc::new(AtomicU32::new(0));
    let container = scheduler.create_container().unwrap();

    const K: u32 = 1024;
    for _ in 0..K {
        let counter = counter.clone();
        let job = scheduler
            .create_child_job(&container, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        scheduler.start(&job).unwrap();
    }

    scheduler.start(&container).unwrap();
    scheduler.wait(&container);
    assert_eq!(counter.load(Ordering::SeqCst), K);
}

#[test]
fn steal_liveness_with_single_producer() {
    init_tracing();
    // Property 5: one worker pushes M jobs while the rest idle; all run.
    let scheduler = Scheduler::new(SchedulerConfig::new(8)).unwrap();
    let counter = Arc::new(AtomicU32::new(0));
    let container = scheduler.create_container().unwrap();

    const M: u32 = 2048;
    for _ in 0..M {
        let counter = counter.clone();
        let job = scheduler
            .create_child_job(&container, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        scheduler.start(&job).unwrap();
    }

    scheduler.start(&container).unwrap();
    scheduler.wait(&container);
    assert_eq!(counter.load(Ordering::SeqCst), M);
}

#[test]
fn shutdown_joins_every_worker_thread() {
    init_tracing();
    // Property 9: `shutdown` blocks until every spawned thread exits.
    let scheduler = Scheduler::new(SchedulerConfig::new(4)).unwrap();

    let job = scheduler.create_job(|_| {}).unwrap();
    scheduler.start(&job).unwrap();
    scheduler.wait(&job);

    // No direct thread-count API is exposed; the contract under test is that
    // `shutdown` itself does not return until every worker thread has
    // joined, which this call completing at all (rather than hanging)
    // demonstrates.
    scheduler.shutdown();
}

#[test]
fn container_waits_for_grandchildren() {
    init_tracing();
    // Property 2, extended one level: container -> child -> grandchild.
    let scheduler = Scheduler::new(SchedulerConfig::new(4)).unwrap();
    let counter = Arc::new(AtomicU32::new(0));
    let container = scheduler.create_container().unwrap();

    for _ in 0..64 {
        let counter_outer = counter.clone();
        let scheduler_for_child = &scheduler;
        let child = scheduler
            .create_child_job(&container, move |_| {
                counter_outer.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        for _ in 0..2 {
            let counter = counter.clone();
            let grandchild = scheduler_for_child
                .create_child_job(&child, move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            scheduler_for_child.start(&grandchild).unwrap();
        }

        scheduler.start(&child).unwrap();
    }

    scheduler.start(&container).unwrap();
    scheduler.wait(&container);
    assert_eq!(counter.load(Ordering::SeqCst), 64 * 3);
}

#[test]
fn global_scheduler_round_trip() {
    init_tracing();
    let scheduler = Scheduler::new(SchedulerConfig::new(2)).unwrap();
    forkjoin_scheduler::initialize_global(scheduler.clone());
    assert!(Arc::ptr_eq(forkjoin_scheduler::global(), &scheduler));
}

#[test]
fn create_child_job_of_current_reads_thread_local_parent() {
    init_tracing();
    let scheduler = Arc::new(Scheduler::new(SchedulerConfig::new(2)).unwrap());
    let seen_index = Arc::new(AtomicUsize::new(usize::MAX));

    let inner_scheduler = scheduler.clone();
    let inner_seen = seen_index.clone();
    let outer = scheduler
        .create_job(move |_| {
            seen_index_matches_origin(&inner_scheduler, &inner_seen);
        })
        .unwrap();

    scheduler.start(&outer).unwrap();
    scheduler.wait(&outer);
    assert_ne!(seen_index.load(Ordering::SeqCst), usize::MAX);
}

fn seen_index_matches_origin(scheduler: &Arc<Scheduler>, seen: &Arc<AtomicUsize>) {
    let current = forkjoin_scheduler::current_worker_index().unwrap();
    seen.store(current, Ordering::SeqCst);
    let child = scheduler
        .create_child_job_of_current(|_| {})
        .unwrap();
    scheduler.start(&child).unwrap();
    scheduler.wait(&child);
}

#[test]
fn reset_frame_without_prior_activity_is_a_no_op() {
    init_tracing();
    let scheduler = Scheduler::new(SchedulerConfig::new(2)).unwrap();
    scheduler.reset_frame();
    scheduler.reset_frame();

    let job = scheduler.create_job(|_| {}).unwrap();
    scheduler.start(&job).unwrap();
    scheduler.wait(&job);
}

#[test]
fn join_runs_both_closures_and_waits_for_both() {
    init_tracing();
    let scheduler = Scheduler::new(SchedulerConfig::new(2)).unwrap();
    let left = Arc::new(AtomicU32::new(0));
    let right = Arc::new(AtomicU32::new(0));

    let left_for_job = left.clone();
    let right_for_job = right.clone();
    scheduler
        .join(
            move || {
                left_for_job.store(20, Ordering::SeqCst);
            },
            move || {
                right_for_job.store(30, Ordering::SeqCst);
            },
        )
        .unwrap();

    assert_eq!(left.load(Ordering::SeqCst), 20);
    assert_eq!(right.load(Ordering::SeqCst), 30);
}
