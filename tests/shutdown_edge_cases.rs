use framejobs::{JobSystem, SchedulerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[test]
fn test_kill_after_joining_running_jobs() {
    let jobs = JobSystem::new(2);
    let done = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let done = done.clone();
            jobs.submit_fn(move || {
                std::thread::sleep(Duration::from_millis(10));
                done.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    jobs.join_all(handles, false);

    assert_eq!(jobs.kill_workers(), 0);
    assert_eq!(done.load(Ordering::SeqCst), 10);
    assert_eq!(jobs.live_jobs(), 0);
}

#[test]
fn test_jobs_left_behind_by_kill_run_on_caller() {
    let jobs = JobSystem::new(2);
    let done = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let done = done.clone();
            jobs.submit_fn(move || {
                std::thread::sleep(Duration::from_millis(1));
                done.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    // Workers may exit before every job was claimed.
    jobs.kill_workers();
    assert_eq!(jobs.num_workers(), 0);

    jobs.join_all(handles, true);
    assert_eq!(done.load(Ordering::SeqCst), 20);
}

#[test]
fn test_kill_without_workers() {
    let jobs = JobSystem::init(SchedulerConfig::default()).unwrap();
    assert_eq!(jobs.kill_workers(), 0);
    assert_eq!(jobs.live_jobs(), 0);
}

#[test]
fn test_repeated_spawn_kill_cycles() {
    let jobs = JobSystem::init(SchedulerConfig {
        max_jobs: 16,
        ..SchedulerConfig::default()
    })
    .unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    for round in 1..=5 {
        jobs.spawn_workers(round);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let done = done.clone();
                jobs.submit_fn(move || {
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        jobs.join_all(handles, false);
        assert_eq!(jobs.kill_workers(), 0);
        // Termination jobs are retired by the kill itself.
        assert_eq!(jobs.live_jobs(), 0);
    }
    assert_eq!(done.load(Ordering::SeqCst), 40);
}

#[test]
fn test_drop_with_idle_workers() {
    let jobs = JobSystem::new(4);
    let handle = jobs.submit_fn(|| {});
    jobs.join(handle, false);
    drop(jobs);
}
