//! Many workers racing for the same board: every job must run exactly once.

use framejobs::{JobHandle, JobSystem, SchedulerConfig};
use rand::Rng;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn stress_system(workers: usize, max_jobs: usize) -> JobSystem {
    let jobs = JobSystem::init(SchedulerConfig {
        max_jobs,
        ..SchedulerConfig::default()
    })
    .unwrap();
    jobs.spawn_workers(workers);
    jobs
}

#[test]
fn test_each_job_claimed_once() {
    let jobs = stress_system(8, 256);
    let mut rng = rand::rng();

    for _round in 0..20 {
        let runs: Vec<_> = (0..200).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let mut handles: Vec<JobHandle> = runs
            .iter()
            .map(|runs| {
                let runs = runs.clone();
                let spin = rng.random_range(0..200u32);
                jobs.submit_fn(move || {
                    for _ in 0..spin {
                        std::hint::spin_loop();
                    }
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        // Join out of submission order.
        handles.shuffle(&mut rng);
        jobs.join_all(handles, rng.random_bool(0.5));

        for (i, runs) in runs.iter().enumerate() {
            assert_eq!(runs.load(Ordering::SeqCst), 1, "job {i} ran a wrong number of times");
        }
        assert_eq!(jobs.unclaimed_count(), 0);
    }
    jobs.kill_workers();
}

#[test]
fn test_producers_on_many_threads() {
    let jobs = Arc::new(stress_system(4, 128));
    let total = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let jobs = jobs.clone();
            let total = total.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let handles: Vec<_> = (0..5)
                        .map(|_| {
                            let total = total.clone();
                            jobs.submit_fn(move || {
                                total.fetch_add(1, Ordering::SeqCst);
                            })
                        })
                        .collect();
                    jobs.join_all(handles, true);
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 4 * 50 * 5);
    assert_eq!(jobs.live_jobs(), 0);
    jobs.kill_workers();
}

#[test]
fn test_shuffled_dependency_forest() {
    let jobs = stress_system(6, 200);
    let mut rng = rand::rng();
    let finished = Arc::new(AtomicUsize::new(0));

    let roots: Vec<_> = (0..10)
        .map(|_| {
            let finished = finished.clone();
            jobs.submit_fn(move || {
                finished.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    let mut leaves = Vec::new();
    // Ten leaves per root keeps every root under the dependents limit.
    for i in 0..100 {
        let root = &roots[i % roots.len()];
        let finished = finished.clone();
        leaves.push(jobs.submit_dependent_fn(root, move || {
            finished.fetch_add(1, Ordering::SeqCst);
        }));
    }

    leaves.shuffle(&mut rng);
    jobs.join_all(leaves, true);
    jobs.join_all(roots, false);
    assert_eq!(finished.load(Ordering::SeqCst), 110);
    jobs.kill_workers();
}
