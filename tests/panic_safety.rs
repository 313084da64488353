use framejobs::{JobState, JobSystem, SchedulerConfig};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[test]
fn test_panicking_job_still_finishes() {
    let jobs = JobSystem::new(1);
    let handle = jobs.submit_fn(|| panic!("Intentional panic for testing"));

    // Returns because the job reached FINISHED despite the panic.
    jobs.join(handle, false);
    assert_eq!(jobs.kill_workers(), 0, "worker should survive a job panic");
}

#[test]
fn test_worker_recovery_after_panic() {
    let jobs = JobSystem::new(1);
    jobs.join(jobs.submit_fn(|| panic!("Boom")), false);

    let success = Arc::new(AtomicBool::new(false));
    let flag = success.clone();
    jobs.join(
        jobs.submit_fn(move || flag.store(true, Ordering::SeqCst)),
        false,
    );

    assert!(success.load(Ordering::SeqCst), "subsequent job failed to run");
    jobs.kill_workers();
}

#[test]
fn test_dependents_of_panicking_job_are_released() {
    let jobs = JobSystem::new(2);
    let ran = Arc::new(AtomicUsize::new(0));

    let parent = jobs.submit_fn(|| panic!("parent failed"));
    let children: Vec<_> = (0..4)
        .map(|_| {
            let ran = ran.clone();
            jobs.submit_dependent_fn(&parent, move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    jobs.join_all(children, false);
    jobs.join(parent, false);
    assert_eq!(ran.load(Ordering::SeqCst), 4);
    jobs.kill_workers();
}

#[test]
fn test_panic_while_helping_stays_on_job() {
    let jobs = JobSystem::init(SchedulerConfig::default()).unwrap();
    let handle = jobs.submit_fn(|| panic!("caller-side panic"));
    assert_eq!(jobs.state(&handle), JobState::Unclaimed);

    // The calling thread runs the job itself and keeps going.
    assert!(jobs.run_pending());
    assert_eq!(jobs.state(&handle), JobState::Finished);
    jobs.join(handle, false);
}

#[test]
fn test_many_panics_across_workers() {
    let jobs = JobSystem::new(4);
    let survivors = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..60)
        .map(|i| {
            let survivors = survivors.clone();
            jobs.submit_fn(move || {
                if i % 3 == 0 {
                    panic!("job {i} failed");
                }
                survivors.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    jobs.join_all(handles, true);

    assert_eq!(survivors.load(Ordering::SeqCst), 40);
    assert_eq!(jobs.kill_workers(), 0);
}
