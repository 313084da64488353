use framejobs::{JobState, JobSystem, SchedulerConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn test_deep_chain_runs_in_order() {
    let jobs = JobSystem::new(3);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for step in 0..30 {
        let order = order.clone();
        let work = move || order.lock().unwrap().push(step);
        let handle = match handles.last() {
            Some(parent) => jobs.submit_dependent_fn(parent, work),
            None => jobs.submit_fn(work),
        };
        handles.push(handle);
    }

    jobs.join_all(handles, false);
    assert_eq!(*order.lock().unwrap(), (0..30).collect::<Vec<_>>());
    jobs.kill_workers();
}

#[test]
fn test_join_on_blocked_job_settles_parent_first() {
    // No workers: the joining thread has to run the whole chain itself.
    let jobs = JobSystem::init(SchedulerConfig::default()).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let bump = |ran: &Arc<AtomicUsize>| {
        let ran = ran.clone();
        move || {
            ran.fetch_add(1, Ordering::SeqCst);
        }
    };
    let a = jobs.submit_fn(bump(&ran));
    let b = jobs.submit_dependent_fn(&a, bump(&ran));
    let c = jobs.submit_dependent_fn(&b, bump(&ran));
    assert_eq!(jobs.state(&c), JobState::Blocked);

    jobs.join(c, true);
    assert_eq!(ran.load(Ordering::SeqCst), 3);

    // The ancestors were run but not retired.
    assert_eq!(jobs.state(&a), JobState::Finished);
    assert_eq!(jobs.state(&b), JobState::Finished);
    jobs.join_all([b, a], false);
    assert_eq!(jobs.live_jobs(), 0);
}

#[test]
fn test_fence_gates_next_phase() {
    let jobs = JobSystem::new(4);
    let phase1 = Arc::new(AtomicUsize::new(0));
    let seen_by_phase2 = Arc::new(Mutex::new(Vec::new()));

    let first: Vec<_> = (0..4)
        .map(|_| {
            let phase1 = phase1.clone();
            jobs.submit_fn(move || {
                std::thread::sleep(std::time::Duration::from_millis(5));
                phase1.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    let fence = jobs.submit_fence(first);

    let second: Vec<_> = (0..3)
        .map(|_| {
            let phase1 = phase1.clone();
            let seen = seen_by_phase2.clone();
            jobs.submit_dependent_fn(&fence, move || {
                seen.lock().unwrap().push(phase1.load(Ordering::SeqCst));
            })
        })
        .collect();

    jobs.join_all(second, true);
    jobs.join(fence, true);
    assert_eq!(*seen_by_phase2.lock().unwrap(), vec![4, 4, 4]);
    jobs.kill_workers();
}

#[test]
fn test_chained_fences() {
    let jobs = JobSystem::new(2);
    let stage = Arc::new(AtomicUsize::new(0));
    let too_early = Arc::new(AtomicUsize::new(0));

    // Job panics are caught by the scheduler, so violations are counted instead.
    let advance = |expected: usize| {
        let stage = stage.clone();
        let too_early = too_early.clone();
        move || {
            if stage.fetch_add(1, Ordering::SeqCst) < expected {
                too_early.fetch_add(1, Ordering::SeqCst);
            }
        }
    };

    let phase1: Vec<_> = (0..4).map(|_| jobs.submit_fn(advance(0))).collect();
    let fence1 = jobs.submit_fence(phase1);
    let phase2: Vec<_> = (0..3)
        .map(|_| jobs.submit_dependent_fn(&fence1, advance(4)))
        .collect();
    let fence2 = jobs.submit_dependent_fence(&fence1, phase2);
    let phase3: Vec<_> = (0..3)
        .map(|_| jobs.submit_dependent_fn(&fence2, advance(7)))
        .collect();

    jobs.join_all(phase3, true);
    jobs.join(fence2, true);
    jobs.join(fence1, true);
    assert_eq!(stage.load(Ordering::SeqCst), 10);
    assert_eq!(too_early.load(Ordering::SeqCst), 0);
    assert_eq!(jobs.live_jobs(), 0);
    jobs.kill_workers();
}

#[test]
fn test_dependent_on_finished_parent_starts_immediately() {
    let jobs = JobSystem::new(1);
    let parent = jobs.submit_fn(|| {});
    while jobs.state(&parent) != JobState::Finished {
        std::thread::yield_now();
    }

    let child = jobs.submit_dependent_fn(&parent, || {});
    assert_ne!(jobs.state(&child), JobState::Blocked);
    jobs.join(child, false);
    jobs.join(parent, false);
    jobs.kill_workers();
}
