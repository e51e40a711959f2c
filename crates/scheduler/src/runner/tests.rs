use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use farm_core::{Build, SchedulerConfig, Step, StepId};

use crate::error::SchedulerError;
use crate::runner::StepScheduler;
use crate::types::{AttemptOutcome, AttemptReport, Verdict};

fn scheduler() -> StepScheduler {
    StepScheduler::new(SchedulerConfig::default())
}

/// A step depending on one build of the named jobset.
fn step_in(
    sched: &StepScheduler,
    id: &str,
    jobset: &str,
    build_id: u64,
    global: i32,
) -> Arc<Step> {
    let js = sched.shares().register(jobset, None).unwrap();
    let build = Arc::new(Build::with_priorities(build_id, js, global, 0));
    Arc::new(Step::with_builds(id, [build]))
}

fn report(outcome: AttemptOutcome, secs: u64) -> AttemptReport {
    AttemptReport::new(outcome, Utc::now(), Duration::from_secs(secs))
}

#[test]
fn new_steps_start_on_first_rung() {
    let sched = scheduler();
    let s = step_in(&sched, "a.drv", "j", 1, 0);
    sched.make_runnable(s).unwrap();

    let grant = sched.resource_grant(&StepId::from("a.drv")).unwrap();
    assert_eq!(grant.rung.get(), 1);
    assert_eq!(grant.permitted_run_time, Duration::from_secs(30));
    assert_eq!(grant.desired_cores, 1);
}

#[test]
fn pops_highest_priority_first() {
    let sched = scheduler();
    sched.make_runnable(step_in(&sched, "low.drv", "j", 1, 1)).unwrap();
    sched.make_runnable(step_in(&sched, "high.drv", "j", 2, 9)).unwrap();

    let peeked = sched.peek_highest_priority().unwrap().unwrap();
    assert_eq!(peeked.id().as_str(), "high.drv");

    let first = sched.pop_highest_priority().unwrap().unwrap();
    assert_eq!(first.step.id().as_str(), "high.drv");
    assert_eq!(first.attempt, 1);
    let second = sched.pop_highest_priority().unwrap().unwrap();
    assert_eq!(second.step.id().as_str(), "low.drv");
    assert!(sched.pop_highest_priority().unwrap().is_none());
}

#[test]
fn dispatched_step_cannot_be_queued_again() {
    let sched = scheduler();
    let s = step_in(&sched, "a.drv", "j", 1, 0);
    sched.make_runnable(s.clone()).unwrap();
    sched.pop_highest_priority().unwrap().unwrap();

    let err = sched.make_runnable(s).unwrap_err();
    assert!(matches!(err, SchedulerError::AlreadyDispatched(_)));
    assert_eq!(sched.runnable_len().unwrap(), 0);
}

#[test]
fn three_timeouts_climb_three_rungs() {
    let sched = scheduler();
    let id = StepId::from("slow.drv");
    sched.make_runnable(step_in(&sched, "slow.drv", "j", 1, 0)).unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        let d = sched.pop_highest_priority().unwrap().unwrap();
        seen.push((d.grant.rung.get(), d.grant.permitted_run_time.as_secs(), d.grant.desired_cores));
        let verdict = sched
            .report_attempt(&id, report(AttemptOutcome::ResourceExhausted, d.grant.permitted_run_time.as_secs()))
            .unwrap();
        assert!(matches!(verdict, Verdict::Retry(_)));
    }
    let d = sched.pop_highest_priority().unwrap().unwrap();
    seen.push((d.grant.rung.get(), d.grant.permitted_run_time.as_secs(), d.grant.desired_cores));

    assert_eq!(
        seen,
        vec![(1, 30, 1), (2, 300, 4), (3, 3000, 9), (4, 30000, 16)]
    );
    assert_eq!(d.attempt, 4);
    assert_eq!(sched.metrics().rung_advances, 3);
}

#[test]
fn ceiling_turns_exhaustion_into_permanent_failure() {
    let config = SchedulerConfig {
        max_permitted_run_time_secs: 3000,
        ..SchedulerConfig::default()
    };
    let sched = StepScheduler::new(config);
    let id = StepId::from("huge.drv");
    sched.make_runnable(step_in(&sched, "huge.drv", "j", 1, 0)).unwrap();

    sched.pop_highest_priority().unwrap().unwrap();
    assert_eq!(sched.on_attempt_resource_exhausted(&id).unwrap().rung.get(), 2);
    sched.make_runnable(sched_step(&sched, &id)).unwrap();
    sched.pop_highest_priority().unwrap().unwrap();
    assert_eq!(sched.on_attempt_resource_exhausted(&id).unwrap().rung.get(), 3);
    sched.make_runnable(sched_step(&sched, &id)).unwrap();
    sched.pop_highest_priority().unwrap().unwrap();

    let err = sched.on_attempt_resource_exhausted(&id).unwrap_err();
    assert!(err.is_permanent_failure());
    match err {
        SchedulerError::RunTimeCeilingExceeded { rung, permitted_secs, ceiling_secs, .. } => {
            assert_eq!(rung, 4);
            assert_eq!(permitted_secs, 30000);
            assert_eq!(ceiling_secs, 3000);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(sched.step_status(&id).unwrap().is_none());
    assert_eq!(sched.metrics().permanent_failures, 1);
}

/// Rebuild the step handle a collaborator would hold.
fn sched_step(sched: &StepScheduler, id: &StepId) -> Arc<Step> {
    let js = sched.shares().register("j", None).unwrap();
    Arc::new(Step::with_builds(id.clone(), [Arc::new(Build::new(1, js))]))
}

#[test]
fn logical_failure_keeps_rung() {
    let sched = scheduler();
    let id = StepId::from("flaky.drv");
    let s = step_in(&sched, "flaky.drv", "j", 1, 0);
    sched.make_runnable(s.clone()).unwrap();

    sched.pop_highest_priority().unwrap().unwrap();
    sched.report_attempt(&id, report(AttemptOutcome::ResourceExhausted, 30)).unwrap();
    sched.pop_highest_priority().unwrap().unwrap();

    let verdict = sched.report_attempt(&id, report(AttemptOutcome::LogicalFailure, 5)).unwrap();
    assert_eq!(verdict, Verdict::Released);
    assert_eq!(sched.resource_grant(&id).unwrap().rung.get(), 2);

    let status = sched.step_status(&id).unwrap().unwrap();
    assert!(!status.runnable);
    assert!(!status.dispatched);
    assert_eq!(status.tries, 2);

    sched.make_runnable(s).unwrap();
    let d = sched.pop_highest_priority().unwrap().unwrap();
    assert_eq!(d.grant.rung.get(), 2);
    assert_eq!(d.attempt, 3);
}

#[test]
fn success_forgets_step() {
    let sched = scheduler();
    let id = StepId::from("ok.drv");
    sched.make_runnable(step_in(&sched, "ok.drv", "j", 1, 0)).unwrap();
    sched.pop_highest_priority().unwrap().unwrap();

    let verdict = sched.report_attempt(&id, report(AttemptOutcome::Success, 12)).unwrap();
    assert_eq!(verdict, Verdict::Finished);
    assert_eq!(sched.tracked_len().unwrap(), 0);
    assert!(matches!(
        sched.resource_grant(&id),
        Err(SchedulerError::StepNotTracked(_))
    ));
    assert_eq!(sched.metrics().steps_succeeded, 1);
}

#[test]
fn report_requires_attempt_in_flight() {
    let sched = scheduler();
    let id = StepId::from("q.drv");
    assert!(matches!(
        sched.report_attempt(&id, report(AttemptOutcome::Success, 1)),
        Err(SchedulerError::StepNotTracked(_))
    ));

    sched.make_runnable(step_in(&sched, "q.drv", "j", 1, 0)).unwrap();
    assert!(matches!(
        sched.report_attempt(&id, report(AttemptOutcome::Success, 1)),
        Err(SchedulerError::NotDispatched(_))
    ));
}

#[test]
fn exhaustion_needs_attempt_in_flight() {
    let sched = scheduler();
    let id = StepId::from("t.drv");
    sched.make_runnable(step_in(&sched, "t.drv", "j", 1, 0)).unwrap();

    // queued but never dispatched
    assert!(matches!(
        sched.on_attempt_resource_exhausted(&id),
        Err(SchedulerError::NotDispatched(_))
    ));
    assert_eq!(sched.resource_grant(&id).unwrap().rung.get(), 1);

    sched.pop_highest_priority().unwrap().unwrap();
    let verdict = sched
        .report_attempt(&id, report(AttemptOutcome::ResourceExhausted, 30))
        .unwrap();
    assert!(matches!(verdict, Verdict::Retry(_)));

    // a late second signal for the same timeout
    assert!(matches!(
        sched.on_attempt_resource_exhausted(&id),
        Err(SchedulerError::NotDispatched(_))
    ));
    let d = sched.pop_highest_priority().unwrap().unwrap();
    assert_eq!(d.grant.rung.get(), 2);
    assert_eq!(sched.metrics().rung_advances, 1);

    assert!(matches!(
        sched.on_attempt_resource_exhausted(&StepId::from("ghost.drv")),
        Err(SchedulerError::StepNotTracked(_))
    ));
}

#[test]
fn remove_discards_rung() {
    let sched = scheduler();
    let id = StepId::from("gone.drv");
    let s = step_in(&sched, "gone.drv", "j", 1, 0);
    sched.make_runnable(s.clone()).unwrap();
    sched.pop_highest_priority().unwrap().unwrap();
    sched.report_attempt(&id, report(AttemptOutcome::ResourceExhausted, 30)).unwrap();
    assert_eq!(sched.resource_grant(&id).unwrap().rung.get(), 2);

    assert!(sched.remove(&id).unwrap());
    assert!(!sched.remove(&id).unwrap());
    assert_eq!(sched.runnable_len().unwrap(), 0);

    sched.make_runnable(s).unwrap();
    assert_eq!(sched.resource_grant(&id).unwrap().rung.get(), 1);
    assert_eq!(sched.metrics().steps_removed, 1);
}

#[test]
fn notify_changed_resorts_step() {
    let sched = scheduler();
    let js = sched.shares().register("j", None).unwrap();
    let bumped = Arc::new(Build::new(50, js.clone()));
    sched
        .make_runnable(Arc::new(Step::with_builds("old.drv", [Arc::new(Build::new(1, js))])))
        .unwrap();
    sched
        .make_runnable(Arc::new(Step::with_builds("bumped.drv", [bumped.clone()])))
        .unwrap();
    assert_eq!(sched.peek_highest_priority().unwrap().unwrap().id().as_str(), "old.drv");

    bumped.set_global_priority(100);
    let info = sched.notify_changed(&StepId::from("bumped.drv")).unwrap().unwrap();
    assert_eq!(info.highest_global_priority, 100);
    assert_eq!(sched.peek_highest_priority().unwrap().unwrap().id().as_str(), "bumped.drv");

    assert!(matches!(
        sched.notify_changed(&StepId::from("unknown.drv")),
        Err(SchedulerError::StepNotTracked(_))
    ));
}

#[test]
fn finished_attempts_shift_fairness() {
    let sched = scheduler();
    sched.make_runnable(step_in(&sched, "a1.drv", "alpha", 1, 0)).unwrap();
    sched.make_runnable(step_in(&sched, "b1.drv", "beta", 2, 0)).unwrap();
    sched.make_runnable(step_in(&sched, "a2.drv", "alpha", 3, 0)).unwrap();

    // all shares zero: oldest build wins
    let d = sched.pop_highest_priority().unwrap().unwrap();
    assert_eq!(d.step.id().as_str(), "a1.drv");
    sched
        .report_attempt(d.step.id(), report(AttemptOutcome::Success, 600))
        .unwrap();

    // alpha has now used share; a2 is stale until refreshed
    assert_eq!(sched.peek_highest_priority().unwrap().unwrap().id().as_str(), "b1.drv");
    assert_eq!(sched.refresh_all().unwrap(), 2);
    assert_eq!(sched.peek_highest_priority().unwrap().unwrap().id().as_str(), "b1.drv");

    let order: Vec<String> = sched
        .runnable_steps()
        .unwrap()
        .into_iter()
        .map(|s| s.step_id.to_string())
        .collect();
    assert_eq!(order, vec!["b1.drv", "a2.drv"]);
    assert!(sched.shares().snapshot()["alpha"] > 0.0);
}

#[test]
fn refresh_shares_releases_old_charges() {
    let config = SchedulerConfig {
        scheduling_window_secs: 60,
        ..SchedulerConfig::default()
    };
    let sched = StepScheduler::new(config);
    let busy = sched.shares().register("busy", Some(1)).unwrap();
    busy.add_step(Utc::now() - chrono::Duration::seconds(600), Duration::from_secs(1000));

    sched.make_runnable(step_in(&sched, "x.drv", "busy", 1, 0)).unwrap();
    sched.make_runnable(step_in(&sched, "y.drv", "idle", 2, 0)).unwrap();
    assert_eq!(sched.peek_highest_priority().unwrap().unwrap().id().as_str(), "y.drv");

    sched.refresh_shares(Utc::now()).unwrap();
    assert_eq!(busy.seconds(), 0);
    assert_eq!(sched.peek_highest_priority().unwrap().unwrap().id().as_str(), "x.drv");
}

#[test]
fn gauges_track_queue() {
    let sched = scheduler();
    sched.make_runnable(step_in(&sched, "a.drv", "j", 1, 0)).unwrap();
    sched.make_runnable(step_in(&sched, "b.drv", "j", 2, 0)).unwrap();
    sched.pop_highest_priority().unwrap().unwrap();

    let m = sched.metrics();
    assert_eq!(m.runnable_steps, 1);
    assert_eq!(m.dispatched_steps, 1);
    assert_eq!(m.steps_by_rung[&1], 2);
    assert_eq!(m.steps_dispatched, 1);
}

#[test]
fn concurrent_pops_never_share_a_step() {
    let sched = Arc::new(scheduler());
    for i in 0..200u64 {
        let s = step_in(&sched, &format!("s{i}.drv"), "j", i, (i % 7) as i32);
        sched.make_runnable(s).unwrap();
    }

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let sched = Arc::clone(&sched);
            std::thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(d) = sched.pop_highest_priority().unwrap() {
                    got.push(d.step.id().clone());
                }
                got
            })
        })
        .collect();

    let mut all = HashSet::new();
    let mut total = 0;
    for h in handles {
        for id in h.join().unwrap() {
            total += 1;
            all.insert(id);
        }
    }
    assert_eq!(total, 200);
    assert_eq!(all.len(), 200);
}

#[tokio::test]
async fn next_dispatch_waits_for_work() {
    let sched = Arc::new(scheduler());
    let waiter = {
        let sched = Arc::clone(&sched);
        tokio::spawn(async move { sched.next_dispatch().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    sched.make_runnable(step_in(&sched, "late.drv", "j", 1, 0)).unwrap();

    let dispatch = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("dispatch loop never woke")
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(dispatch.step.id().as_str(), "late.drv");
}

#[tokio::test]
async fn shutdown_releases_waiters() {
    let sched = Arc::new(scheduler());
    let waiter = {
        let sched = Arc::clone(&sched);
        tokio::spawn(async move { sched.next_dispatch().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    sched.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter not released")
        .unwrap()
        .unwrap();
    assert!(result.is_none());
}
