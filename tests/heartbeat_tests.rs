use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use cluster_sim::config::SimConfig;
use cluster_sim::events::{ClusterEvent, MemorySink};
use cluster_sim::recovery::{FaultRecovery, RecoveryOutcome};
use cluster_sim::rng::SimRng;
use cluster_sim::scheduler::{FailureReason, JobPriority, JobSpec, JobStatus};
use cluster_sim::state::ClusterState;
use cluster_sim::worker::registry::HeartbeatOutcome;
use cluster_sim::worker::{HeartbeatMonitor, WorkerHealth};

fn test_config() -> SimConfig {
    SimConfig::empty()
        .with_heartbeat_drop_probability(0.0)
        .with_recovery_delay(Duration::from_secs(20), Duration::from_secs(20))
}

fn test_state(config: &SimConfig, workers: &[(&str, f64)], now: Instant) -> (ClusterState, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let mut state = ClusterState::new(config, SimRng::seeded(7), sink.clone());
    for (id, rate) in workers {
        state.add_worker(id, *rate, now).unwrap();
    }
    (state, sink)
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_heartbeat_is_idempotent() {
    let config = test_config();
    let t0 = Instant::now();
    let (mut state, _sink) = test_state(&config, &[("w1", 0.0)], t0);

    let t1 = t0 + Duration::from_secs(2);
    assert_eq!(state.heartbeat("w1", t1).unwrap(), HeartbeatOutcome::Accepted);
    assert_eq!(state.heartbeat("w1", t1).unwrap(), HeartbeatOutcome::Stale);
    // An older heartbeat arriving late does not move liveness backwards.
    assert_eq!(state.heartbeat("w1", t0).unwrap(), HeartbeatOutcome::Stale);

    let worker = state.workers().get("w1").unwrap();
    assert_eq!(worker.last_heartbeat, t1);
    assert_eq!(worker.health, WorkerHealth::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_does_not_undo_failure() {
    let config = test_config();
    let t0 = Instant::now();
    let (mut state, _sink) = test_state(&config, &[("w1", 0.0)], t0);

    state
        .fail_worker("w1", FailureReason::HeartbeatLost, t0)
        .unwrap();

    let later = t0 + Duration::from_secs(1);
    assert_eq!(state.heartbeat("w1", later).unwrap(), HeartbeatOutcome::Ignored);
    assert_eq!(state.heartbeat("w1", later).unwrap(), HeartbeatOutcome::Ignored);

    let worker = state.workers().get("w1").unwrap();
    assert_eq!(worker.health, WorkerHealth::Failed);
    assert_eq!(worker.failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_for_unknown_worker_is_rejected() {
    let config = test_config();
    let (mut state, _sink) = test_state(&config, &[], Instant::now());
    assert!(state.heartbeat("ghost", Instant::now()).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_missed_heartbeat_marks_suspect_then_revives() {
    let config = test_config();
    let t0 = Instant::now();
    let (mut state, sink) = test_state(&config, &[("w1", 0.0)], t0);
    let monitor = HeartbeatMonitor::new(&config, SimRng::seeded(1));

    state.set_heartbeats_muted("w1", true).unwrap();
    let tickets = monitor.tick(&mut state, t0 + Duration::from_secs(2));
    assert!(tickets.is_empty());
    assert_eq!(
        state.workers().get("w1").unwrap().health,
        WorkerHealth::Suspect
    );
    // A Suspect worker takes no new work.
    assert!(state.workers().available().is_empty());

    state.set_heartbeats_muted("w1", false).unwrap();
    monitor.tick(&mut state, t0 + Duration::from_secs(4));
    assert_eq!(
        state.workers().get("w1").unwrap().health,
        WorkerHealth::Healthy
    );

    let events = sink.events();
    assert!(events.contains(&ClusterEvent::WorkerSuspect {
        worker_id: "w1".to_string()
    }));
    assert!(events.contains(&ClusterEvent::WorkerHealthy {
        worker_id: "w1".to_string()
    }));
}

#[tokio::test(start_paused = true)]
async fn test_silent_worker_fails_and_releases_its_job() {
    let config = test_config();
    let t0 = Instant::now();
    let (mut state, _sink) = test_state(&config, &[("w1", 0.0)], t0);
    let monitor = HeartbeatMonitor::new(&config, SimRng::seeded(1));

    let job_id = state
        .submit(JobSpec::sleep(Duration::from_secs(60), JobPriority::Normal), t0)
        .unwrap();
    state.dequeue().unwrap();
    let assignment = state.assign(&job_id, "w1", t0).unwrap();

    state.set_heartbeats_muted("w1", true).unwrap();
    let tickets = monitor.tick(&mut state, t0 + Duration::from_secs(11));
    assert_eq!(tickets.len(), 1);
    assert!(assignment.cancel.is_cancelled());

    let worker = state.workers().get("w1").unwrap();
    assert_eq!(worker.health, WorkerHealth::Failed);
    assert_eq!(worker.last_failure, Some(FailureReason::HeartbeatLost));
    assert!(worker.current_job.is_none());

    let job = state.job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failures[0].reason, FailureReason::HeartbeatLost);
    state.check_invariants().unwrap();

    let recovery = FaultRecovery::new(&config);
    let now = t0 + Duration::from_secs(11);
    assert_eq!(
        recovery.recover(&mut state, &tickets[0], now).unwrap(),
        RecoveryOutcome::Requeued { attempt: 2 }
    );
    // A duplicate ticket for the same failure is ignored.
    assert_eq!(
        recovery.recover(&mut state, &tickets[0], now).unwrap(),
        RecoveryOutcome::AlreadyHandled
    );
    assert_eq!(state.queue().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_worker_recovers_after_delay() {
    let config = test_config();
    let t0 = Instant::now();
    let (mut state, _sink) = test_state(&config, &[("w1", 0.0)], t0);
    let monitor = HeartbeatMonitor::new(&config, SimRng::seeded(1));

    state
        .fail_worker("w1", FailureReason::WorkerCrashed, t0)
        .unwrap();

    monitor.tick(&mut state, t0 + Duration::from_secs(19));
    assert_eq!(
        state.workers().get("w1").unwrap().health,
        WorkerHealth::Failed
    );
    assert!(state
        .workers()
        .due_for_recovery(t0 + Duration::from_secs(19))
        .is_empty());
    assert_eq!(
        state.workers().due_for_recovery(t0 + Duration::from_secs(20)),
        vec!["w1".to_string()]
    );

    monitor.tick(&mut state, t0 + Duration::from_secs(20));
    let worker = state.workers().get("w1").unwrap();
    assert_eq!(worker.health, WorkerHealth::Healthy);
    assert_eq!(worker.recovery_count, 1);
    assert!(worker.recover_at.is_none());
    assert!(worker.is_available());
    assert_eq!(state.ledger().worker_recoveries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_recovered_worker_is_not_immediately_timed_out() {
    let config = test_config();
    let t0 = Instant::now();
    let (mut state, _sink) = test_state(&config, &[("w1", 0.0)], t0);
    let monitor = HeartbeatMonitor::new(&config, SimRng::seeded(1));

    state
        .fail_worker("w1", FailureReason::WorkerCrashed, t0)
        .unwrap();
    monitor.tick(&mut state, t0 + Duration::from_secs(20));
    monitor.tick(&mut state, t0 + Duration::from_secs(22));

    assert_eq!(
        state.workers().get("w1").unwrap().health,
        WorkerHealth::Healthy
    );
    assert_eq!(state.workers().get("w1").unwrap().failure_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_certain_crash_rate_fails_worker() {
    let mut config = test_config();
    config.heartbeat_interval_ms = 60_000;
    config.heartbeat_timeout_ms = 120_000;
    let t0 = Instant::now();
    let (mut state, _sink) = test_state(&config, &[("w1", 1.0), ("w2", 0.0)], t0);
    let monitor = HeartbeatMonitor::new(&config, SimRng::seeded(1));

    monitor.tick(&mut state, t0 + Duration::from_secs(60));

    let w1 = state.workers().get("w1").unwrap();
    assert_eq!(w1.health, WorkerHealth::Failed);
    assert_eq!(w1.last_failure, Some(FailureReason::WorkerCrashed));
    assert_eq!(
        state.workers().get("w2").unwrap().health,
        WorkerHealth::Healthy
    );
}

#[test]
fn test_crash_probability_scales_with_interval() {
    let config = test_config();
    let monitor = HeartbeatMonitor::new(&config, SimRng::seeded(1));

    assert!((monitor.crash_probability(0.6) - 0.02).abs() < 1e-12);
    assert_eq!(monitor.crash_probability(0.0), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_failure_leaves_random_stream_untouched() {
    let config = SimConfig::empty().with_heartbeat_drop_probability(0.0);
    let t0 = Instant::now();

    let draw_after = |failures: usize| {
        let rng = SimRng::seeded(7);
        let mut state = ClusterState::new(&config, rng.clone(), Arc::new(MemorySink::new()));
        state.add_worker("w1", 0.0, t0).unwrap();
        for _ in 0..failures {
            state
                .fail_worker("w1", FailureReason::WorkerCrashed, t0)
                .unwrap();
        }
        let recover_at = state.workers().get("w1").unwrap().recover_at;
        (recover_at, rng.range_u64(0, u64::MAX))
    };

    // Failing an already Failed worker draws nothing.
    assert_eq!(draw_after(1), draw_after(3));
}

#[tokio::test(start_paused = true)]
async fn test_monitor_recovers_every_due_worker_in_one_pass() {
    let config = test_config();
    let t0 = Instant::now();
    let (mut state, sink) = test_state(&config, &[("w1", 0.0), ("w2", 0.0), ("w3", 0.0)], t0);
    let monitor = HeartbeatMonitor::new(&config, SimRng::seeded(1));

    state
        .fail_worker("w1", FailureReason::WorkerCrashed, t0)
        .unwrap();
    state
        .fail_worker("w3", FailureReason::WorkerCrashed, t0)
        .unwrap();

    monitor.tick(&mut state, t0 + Duration::from_secs(20));

    for id in ["w1", "w2", "w3"] {
        assert_eq!(
            state.workers().get(id).unwrap().health,
            WorkerHealth::Healthy,
            "{}",
            id
        );
    }
    assert!(state.workers().due_for_recovery(t0 + Duration::from_secs(20)).is_empty());
    let recovered = sink
        .events()
        .iter()
        .filter(|e| matches!(e, ClusterEvent::WorkerRecovered { .. }))
        .count();
    assert_eq!(recovered, 2);
}
