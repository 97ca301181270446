use std::sync::Arc;
use std::time::Duration;

use cluster_sim::events::{ClusterEvent, MemorySink};
use cluster_sim::recovery::RecoveryOutcome;
use cluster_sim::scheduler::{FailureReason, JobPriority, JobSpec, JobStatus};
use cluster_sim::worker::WorkerHealth;
use cluster_sim::{Cluster, SimConfig};

const WORKER: &str = "gpu-node-01";

/// One worker that never crashes and never loses a heartbeat, with the
/// generator off so tests control every job.
fn single_worker_config() -> SimConfig {
    SimConfig::empty()
        .with_worker(WORKER, 0.0)
        .with_auto_generate(false)
        .with_heartbeat_drop_probability(0.0)
        .with_seed(42)
}

fn build(config: SimConfig) -> (Cluster, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let cluster = Cluster::builder(config)
        .sink(sink.clone())
        .build()
        .expect("valid config");
    (cluster, sink)
}

async fn stop(cluster: &Cluster, handles: Vec<tokio::task::JoinHandle<()>>) {
    cluster.shutdown();
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_single_job_completes_on_first_attempt() {
    let (cluster, sink) = build(single_worker_config());
    let handles = cluster.start();

    let job_id = cluster
        .submit(JobSpec::sleep(Duration::from_secs(5), JobPriority::Normal))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;

    let job = cluster.job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert!(job.failures.is_empty());
    assert!(job.assigned_worker.is_none());

    let completed = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, ClusterEvent::JobCompleted { .. }))
        .count();
    assert_eq!(completed, 1);

    let stats = cluster.stats().await;
    assert_eq!(stats.completed_jobs, 1);
    assert!(stats.avg_latency_ms.unwrap() >= 5_000);

    stop(&cluster, handles).await;
}

#[tokio::test(start_paused = true)]
async fn test_worker_failure_requeues_running_job() {
    let config = single_worker_config()
        .with_recovery_delay(Duration::from_secs(5), Duration::from_secs(5));
    let (cluster, _sink) = build(config);
    let handles = cluster.start();

    let job_id = cluster
        .submit(JobSpec::sleep(Duration::from_secs(30), JobPriority::High))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let job = cluster.job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.assigned_worker.as_deref(), Some(WORKER));

    let outcome = cluster.fail_worker(WORKER).await.unwrap();
    assert_eq!(outcome, Some(RecoveryOutcome::Requeued { attempt: 2 }));

    let job = cluster.job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 2);
    assert!(job.assigned_worker.is_none());
    assert_eq!(job.failures.len(), 1);
    assert_eq!(job.failures[0].reason, FailureReason::WorkerCrashed);
    assert_eq!(job.failures[0].worker_id.as_deref(), Some(WORKER));

    {
        let state = cluster.state();
        let state = state.read().await;
        let worker = state.workers().get(WORKER).unwrap();
        assert_eq!(worker.health, WorkerHealth::Failed);
        assert!(worker.current_job.is_none());
        state.check_invariants().unwrap();
    }

    // Recovery after 5s, then the job runs its full 30s again.
    tokio::time::sleep(Duration::from_secs(60)).await;

    let job = cluster.job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);

    let stats = cluster.stats().await;
    assert_eq!(stats.worker_failures, 1);
    assert_eq!(stats.worker_recoveries, 1);
    assert_eq!(stats.failures.worker_crashed, 1);

    stop(&cluster, handles).await;
}

#[tokio::test(start_paused = true)]
async fn test_job_failing_every_attempt_is_abandoned() {
    let config = single_worker_config().with_retry_limit(3);
    let (cluster, sink) = build(config);
    let handles = cluster.start();

    let job_id = cluster
        .submit(JobSpec::fault_injection(
            1.0,
            Duration::from_secs(10),
            JobPriority::Normal,
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;

    let job = cluster.job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Abandoned);
    assert_eq!(job.failures.len(), 3);
    assert!(job
        .failures
        .iter()
        .all(|f| matches!(f.reason, FailureReason::ExecutionError(_))));
    assert!(job.error.unwrap().contains("retry limit"));

    let events = sink.events();
    let assigned = events
        .iter()
        .filter(|e| matches!(e, ClusterEvent::JobAssigned { .. }))
        .count();
    let requeued = events
        .iter()
        .filter(|e| matches!(e, ClusterEvent::JobRequeued { .. }))
        .count();
    let abandoned = events
        .iter()
        .filter(|e| matches!(e, ClusterEvent::JobAbandoned { .. }))
        .count();
    assert_eq!(assigned, 3);
    assert_eq!(requeued, 2);
    assert_eq!(abandoned, 1);

    let snapshot = cluster.snapshot().await;
    assert!(snapshot.queue.is_empty());
    assert_eq!(snapshot.stats.abandoned_jobs, 1);

    stop(&cluster, handles).await;
}

#[tokio::test(start_paused = true)]
async fn test_job_past_deadline_fails_with_timeout() {
    let config = single_worker_config().with_job_timeout(Duration::from_secs(5 * 60));
    let (cluster, _sink) = build(config);
    let handles = cluster.start();

    let job_id = cluster
        .submit(JobSpec::sleep(Duration::from_secs(10 * 60), JobPriority::Normal))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5 * 60 - 1)).await;
    let job = cluster.job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.failures.is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let job = cluster.job(&job_id).await.unwrap();
    assert_eq!(job.failures.len(), 1);
    assert_eq!(job.failures[0].reason, FailureReason::Timeout);
    assert_ne!(job.failures[0].reason, FailureReason::WorkerCrashed);
    assert_eq!(job.attempts, 2);

    // A timeout is the job's fault, not the worker's.
    let stats = cluster.stats().await;
    assert_eq!(stats.failures.timeout, 1);
    assert_eq!(stats.worker_failures, 0);
    assert_eq!(stats.healthy_workers, 1);

    stop(&cluster, handles).await;
}

#[tokio::test(start_paused = true)]
async fn test_job_moves_to_surviving_worker() {
    let config = single_worker_config().with_worker("gpu-node-02", 0.0);
    let (cluster, _sink) = build(config);
    let handles = cluster.start();

    let job_id = cluster
        .submit(JobSpec::sleep(Duration::from_secs(20), JobPriority::Normal))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let first = cluster
        .job(&job_id)
        .await
        .unwrap()
        .assigned_worker
        .unwrap();
    cluster.fail_worker(&first).await.unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let job = cluster.job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    let second = job.assigned_worker.unwrap();
    assert_ne!(first, second);

    tokio::time::sleep(Duration::from_secs(30)).await;
    let job = cluster.job(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    stop(&cluster, handles).await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_an_already_failed_worker_is_a_no_op() {
    let (cluster, _sink) = build(single_worker_config());

    assert_eq!(cluster.fail_worker(WORKER).await.unwrap(), None);
    assert_eq!(cluster.fail_worker(WORKER).await.unwrap(), None);

    let stats = cluster.stats().await;
    assert_eq!(stats.worker_failures, 1);
    assert_eq!(stats.failed_workers, 1);
}
