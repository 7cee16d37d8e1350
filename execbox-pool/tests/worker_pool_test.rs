use core::sync::atomic::Ordering;
use core::time::Duration;
use std::sync::Arc;

use bytes::Bytes;
use execbox_error::{Code, Error, make_err};
use execbox_macro::execbox_test;
use execbox_pool::testing::{MemoryOrchestrator, ready_pod};
use execbox_pool::{
    CLAIMED_LABEL, OrchestratorClient, PoolSpec, WorkerPool, is_command_failure,
};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::time;

fn pool_spec(name: &str, size: i32) -> PoolSpec {
    PoolSpec {
        name: name.to_string(),
        namespace: "execbox-test".to_string(),
        image: "debian:bookworm".to_string(),
        size,
        sandboxed: false,
        cpu: None,
        memory_mib: None,
    }
}

async fn start_pool(
    orchestrator: &Arc<MemoryOrchestrator>,
    name: &str,
    size: i32,
) -> Result<Arc<WorkerPool>, Error> {
    let client: Arc<dyn OrchestratorClient> = Arc::<MemoryOrchestrator>::clone(orchestrator);
    let pool = WorkerPool::new(client, pool_spec(name, size));
    pool.start().await?;
    Ok(pool)
}

async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if predicate() {
            return;
        }
        time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[execbox_test(start_paused = true)]
async fn acquire_claims_worker_and_clears_owner_references() -> Result<(), Error> {
    let orchestrator = MemoryOrchestrator::manual();
    let pool = start_pool(&orchestrator, "worker", 1).await?;

    let mut pod = ready_pod("worker", "worker-1");
    pod.metadata.owner_references = Some(vec![Default::default()]);
    orchestrator.push_pod(pod);

    let worker = pool.acquire().await?;
    assert_eq!(worker.name(), "worker-1");

    let updated = orchestrator.updated_pods();
    assert_eq!(updated.len(), 1);
    let labels = updated[0].metadata.labels.clone().unwrap_or_default();
    assert_eq!(labels.get(CLAIMED_LABEL).map(String::as_str), Some("true"));
    assert_eq!(updated[0].metadata.owner_references, None);

    pool.release(worker).await?;
    assert_eq!(orchestrator.deleted_pods(), vec!["worker-1".to_string()]);
    Ok(())
}

#[execbox_test(start_paused = true)]
async fn released_worker_never_reappears() -> Result<(), Error> {
    let orchestrator = MemoryOrchestrator::manual();
    let pool = start_pool(&orchestrator, "worker", 1).await?;

    orchestrator.push_pod(ready_pod("worker", "worker-1"));
    let worker = pool.acquire().await?;
    assert_eq!(worker.name(), "worker-1");
    pool.release(worker).await?;

    orchestrator.push_pod(ready_pod("worker", "worker-2"));
    let worker = pool.acquire().await?;
    assert_eq!(worker.name(), "worker-2");
    pool.release(worker).await?;

    assert_eq!(
        orchestrator.deleted_pods(),
        vec!["worker-1".to_string(), "worker-2".to_string()]
    );
    Ok(())
}

#[execbox_test(start_paused = true)]
async fn ready_workers_pop_in_admission_order() -> Result<(), Error> {
    let orchestrator = MemoryOrchestrator::manual();
    let pool = start_pool(&orchestrator, "worker", 2).await?;

    orchestrator.push_pod(ready_pod("worker", "worker-1"));
    wait_until(|| pool.ready_count() == 1).await;
    orchestrator.push_pod(ready_pod("worker", "worker-2"));
    wait_until(|| pool.ready_count() == 2).await;

    let first = pool.acquire().await?;
    let second = pool.acquire().await?;
    assert_eq!(first.name(), "worker-1");
    assert_eq!(second.name(), "worker-2");

    pool.release(first).await?;
    pool.release(second).await?;
    Ok(())
}

#[execbox_test(start_paused = true)]
async fn waiters_are_served_in_fifo_order() -> Result<(), Error> {
    let orchestrator = MemoryOrchestrator::manual();
    let pool = start_pool(&orchestrator, "worker", 3).await?;
    let (tx, mut rx) = mpsc::unbounded_channel();

    for index in 0_usize..3 {
        let pool_for_task = Arc::clone(&pool);
        let tx = tx.clone();
        tokio::spawn(async move {
            let worker = pool_for_task.acquire().await.expect("acquire must succeed");
            let name = worker.name().to_string();
            pool_for_task
                .release(worker)
                .await
                .expect("release must succeed");
            tx.send((index, name)).expect("result channel closed");
        });
        wait_until(|| pool.waiter_count() == index + 1).await;
    }

    for index in 0..3 {
        orchestrator.push_pod(ready_pod("worker", &format!("worker-{index}")));
    }

    let mut results = Vec::new();
    for _ in 0..3 {
        results.push(rx.recv().await.expect("missing result"));
    }
    results.sort_by_key(|(index, _)| *index);
    assert_eq!(
        results,
        vec![
            (0, "worker-0".to_string()),
            (1, "worker-1".to_string()),
            (2, "worker-2".to_string()),
        ]
    );
    Ok(())
}

#[execbox_test(start_paused = true)]
async fn duplicate_events_admit_once() -> Result<(), Error> {
    let orchestrator = MemoryOrchestrator::manual();
    let pool = start_pool(&orchestrator, "worker", 1).await?;

    for _ in 0..3 {
        orchestrator.push_pod(ready_pod("worker", "worker-1"));
    }
    wait_until(|| pool.ready_count() == 1).await;

    let worker = pool.acquire().await?;
    assert_eq!(worker.name(), "worker-1");
    assert_eq!(pool.ready_count(), 0);
    assert!(
        time::timeout(Duration::from_millis(50), pool.acquire())
            .await
            .is_err()
    );

    pool.release(worker).await?;
    Ok(())
}

#[execbox_test(start_paused = true)]
async fn cancelled_acquire_deregisters_waiter() -> Result<(), Error> {
    let orchestrator = MemoryOrchestrator::manual();
    let pool = start_pool(&orchestrator, "worker", 1).await?;

    let result = time::timeout(Duration::from_millis(50), pool.acquire()).await;
    assert!(result.is_err());
    assert_eq!(pool.waiter_count(), 0);

    // A later worker is still claimable.
    orchestrator.push_pod(ready_pod("worker", "worker-1"));
    let worker = pool.acquire().await?;
    assert_eq!(worker.name(), "worker-1");
    pool.release(worker).await?;
    Ok(())
}

#[execbox_test(start_paused = true)]
async fn watch_stream_reconnects_without_duplicates() -> Result<(), Error> {
    let orchestrator = MemoryOrchestrator::manual();
    let pool = start_pool(&orchestrator, "worker", 1).await?;

    orchestrator.push_pod(ready_pod("worker", "worker-1"));
    wait_until(|| pool.ready_count() == 1).await;
    assert_eq!(orchestrator.watch_connects(), 1);

    orchestrator.disconnect_watchers();
    wait_until(|| orchestrator.watch_connects() >= 2).await;

    // The relist on reconnect resends worker-1; it must not be admitted twice.
    assert_eq!(pool.ready_count(), 1);
    let worker = pool.acquire().await?;
    assert_eq!(worker.name(), "worker-1");
    assert!(
        time::timeout(Duration::from_millis(50), pool.acquire())
            .await
            .is_err()
    );

    pool.release(worker).await?;
    Ok(())
}

#[execbox_test(start_paused = true)]
async fn watch_error_does_not_break_the_loop() -> Result<(), Error> {
    let orchestrator = MemoryOrchestrator::manual();
    let pool = start_pool(&orchestrator, "worker", 1).await?;

    orchestrator.inject_watch_error(make_err!(Code::Unavailable, "watch blip"));
    orchestrator.push_pod(ready_pod("worker", "worker-1"));

    let worker = pool.acquire().await?;
    assert_eq!(worker.name(), "worker-1");
    pool.release(worker).await?;
    Ok(())
}

#[execbox_test(start_paused = true)]
async fn claim_conflict_abandons_worker() -> Result<(), Error> {
    let orchestrator = MemoryOrchestrator::manual();
    let pool = start_pool(&orchestrator, "worker", 1).await?;

    orchestrator.push_pod(ready_pod("worker", "worker-1"));
    wait_until(|| pool.ready_count() == 1).await;
    orchestrator.fail_next_update(make_err!(Code::Aborted, "operation cannot be fulfilled"));

    let acquire = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.acquire().await }
    });
    wait_until(|| pool.waiter_count() == 1).await;
    // The conflicted worker was abandoned, not requeued.
    assert_eq!(pool.ready_count(), 0);

    orchestrator.push_pod(ready_pod("worker", "worker-2"));
    let worker = acquire.await.expect("acquire task panicked")?;
    assert_eq!(worker.name(), "worker-2");
    assert_eq!(pool.metrics().claim_conflicts.load(Ordering::Relaxed), 1);

    // Replaying the conflicted pod's ready event does not resurrect it.
    orchestrator.push_pod(ready_pod("worker", "worker-1"));
    assert!(
        time::timeout(Duration::from_millis(50), pool.acquire())
            .await
            .is_err()
    );

    pool.release(worker).await?;
    Ok(())
}

#[execbox_test(start_paused = true)]
async fn readiness_regression_removes_then_readmits() -> Result<(), Error> {
    let orchestrator = MemoryOrchestrator::manual();
    let pool = start_pool(&orchestrator, "worker", 1).await?;

    orchestrator.push_pod(ready_pod("worker", "worker-1"));
    wait_until(|| pool.ready_count() == 1).await;

    let mut pending = ready_pod("worker", "worker-1");
    pending
        .status
        .as_mut()
        .expect("ready_pod always has a status")
        .phase = Some("Pending".to_string());
    orchestrator.push_pod(pending);
    wait_until(|| pool.ready_count() == 0).await;

    orchestrator.push_pod(ready_pod("worker", "worker-1"));
    wait_until(|| pool.ready_count() == 1).await;

    let worker = pool.acquire().await?;
    assert_eq!(worker.name(), "worker-1");
    pool.release(worker).await?;
    Ok(())
}

#[execbox_test(start_paused = true)]
async fn release_failure_is_reported() -> Result<(), Error> {
    let orchestrator = MemoryOrchestrator::manual();
    let pool = start_pool(&orchestrator, "worker", 1).await?;

    orchestrator.push_pod(ready_pod("worker", "worker-1"));
    let worker = pool.acquire().await?;

    // The pod disappears underneath us before release gets to it.
    orchestrator.remove_pod("worker-1");
    let err = pool.release(worker).await.unwrap_err();
    assert_eq!(err.code, Code::NotFound);
    Ok(())
}

#[execbox_test(start_paused = true)]
async fn deployment_provisions_and_replaces_replicas() -> Result<(), Error> {
    let orchestrator = MemoryOrchestrator::new();
    let pool = start_pool(&orchestrator, "worker", 3).await?;
    wait_until(|| pool.ready_count() == 3).await;
    assert_eq!(orchestrator.unclaimed_pods("worker"), 3);

    let worker = pool.acquire().await?;
    // The replica controller backfills the claimed worker.
    wait_until(|| pool.ready_count() == 3).await;
    assert_eq!(orchestrator.unclaimed_pods("worker"), 3);

    pool.release(worker).await?;
    assert_eq!(orchestrator.unclaimed_pods("worker"), 3);
    Ok(())
}

#[execbox_test(start_paused = true)]
async fn write_and_read_files_through_exec() -> Result<(), Error> {
    let orchestrator = MemoryOrchestrator::manual();
    let pool = start_pool(&orchestrator, "worker", 1).await?;

    orchestrator.push_pod(ready_pod("worker", "worker-1"));
    let worker = pool.acquire().await?;

    pool.write_file(&worker, "/app/main.go", Bytes::from_static(b"package main"))
        .await?;
    assert_eq!(
        orchestrator.file("worker-1", "/app/main.go"),
        Some(Bytes::from_static(b"package main"))
    );

    let content = pool.read_file(&worker, "/app/main.go").await?;
    assert_eq!(content, Bytes::from_static(b"package main"));

    // A missing file surfaces the remote stderr.
    let err = pool.read_file(&worker, "/missing").await.unwrap_err();
    assert!(is_command_failure(&err));

    pool.release(worker).await?;
    Ok(())
}

#[execbox_test]
async fn start_twice_fails() -> Result<(), Error> {
    let orchestrator = MemoryOrchestrator::manual();
    let pool = start_pool(&orchestrator, "worker", 1).await?;

    let err = pool.start().await.unwrap_err();
    assert_eq!(err.code, Code::FailedPrecondition);
    Ok(())
}
