use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use execbox_error::{Code, Error, ResultExt, make_err};
use execbox_util::background_spawn;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::client::{OrchestratorClient, PodEvent};
use crate::config::PoolSpec;
use crate::deployment::{CLAIMED_LABEL, watch_selector};
use crate::worker::{Worker, is_pod_ready};

/// Delay before re-establishing a failed or terminated pod watch.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Running counters for one pool.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    /// Number of workers successfully claimed over the pool's lifetime.
    pub claimed_workers: AtomicU64,

    /// Number of claim attempts abandoned because of an update conflict.
    pub claim_conflicts: AtomicU64,

    /// Number of workers destroyed through release.
    pub released_workers: AtomicU64,
}

/// One pending acquisition. Single-consumer delivery slot; the receiving side
/// deregisters itself when the acquirer gives up.
struct Waiter {
    id: u64,
    slot: oneshot::Sender<Worker>,
}

#[derive(Default)]
struct PoolState {
    /// Ready, unclaimed workers keyed by pod name.
    pods: HashMap<String, Pod>,
    /// Names in `pods`, in admission order.
    ready_queue: VecDeque<String>,
    /// Every pod name currently owned by the pool or handed out. Guards
    /// against duplicate watch events re-admitting a worker, including during
    /// the window between handoff and the claim landing.
    admitted: HashSet<String>,
    /// FIFO queue of pending acquisitions.
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

/// A pool of interchangeable single-use worker pods backed by a declarative
/// deployment.
///
/// [`WorkerPool::start`] declares the deployment and begins watching for
/// ready pods. [`WorkerPool::acquire`] transfers exclusive ownership of one
/// worker to the caller; [`WorkerPool::release`] destroys it. Workers are
/// never reused: the deployment controller replaces every claimed or deleted
/// pod with a fresh replica.
pub struct WorkerPool {
    spec: PoolSpec,
    selector: String,
    client: Arc<dyn OrchestratorClient>,
    state: Mutex<PoolState>,
    metrics: PoolMetrics,
    started: AtomicBool,
}

impl WorkerPool {
    pub fn new(client: Arc<dyn OrchestratorClient>, spec: PoolSpec) -> Arc<Self> {
        Arc::new(Self {
            selector: watch_selector(&spec.name),
            spec,
            client,
            state: Mutex::new(PoolState::default()),
            metrics: PoolMetrics::default(),
            started: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn spec(&self) -> &PoolSpec {
        &self.spec
    }

    #[must_use]
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Number of ready, unclaimed workers currently held.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.state.lock().ready_queue.len()
    }

    /// Number of acquirers parked waiting for a worker.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Begins the reconciliation loop and ensures the deployment exists. Must
    /// be called once before any [`WorkerPool::acquire`] can complete.
    pub async fn start(self: &Arc<Self>) -> Result<(), Error> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(make_err!(
                Code::FailedPrecondition,
                "pool {} already started",
                self.spec.name
            ));
        }

        let pool = Arc::clone(self);
        background_spawn!("pool_watch", async move { pool.watch_loop().await }, pool = %self.spec.name);

        self.client
            .declare_deployment(&self.spec)
            .await
            .err_tip(|| format!("while declaring deployment for pool {}", self.spec.name))?;
        info!(pool = %self.spec.name, size = self.spec.size, "pool started");
        Ok(())
    }

    async fn watch_loop(self: Arc<Self>) {
        loop {
            let mut stream = match self
                .client
                .watch_pods(&self.spec.namespace, &self.selector)
                .await
            {
                Ok(stream) => stream,
                Err(err) => {
                    warn!(pool = %self.spec.name, ?err, "pod watch");
                    time::sleep(WATCH_RETRY_DELAY).await;
                    continue;
                }
            };

            while let Some(event) = stream.next().await {
                match event {
                    Ok(PodEvent::Applied(pod)) => self.ingest(pod),
                    Ok(PodEvent::Deleted(pod)) => self.evict(&pod),
                    Err(err) => warn!(pool = %self.spec.name, ?err, "pod watch"),
                }
            }

            warn!(pool = %self.spec.name, "pod watch closed");
            time::sleep(WATCH_RETRY_DELAY).await;
        }
    }

    /// Folds one observed pod into pool state. Ready pods are admitted at
    /// most once and go to the head waiter if one is parked; pods that
    /// regress out of readiness are dropped from the ready set.
    fn ingest(&self, pod: Pod) {
        let Some(name) = pod.metadata.name.clone() else {
            return;
        };

        if is_pod_ready(&pod) {
            let mut state = self.state.lock();
            if !state.admitted.insert(name.clone()) {
                return;
            }
            info!(pool = %self.spec.name, pod = %name, "pod added");

            let mut pod = pod;
            while let Some(waiter) = state.waiters.pop_front() {
                match waiter.slot.send(Worker::new(name.clone(), pod)) {
                    Ok(()) => return,
                    // The acquirer gave up between parking and delivery.
                    Err(worker) => pod = worker.into_pod(),
                }
            }

            state.ready_queue.push_back(name.clone());
            state.pods.insert(name, pod);
        } else {
            let mut state = self.state.lock();
            if state.pods.remove(&name).is_some() {
                state.ready_queue.retain(|n| n != &name);
                state.admitted.remove(&name);
                info!(pool = %self.spec.name, pod = %name, "pod removed");
            }
        }
    }

    /// Handles a deletion event: the pod is gone (or left the selector), so
    /// its name may be forgotten entirely.
    fn evict(&self, pod: &Pod) {
        let Some(name) = pod.metadata.name.as_deref() else {
            return;
        };
        let mut state = self.state.lock();
        state.admitted.remove(name);
        if state.pods.remove(name).is_some() {
            state.ready_queue.retain(|n| n != name);
            info!(pool = %self.spec.name, pod = %name, "pod removed");
        }
    }

    /// Obtains exclusive ownership of one ready worker, parking FIFO behind
    /// earlier acquirers when none is ready. Blocks indefinitely unless the
    /// caller bounds it; dropping the returned future (e.g. through
    /// `tokio::time::timeout`) deregisters the waiter.
    pub async fn acquire(&self) -> Result<Worker, Error> {
        loop {
            let worker = self.next_ready_worker().await?;
            match self.claim(worker).await {
                Ok(worker) => {
                    self.metrics.claimed_workers.fetch_add(1, Ordering::Relaxed);
                    info!(pool = %self.spec.name, pod = %worker.name(), "worker acquired");
                    return Ok(worker);
                }
                Err(err) if err.code == Code::Aborted => {
                    self.metrics.claim_conflicts.fetch_add(1, Ordering::Relaxed);
                    info!(pool = %self.spec.name, ?err, "claim conflict; retrying acquire");
                }
                Err(err) => {
                    return Err(err)
                        .err_tip(|| format!("while claiming worker from pool {}", self.spec.name));
                }
            }
        }
    }

    async fn next_ready_worker(&self) -> Result<Worker, Error> {
        let slot = {
            let mut state = self.state.lock();
            debug!(
                pool = %self.spec.name,
                ready = state.ready_queue.len(),
                waiting = state.waiters.len(),
                "acquiring worker"
            );

            while let Some(name) = state.ready_queue.pop_front() {
                if let Some(pod) = state.pods.remove(&name) {
                    return Ok(Worker::new(name, pod));
                }
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            state.waiters.push_back(Waiter { id, slot: tx });
            WaiterSlot {
                pool: self,
                id,
                rx,
                completed: false,
            }
        };

        slot.recv().await
    }

    /// Marks the worker as claimed and detaches it from the deployment so the
    /// replica controller schedules a replacement instead of garbage
    /// collecting this pod when it scales. The label flip also removes the
    /// pod from the watch selector, so it can never be re-ingested.
    async fn claim(&self, mut worker: Worker) -> Result<Worker, Error> {
        let pod = worker.pod_mut();
        pod.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(CLAIMED_LABEL.to_string(), "true".to_string());
        pod.metadata.owner_references = None;

        match self.client.update_pod(&self.spec.namespace, pod).await {
            Ok(updated) => {
                worker.set_pod(updated);
                Ok(worker)
            }
            Err(err) => {
                // Abandoned on purpose: whoever moved the revision owns the
                // pod's fate now. Do not requeue.
                let _ = worker.into_pod();
                Err(err)
            }
        }
    }

    /// Permanently destroys a worker. This is the only terminal transition;
    /// the deployment controller backfills the replica within bounded time.
    pub async fn release(&self, worker: Worker) -> Result<(), Error> {
        let name = worker.name().to_string();
        let _ = worker.into_pod();
        self.metrics.released_workers.fetch_add(1, Ordering::Relaxed);
        info!(pool = %self.spec.name, pod = %name, "releasing worker");

        if let Err(err) = self.client.delete_pod(&self.spec.namespace, &name).await {
            error!(pool = %self.spec.name, pod = %name, ?err, "failed to delete released worker");
            return Err(err).err_tip(|| format!("while deleting pod {name}"));
        }
        Ok(())
    }

    /// Runs a command inside a claimed worker and returns captured stdout.
    pub async fn exec(
        &self,
        worker: &Worker,
        command: &[&str],
        stdin: Option<Bytes>,
    ) -> Result<Bytes, Error> {
        let command: Vec<String> = command.iter().map(ToString::to_string).collect();
        self.client
            .exec(&self.spec.namespace, worker.name(), &command, stdin)
            .await
    }

    /// Writes `content` to `path` inside the worker through a piped `cat`.
    pub async fn write_file(
        &self,
        worker: &Worker,
        path: &str,
        content: Bytes,
    ) -> Result<(), Error> {
        let script = format!("cat > {path}");
        self.exec(worker, &["/bin/sh", "-c", &script], Some(content))
            .await
            .map(|_| ())
            .err_tip(|| format!("while writing file {path}"))
    }

    /// Reads the bytes of `path` inside the worker through `cat`.
    pub async fn read_file(&self, worker: &Worker, path: &str) -> Result<Bytes, Error> {
        let script = format!("cat {path}");
        self.exec(worker, &["/bin/sh", "-c", &script], None)
            .await
            .err_tip(|| format!("while reading file {path}"))
    }
}

/// Receiving side of a parked acquisition. Dropping it before delivery
/// deregisters the waiter; a worker that raced the drop is readmitted at the
/// head of the ready queue.
struct WaiterSlot<'a> {
    pool: &'a WorkerPool,
    id: u64,
    rx: oneshot::Receiver<Worker>,
    completed: bool,
}

impl WaiterSlot<'_> {
    async fn recv(mut self) -> Result<Worker, Error> {
        match (&mut self.rx).await {
            Ok(worker) => {
                self.completed = true;
                Ok(worker)
            }
            Err(_) => Err(make_err!(
                Code::Internal,
                "worker delivery slot closed without delivery"
            )),
        }
    }
}

impl Drop for WaiterSlot<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut state = self.pool.state.lock();
        state.waiters.retain(|waiter| waiter.id != self.id);

        // The delivery may have raced the cancellation. The worker is still
        // unclaimed, so it goes to the next waiter in line, or back to the
        // head of the ready queue.
        if let Ok(worker) = self.rx.try_recv() {
            let mut worker = worker;
            while let Some(waiter) = state.waiters.pop_front() {
                match waiter.slot.send(worker) {
                    Ok(()) => return,
                    Err(returned) => worker = returned,
                }
            }
            let name = worker.name().to_string();
            state.ready_queue.push_front(name.clone());
            state.pods.insert(name, worker.into_pod());
        }
    }
}
