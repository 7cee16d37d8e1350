//! In-memory orchestrator for tests.
//!
//! [`MemoryOrchestrator`] emulates the slice of cluster behavior the pool
//! depends on: declarative deployments with replica replacement, label
//! selector watches with an initial list, pod updates with conflict
//! injection, and a `cat`-aware exec that keeps per-pod files. Anything it
//! does not understand is routed to an installable exec handler.

use core::time::Duration;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use execbox_error::{Code, Error, ResultExt, make_err};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::client::{OrchestratorClient, PodEvent, PodEventStream};
use crate::config::PoolSpec;
use crate::deployment::pool_labels;

/// Handler invoked for exec commands the orchestrator does not emulate
/// itself. Receives the pod name, argv, stdin and mutable access to the
/// per-pod file store keyed by `(pod, path)`.
pub type ExecHandler = Box<
    dyn Fn(
            &str,
            &[String],
            Option<Bytes>,
            &mut HashMap<(String, String), Bytes>,
        ) -> Result<Bytes, Error>
        + Send
        + Sync,
>;

struct WatchHandle {
    selector: BTreeMap<String, String>,
    tx: mpsc::UnboundedSender<Result<PodEvent, Error>>,
}

#[derive(Default)]
struct ClusterState {
    deployments: HashMap<String, PoolSpec>,
    pods: HashMap<String, Pod>,
    files: HashMap<(String, String), Bytes>,
    watchers: Vec<WatchHandle>,
    update_conflicts: VecDeque<Error>,
    updated: Vec<Pod>,
    deleted: Vec<String>,
    watch_connects: u64,
    pod_counter: u64,
    exec_delays: Vec<(String, Duration)>,
    /// Replicas scheduled but not yet materialized, per pool.
    pending_replicas: HashMap<String, usize>,
    /// Time a scheduled replica takes to become ready. `None` means replicas
    /// appear instantly.
    provision_delay: Option<Duration>,
}

/// In-memory [`OrchestratorClient`].
pub struct MemoryOrchestrator {
    state: Mutex<ClusterState>,
    exec_handler: Mutex<Option<ExecHandler>>,
    provision_replicas: bool,
    weak_self: Weak<Self>,
}

fn parse_selector(selector: &str) -> BTreeMap<String, String> {
    selector
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn matches_selector(
    labels: Option<&BTreeMap<String, String>>,
    selector: &BTreeMap<String, String>,
) -> bool {
    let Some(labels) = labels else {
        return selector.is_empty();
    };
    selector.iter().all(|(key, value)| labels.get(key) == Some(value))
}

/// A pod that passes the readiness predicate, labeled for `pool`.
#[must_use]
pub fn ready_pod(pool: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(pool_labels(pool)),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            container_statuses: Some(vec![ContainerStatus {
                name: pool.to_string(),
                ready: true,
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

impl ClusterState {
    fn broadcast(&mut self, pod: &Pod, deleted: bool) {
        let labels = pod.metadata.labels.as_ref();
        self.watchers.retain(|watcher| {
            if !matches_selector(labels, &watcher.selector) {
                return !watcher.tx.is_closed();
            }
            let event = if deleted {
                PodEvent::Deleted(pod.clone())
            } else {
                PodEvent::Applied(pod.clone())
            };
            watcher.tx.send(Ok(event)).is_ok()
        });
    }

    fn spawn_replica(&mut self, deployment: &PoolSpec) {
        self.pod_counter += 1;
        let name = format!("{}-{:05x}", deployment.name, self.pod_counter);
        let pod = ready_pod(&deployment.name, &name);
        self.pods.insert(name, pod.clone());
        self.broadcast(&pod, false);
    }
}

impl MemoryOrchestrator {
    /// Full emulation: declaring a deployment provisions its replicas and
    /// every claimed or deleted pod is replaced.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            state: Mutex::new(ClusterState::default()),
            exec_handler: Mutex::new(None),
            provision_replicas: true,
            weak_self: weak_self.clone(),
        })
    }

    /// Records deployments but never provisions pods; the test drives every
    /// event through [`MemoryOrchestrator::push_pod`] and friends.
    #[must_use]
    pub fn manual() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            state: Mutex::new(ClusterState::default()),
            exec_handler: Mutex::new(None),
            provision_replicas: false,
            weak_self: weak_self.clone(),
        })
    }

    /// Makes scheduled replicas take `delay` to become ready instead of
    /// appearing instantly, like pods starting up on a real cluster.
    pub fn set_provision_delay(&self, delay: Duration) {
        self.state.lock().provision_delay = Some(delay);
    }

    /// Emulates the replica controller: every deployment is topped back up to
    /// its desired count of unclaimed pods, counting replicas already on the
    /// way.
    fn reconcile_locked(&self, state: &mut ClusterState) {
        let deployments: Vec<PoolSpec> = state.deployments.values().cloned().collect();
        for deployment in deployments {
            let selector = pool_labels(&deployment.name);
            let live = state
                .pods
                .values()
                .filter(|pod| matches_selector(pod.metadata.labels.as_ref(), &selector))
                .count()
                + state
                    .pending_replicas
                    .get(&deployment.name)
                    .copied()
                    .unwrap_or(0);
            let desired = usize::try_from(deployment.size).unwrap_or(0);

            for _ in live..desired {
                let Some(delay) = state.provision_delay else {
                    state.spawn_replica(&deployment);
                    continue;
                };
                *state
                    .pending_replicas
                    .entry(deployment.name.clone())
                    .or_default() += 1;
                let weak_self = self.weak_self.clone();
                let deployment = deployment.clone();
                tokio::spawn(async move {
                    time::sleep(delay).await;
                    let Some(orchestrator) = weak_self.upgrade() else {
                        return;
                    };
                    let mut state = orchestrator.state.lock();
                    if let Some(pending) = state.pending_replicas.get_mut(&deployment.name) {
                        *pending = pending.saturating_sub(1);
                    }
                    state.spawn_replica(&deployment);
                });
            }
        }
    }

    pub fn push_pod(&self, pod: Pod) {
        let Some(name) = pod.metadata.name.clone() else {
            return;
        };
        let mut state = self.state.lock();
        state.pods.insert(name, pod.clone());
        state.broadcast(&pod, false);
    }

    pub fn remove_pod(&self, name: &str) {
        let mut state = self.state.lock();
        if let Some(pod) = state.pods.remove(name) {
            state.broadcast(&pod, true);
        }
    }

    pub fn fail_next_update(&self, error: Error) {
        self.state.lock().update_conflicts.push_back(error);
    }

    /// Surfaces an inline error on every open watch stream.
    pub fn inject_watch_error(&self, error: Error) {
        let state = self.state.lock();
        for watcher in &state.watchers {
            let _ = watcher.tx.send(Err(error.clone()));
        }
    }

    /// Terminates every open watch stream, forcing watchers to reconnect.
    pub fn disconnect_watchers(&self) {
        self.state.lock().watchers.clear();
    }

    pub fn set_exec_handler(
        &self,
        handler: impl Fn(
                &str,
                &[String],
                Option<Bytes>,
                &mut HashMap<(String, String), Bytes>,
            ) -> Result<Bytes, Error>
            + Send
            + Sync
            + 'static,
    ) {
        *self.exec_handler.lock() = Some(Box::new(handler));
    }

    /// Delays any exec whose argv starts with `command` by `delay`.
    pub fn set_exec_delay(&self, command: &str, delay: Duration) {
        self.state
            .lock()
            .exec_delays
            .push((command.to_string(), delay));
    }

    #[must_use]
    pub fn file(&self, pod: &str, path: &str) -> Option<Bytes> {
        self.state
            .lock()
            .files
            .get(&(pod.to_string(), path.to_string()))
            .cloned()
    }

    #[must_use]
    pub fn deleted_pods(&self) -> Vec<String> {
        self.state.lock().deleted.clone()
    }

    #[must_use]
    pub fn updated_pods(&self) -> Vec<Pod> {
        self.state.lock().updated.clone()
    }

    /// Live pods still matching the pool's unclaimed selector.
    #[must_use]
    pub fn unclaimed_pods(&self, pool: &str) -> usize {
        let selector = pool_labels(pool);
        let state = self.state.lock();
        state
            .pods
            .values()
            .filter(|pod| matches_selector(pod.metadata.labels.as_ref(), &selector))
            .count()
    }

    #[must_use]
    pub fn watch_connects(&self) -> u64 {
        self.state.lock().watch_connects
    }
}

#[async_trait]
impl OrchestratorClient for MemoryOrchestrator {
    async fn declare_deployment(&self, spec: &PoolSpec) -> Result<(), Error> {
        let mut state = self.state.lock();
        if !state.deployments.contains_key(&spec.name) {
            state.deployments.insert(spec.name.clone(), spec.clone());
        }
        if self.provision_replicas {
            self.reconcile_locked(&mut state);
        }
        Ok(())
    }

    async fn watch_pods(
        &self,
        _namespace: &str,
        selector: &str,
    ) -> Result<PodEventStream, Error> {
        let selector = parse_selector(selector);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.state.lock();
        state.watch_connects += 1;
        // Initial list, like an informer relist.
        for pod in state.pods.values() {
            if matches_selector(pod.metadata.labels.as_ref(), &selector) {
                let _ = tx.send(Ok(PodEvent::Applied(pod.clone())));
            }
        }
        state.watchers.push(WatchHandle { selector, tx });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn update_pod(&self, _namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let name = pod
            .metadata
            .name
            .clone()
            .err_tip(|| "pod to update has no name")?;

        let mut state = self.state.lock();
        if let Some(error) = state.update_conflicts.pop_front() {
            return Err(error);
        }

        let Some(existing) = state.pods.get(&name) else {
            return Err(make_err!(Code::NotFound, "pod {name} not found"));
        };
        let old_labels = existing.metadata.labels.clone();
        state.pods.insert(name.clone(), pod.clone());
        state.updated.push(pod.clone());

        let new_labels = pod.metadata.labels.as_ref();
        state.watchers.retain(|watcher| {
            let matched_before = matches_selector(old_labels.as_ref(), &watcher.selector);
            let matches_now = matches_selector(new_labels, &watcher.selector);
            let event = match (matched_before, matches_now) {
                (_, true) => Some(PodEvent::Applied(pod.clone())),
                (true, false) => Some(PodEvent::Deleted(pod.clone())),
                (false, false) => None,
            };
            match event {
                Some(event) => watcher.tx.send(Ok(event)).is_ok(),
                None => !watcher.tx.is_closed(),
            }
        });

        if self.provision_replicas {
            self.reconcile_locked(&mut state);
        }
        Ok(pod.clone())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        let Some(pod) = state.pods.remove(name) else {
            return Err(make_err!(Code::NotFound, "pod {name} not found"));
        };
        state.deleted.push(name.to_string());
        state
            .files
            .retain(|(pod_name, _), _| pod_name != name);
        state.broadcast(&pod, true);
        if self.provision_replicas {
            self.reconcile_locked(&mut state);
        }
        Ok(())
    }

    async fn exec(
        &self,
        _namespace: &str,
        pod_name: &str,
        command: &[String],
        stdin: Option<Bytes>,
    ) -> Result<Bytes, Error> {
        let delay = {
            let state = self.state.lock();
            if !state.pods.contains_key(pod_name) {
                return Err(make_err!(Code::NotFound, "pod {pod_name} not found"));
            }
            command.first().and_then(|arg0| {
                state
                    .exec_delays
                    .iter()
                    .find(|(prefix, _)| arg0 == prefix)
                    .map(|(_, delay)| *delay)
            })
        };
        if let Some(delay) = delay {
            time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if command.len() == 3 && command[0] == "/bin/sh" && command[1] == "-c" {
            if let Some(path) = command[2].strip_prefix("cat > ") {
                state.files.insert(
                    (pod_name.to_string(), path.to_string()),
                    stdin.unwrap_or_default(),
                );
                return Ok(Bytes::new());
            }
            if let Some(path) = command[2].strip_prefix("cat ") {
                return match state.files.get(&(pod_name.to_string(), path.to_string())) {
                    Some(content) => Ok(content.clone()),
                    None => Err(Error::new(
                        Code::Unknown,
                        format!("cat: {path}: No such file or directory"),
                    )),
                };
            }
        }

        let handler = self.exec_handler.lock();
        match handler.as_ref() {
            Some(handler) => handler(pod_name, command, stdin, &mut state.files),
            None => Err(make_err!(
                Code::Unimplemented,
                "no exec handler installed for {command:?}"
            )),
        }
    }
}
