use k8s_openapi::api::core::v1::Pod;

/// Handle to one claimed (or about to be claimed) worker pod. Exactly one
/// owner exists at any time: the pool, the acquirer, or nobody (deleted).
#[derive(Debug)]
pub struct Worker {
    name: String,
    pod: Pod,
    released: bool,
}

impl Worker {
    pub(crate) fn new(name: String, pod: Pod) -> Self {
        Self {
            name,
            pod,
            released: false,
        }
    }

    /// Stable pod name assigned by the orchestrator.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn pod_mut(&mut self) -> &mut Pod {
        &mut self.pod
    }

    pub(crate) fn set_pod(&mut self, pod: Pod) {
        self.pod = pod;
    }

    /// Consumes the handle without triggering the leak warning.
    pub(crate) fn into_pod(mut self) -> Pod {
        self.released = true;
        core::mem::take(&mut self.pod)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                pod = %self.name,
                "worker dropped without release; pod leaks until the replica controller converges"
            );
        }
    }
}

/// A pod is ready to take work iff it is running, not terminating, all of its
/// status conditions are `True` and every container reports ready.
#[must_use]
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = &pod.status else {
        return false;
    };

    if status.phase.as_deref() != Some("Running") {
        return false;
    }

    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }

    for condition in status.conditions.iter().flatten() {
        if condition.status != "True" {
            return false;
        }
    }

    for container_status in status.container_statuses.iter().flatten() {
        if !container_status.ready {
            return false;
        }
    }

    true
}
