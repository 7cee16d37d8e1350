use execbox_config::worker_pools::WorkerPoolConfig;

/// Immutable description of one worker pool. Fixed at construction; the pool
/// derives its deployment, labels and watch selector from it.
#[derive(Debug, Clone)]
pub struct PoolSpec {
    /// Pool name, also the deployment name and the `execbox/pool` label value.
    pub name: String,
    /// Namespace the deployment and its pods live in.
    pub namespace: String,
    /// Container image every worker boots.
    pub image: String,
    /// Desired replica count.
    pub size: i32,
    /// Run workers under the isolating runtime class.
    pub sandboxed: bool,
    /// CPU request per worker; a value of `n` requests `n * 100` milli-cores.
    pub cpu: Option<u16>,
    /// Memory request per worker in MiB.
    pub memory_mib: Option<u32>,
}

impl PoolSpec {
    #[must_use]
    pub fn from_config(namespace: &str, config: &WorkerPoolConfig) -> Self {
        Self {
            name: config.name.clone(),
            namespace: namespace.to_string(),
            image: config.image.clone(),
            size: config.size,
            sandboxed: config.sandboxed,
            cpu: config.cpu,
            memory_mib: config.memory_mib,
        }
    }
}
