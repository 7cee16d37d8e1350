use async_trait::async_trait;
use bytes::Bytes;
use execbox_config::service::Environment;
use execbox_error::{Code, Error, ResultExt, make_err};
use futures::StreamExt;
use futures::future::ready;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{AttachParams, DeleteParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::runtime::watcher;
use kube::{Api, Client, Config};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::PoolSpec;
use crate::deployment::build_deployment;

/// One observation from a pod watch. `Applied` covers both the initial list
/// and subsequent modifications; `Deleted` fires when a pod dies or stops
/// matching the selector.
#[derive(Debug, Clone)]
pub enum PodEvent {
    Applied(Pod),
    Deleted(Pod),
}

/// Lazy watch stream. Errors are surfaced inline; when the stream terminates
/// the caller is expected to re-establish it.
pub type PodEventStream = BoxStream<'static, Result<PodEvent, Error>>;

/// True when an error is the remote command failing (it terminated with a
/// failure status and wrote to stderr), as opposed to a transport or cluster
/// failure. The stderr text is the error's only message.
#[must_use]
pub fn is_command_failure(err: &Error) -> bool {
    err.code == Code::Unknown
}

/// Narrow façade over the cluster orchestrator. Everything the pool needs and
/// nothing else, so tests can stand in an in-memory implementation.
#[async_trait]
pub trait OrchestratorClient: Send + Sync + 'static {
    /// Declares the deployment backing a pool. Idempotent: an existing
    /// deployment of the same name is left untouched.
    async fn declare_deployment(&self, spec: &PoolSpec) -> Result<(), Error>;

    /// Opens a watch over pods matching `selector`, starting with the current
    /// list so no pre-existing pod is missed.
    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<PodEventStream, Error>;

    /// Writes mutated labels / owner references back. Fails with
    /// `Code::Aborted` when the stored revision moved underneath us.
    async fn update_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error>;

    /// Deletes a pod with background propagation.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Runs `command` inside the pod's container, feeding it `stdin` if given
    /// and draining both output streams. Returns captured stdout.
    async fn exec(
        &self,
        namespace: &str,
        pod_name: &str,
        command: &[String],
        stdin: Option<Bytes>,
    ) -> Result<Bytes, Error>;
}

/// [`OrchestratorClient`] backed by a real Kubernetes cluster.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    /// Connects to the cluster. Production uses the in-cluster service
    /// account; development reads the local kubeconfig. The apiserver is
    /// probed once so startup fails fast when the cluster is unreachable.
    pub async fn new(environment: Environment) -> Result<Self, Error> {
        let config = match environment {
            Environment::Production => Config::incluster()
                .map_err(|e| make_err!(Code::Unavailable, "{e}"))
                .err_tip(|| "while loading in-cluster config")?,
            Environment::Development => {
                Config::from_kubeconfig(&KubeConfigOptions::default())
                    .await
                    .map_err(|e| make_err!(Code::Unavailable, "{e}"))
                    .err_tip(|| "while loading kubeconfig")?
            }
        };

        let client =
            Client::try_from(config).err_tip(|| "while creating kubernetes client")?;
        client
            .apiserver_version()
            .await
            .err_tip(|| "while probing apiserver version")?;

        Ok(Self { client })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl OrchestratorClient for KubeOrchestrator {
    async fn declare_deployment(&self, spec: &PoolSpec) -> Result<(), Error> {
        let deployments: Api<Deployment> =
            Api::namespaced(self.client.clone(), &spec.namespace);

        if deployments
            .get_opt(&spec.name)
            .await
            .err_tip(|| format!("while getting deployment {}", spec.name))?
            .is_some()
        {
            return Ok(());
        }

        match deployments
            .create(&PostParams::default(), &build_deployment(spec))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = Error::from(err);
                // Lost a race against another instance declaring the same pool.
                if err.code == Code::Aborted || err.code == Code::AlreadyExists {
                    return Ok(());
                }
                Err(err).err_tip(|| format!("while creating deployment {}", spec.name))
            }
        }
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<PodEventStream, Error> {
        let watch_config = watcher::Config::default().labels(selector);
        let stream = watcher(self.pods(namespace), watch_config)
            .map(|event| match event {
                Ok(watcher::Event::Apply(pod) | watcher::Event::InitApply(pod)) => {
                    Some(Ok(PodEvent::Applied(pod)))
                }
                Ok(watcher::Event::Delete(pod)) => Some(Ok(PodEvent::Deleted(pod))),
                Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                Err(err) => Some(Err(make_err!(Code::Unavailable, "{err}"))),
            })
            .filter_map(ready)
            .boxed();
        Ok(stream)
    }

    async fn update_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let name = pod
            .metadata
            .name
            .as_deref()
            .err_tip(|| "pod to update has no name")?;
        self.pods(namespace)
            .replace(name, &PostParams::default(), pod)
            .await
            .err_tip(|| format!("while updating pod {name}"))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.pods(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .err_tip(|| format!("while deleting pod {name}"))?;
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod_name: &str,
        command: &[String],
        stdin: Option<Bytes>,
    ) -> Result<Bytes, Error> {
        let params = AttachParams::default()
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);

        let mut attached = self
            .pods(namespace)
            .exec(pod_name, command.iter().map(String::as_str), &params)
            .await
            .err_tip(|| format!("while opening exec stream to {pod_name}"))?;

        let status_fut = attached
            .take_status()
            .err_tip(|| format!("exec stream to {pod_name} has no status channel"))?;
        let stdin_writer = attached.stdin();
        let mut stdout_reader = attached.stdout();
        let mut stderr_reader = attached.stderr();

        let write_stdin = async {
            if let Some(mut writer) = stdin_writer {
                if let Some(payload) = &stdin {
                    writer.write_all(payload).await?;
                }
                // Dropping the writer sends EOF so piped reads terminate.
                writer.shutdown().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let drain_stdout = async {
            let mut buf = Vec::new();
            if let Some(reader) = stdout_reader.as_mut() {
                reader.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };
        let drain_stderr = async {
            let mut buf = Vec::new();
            if let Some(reader) = stderr_reader.as_mut() {
                reader.read_to_end(&mut buf).await?;
            }
            Ok::<_, std::io::Error>(buf)
        };

        let ((), stdout, stderr) = tokio::try_join!(write_stdin, drain_stdout, drain_stderr)
            .err_tip(|| format!("while streaming exec io for {pod_name}"))?;

        let status = status_fut.await;
        attached
            .join()
            .await
            .map_err(|e| Error::new(Code::Internal, e.to_string()))
            .err_tip(|| format!("while closing exec stream to {pod_name}"))?;

        if status.as_ref().and_then(|s| s.status.as_deref()) == Some("Success") {
            return Ok(Bytes::from(stdout));
        }

        // A failing remote process that explained itself on stderr is the
        // caller's problem, not ours; hand the text through verbatim.
        if !stderr.is_empty() {
            return Err(Error::new(
                Code::Unknown,
                String::from_utf8_lossy(&stderr).into_owned(),
            ));
        }

        let message = status
            .and_then(|s| s.message)
            .unwrap_or_else(|| "exec stream terminated without a status".to_string());
        Err(make_err!(Code::Internal, "{message}"))
            .err_tip(|| format!("while running exec in {pod_name}"))
    }
}
