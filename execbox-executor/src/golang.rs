use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use execbox_config::worker_pools::WorkerPoolConfig;
use execbox_error::{Error, ResultExt};
use execbox_pool::{PoolSpec, Worker, WorkerPool, is_command_failure};
use tracing::{info, warn};

use crate::service::{Executor, ExecutorService};

const SOURCE_PATH: &str = "/app/main.go";
const ARTIFACT_PATH: &str = "/app/main";
const RUNNER_ARTIFACT: &str = "main";

enum BuildOutcome {
    Artifact(Bytes),
    CompileError(String),
}

/// Compiles Go source in a builder worker and runs the produced binary in a
/// sandboxed runner worker.
pub struct GolangExecutor {
    pool_config: WorkerPoolConfig,
    builders: Option<Arc<WorkerPool>>,
    runners: Option<Arc<WorkerPool>>,
}

impl GolangExecutor {
    #[must_use]
    pub fn new(pool_config: WorkerPoolConfig) -> Self {
        Self {
            pool_config,
            builders: None,
            runners: None,
        }
    }

    async fn build(
        &self,
        pool: &WorkerPool,
        builder: &Worker,
        code: &str,
    ) -> Result<BuildOutcome, Error> {
        pool.write_file(builder, SOURCE_PATH, Bytes::copy_from_slice(code.as_bytes()))
            .await
            .err_tip(|| "while writing code")?;

        let start = Instant::now();
        match pool
            .exec(
                builder,
                &[
                    "go",
                    "build",
                    "-o",
                    ARTIFACT_PATH,
                    "-ldflags",
                    "-s -w",
                    SOURCE_PATH,
                ],
                None,
            )
            .await
        {
            Ok(_) => {}
            // The compiler spoke; its stderr is the user-visible result.
            Err(err) if is_command_failure(&err) => {
                return Ok(BuildOutcome::CompileError(err.message_string()));
            }
            Err(err) => return Err(err).err_tip(|| "while building code"),
        }
        info!(duration = ?start.elapsed(), "finished building");

        let artifact = pool
            .read_file(builder, ARTIFACT_PATH)
            .await
            .err_tip(|| "while reading executable")?;
        Ok(BuildOutcome::Artifact(artifact))
    }

    async fn run(
        &self,
        pool: &WorkerPool,
        runner: &Worker,
        artifact: Bytes,
    ) -> Result<String, Error> {
        pool.write_file(runner, RUNNER_ARTIFACT, artifact)
            .await
            .err_tip(|| "while writing executable")?;
        pool.exec(runner, &["chmod", "+x", RUNNER_ARTIFACT], None)
            .await
            .err_tip(|| "while setting executable permissions")?;

        let start = Instant::now();
        let output = match pool.exec(runner, &["./main"], None).await {
            Ok(stdout) => String::from_utf8_lossy(&stdout).into_owned(),
            // The program failed on its own terms; report its stderr as output.
            Err(err) if is_command_failure(&err) => err.message_string(),
            Err(err) => return Err(err).err_tip(|| "while running code"),
        };
        info!(duration = ?start.elapsed(), "finished running");
        Ok(output)
    }
}

#[async_trait]
impl Executor for GolangExecutor {
    async fn init(&mut self, service: &ExecutorService) -> Result<(), Error> {
        let builders = WorkerPool::new(
            Arc::clone(service.client()),
            PoolSpec::from_config(service.namespace(), &self.pool_config),
        );
        builders
            .start()
            .await
            .err_tip(|| "while starting builders")?;
        self.builders = Some(builders);
        self.runners = Some(Arc::clone(service.runners()));
        Ok(())
    }

    async fn execute(&self, code: &str) -> Result<String, Error> {
        let builders = self
            .builders
            .as_ref()
            .err_tip(|| "golang executor used before init")?;
        let runners = self
            .runners
            .as_ref()
            .err_tip(|| "golang executor used before init")?;

        let builder = builders
            .acquire()
            .await
            .err_tip(|| "while fetching builder")?;
        info!(pod = %builder.name(), "fetched builder");
        let build_result = self.build(builders, &builder, code).await;
        if let Err(err) = builders.release(builder).await {
            warn!(?err, "failed to release builder");
        }
        let artifact = match build_result? {
            BuildOutcome::Artifact(artifact) => artifact,
            BuildOutcome::CompileError(output) => return Ok(output),
        };

        let runner = runners
            .acquire()
            .await
            .err_tip(|| "while fetching runner")?;
        info!(pod = %runner.name(), "fetched runner");
        let run_result = self.run(runners, &runner, artifact).await;
        if let Err(err) = runners.release(runner).await {
            warn!(?err, "failed to release runner");
        }
        run_result
    }
}
