use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use execbox_config::worker_pools::{ExecutorConfig, Language, WorkerPoolConfig};
use execbox_error::{Code, Error, ResultExt};
use execbox_pool::{OrchestratorClient, PoolSpec, WorkerPool};
use tracing::info;

use crate::golang::GolangExecutor;

/// Capability set every language executor implements.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Provisions executor-private resources (typically a builder pool).
    /// Called once at registration.
    async fn init(&mut self, service: &ExecutorService) -> Result<(), Error>;

    /// Transforms source text into captured output. Failures of the user's
    /// program come back as `Ok` carrying the compiler's or program's stderr;
    /// only infrastructure failures surface as `Err`.
    async fn execute(&self, code: &str) -> Result<String, Error>;
}

/// Registry of language executors plus the shared sandboxed runner pool.
/// Populated once at startup and read-only afterwards.
pub struct ExecutorService {
    namespace: String,
    client: Arc<dyn OrchestratorClient>,
    runners: Arc<WorkerPool>,
    executors: HashMap<String, Box<dyn Executor>>,
}

impl ExecutorService {
    /// Creates the service and starts the shared runner pool.
    pub async fn new(
        client: Arc<dyn OrchestratorClient>,
        namespace: &str,
        runner_pool: &WorkerPoolConfig,
    ) -> Result<Self, Error> {
        let runners = WorkerPool::new(
            Arc::clone(&client),
            PoolSpec::from_config(namespace, runner_pool),
        );
        runners
            .start()
            .await
            .err_tip(|| "while starting runner pool")?;

        Ok(Self {
            namespace: namespace.to_string(),
            client,
            runners,
            executors: HashMap::new(),
        })
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn client(&self) -> &Arc<dyn OrchestratorClient> {
        &self.client
    }

    /// The shared sandboxed runner pool.
    #[must_use]
    pub fn runners(&self) -> &Arc<WorkerPool> {
        &self.runners
    }

    /// Initializes `executor` and registers it under `language`.
    pub async fn register_executor(
        &mut self,
        language: &str,
        mut executor: Box<dyn Executor>,
    ) -> Result<(), Error> {
        executor
            .init(self)
            .await
            .err_tip(|| format!("while initializing executor {language}"))?;
        self.executors.insert(language.to_string(), executor);
        info!(language, "executor registered");
        Ok(())
    }

    /// Builds and registers one executor per configured language.
    pub async fn register_configured(
        &mut self,
        executors: &[ExecutorConfig],
    ) -> Result<(), Error> {
        for config in executors {
            let executor: Box<dyn Executor> = match config.language {
                Language::Golang => Box::new(GolangExecutor::new(config.pool.clone())),
            };
            self.register_executor(config.language.as_str(), executor)
                .await?;
        }
        Ok(())
    }

    /// Dispatches `code` to the executor registered for `language`.
    pub async fn execute(&self, language: &str, code: &str) -> Result<String, Error> {
        let executor = self.executors.get(language).err_tip_with_code(|_| {
            (
                Code::InvalidArgument,
                format!("unsupported language {language}"),
            )
        })?;
        executor.execute(code).await
    }
}
