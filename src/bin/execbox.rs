// Copyright 2024 The NativeLink Authors. All rights reserved.
//
// Licensed under the Functional Source License, Version 1.1, Apache 2.0 Future License (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    See LICENSE file for details
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Arc;

use clap::Parser;
use execbox_config::service::ExecboxConfig;
use execbox_error::{Error, ResultExt};
use execbox_executor::ExecutorService;
use execbox_pool::KubeOrchestrator;
use execbox_service::ExecuteServer;
use execbox_util::init_tracing;
use mimalloc::MiMalloc;
use tokio::net::TcpListener;
use tracing::info;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// On-demand code execution sandbox API server.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Config file to use.
    #[clap(value_parser)]
    config_file: String,
}

async fn shutdown_signal() {
    #[cfg(target_family = "unix")]
    {
        use tokio::signal::unix::{SignalKind, signal};
        // SIGTERM is what the cluster sends; ctrl-c covers local runs.
        let Ok(mut terminate) = signal(SignalKind::terminate()) else {
            let _ = tokio::signal::ctrl_c().await;
            return;
        };
        tokio::select! {
            _ = terminate.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(target_family = "unix"))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
}

async fn inner_main(config: ExecboxConfig) -> Result<(), Error> {
    let client = Arc::new(
        KubeOrchestrator::new(config.server.environment)
            .await
            .err_tip(|| "while connecting to the cluster")?,
    );

    let mut service =
        ExecutorService::new(client, &config.kubernetes.namespace, &config.runner_pool)
            .await
            .err_tip(|| "while creating executor service")?;
    service.register_configured(&config.executors).await?;

    let router = ExecuteServer::new(Arc::new(service)).into_router();
    let listener = TcpListener::bind(&config.server.listen_address)
        .await
        .err_tip(|| format!("while binding {}", config.server.listen_address))?;
    info!(address = %config.server.listen_address, "starting execbox api server");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .err_tip(|| "while serving http")?;
    Ok(())
}

fn get_config() -> Result<ExecboxConfig, Error> {
    let args = Args::parse();
    ExecboxConfig::try_from_json5_file(&args.config_file)
}

fn main() -> Result<(), Box<dyn core::error::Error>> {
    init_tracing()?;
    let config = get_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(inner_main(config))?;
    Ok(())
}
