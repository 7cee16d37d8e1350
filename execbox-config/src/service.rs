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

use execbox_error::{Error, ResultExt};
use serde::{Deserialize, Serialize};

use crate::serde_utils::{
    convert_optional_string_with_shellexpand, convert_string_with_shellexpand,
};
use crate::worker_pools::{ExecutorConfig, WorkerPoolConfig};

/// Deployment environment the process runs in. Selects where the cluster
/// configuration comes from.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub enum Environment {
    /// In-cluster configuration (service account token).
    #[serde(rename = "prod")]
    Production,
    /// Local kubeconfig (`~/.kube/config`).
    #[serde(rename = "dev")]
    Development,
}

fn default_listen_address() -> String {
    "0.0.0.0:3001".to_string()
}

const fn default_environment() -> Environment {
    Environment::Development
}

/// HTTP frontend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to.
    #[serde(
        default = "default_listen_address",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub listen_address: String,

    /// Database connection string. Recognized for compatibility with the
    /// surrounding deployment; the execution core keeps no state of its own.
    #[serde(
        default,
        deserialize_with = "convert_optional_string_with_shellexpand"
    )]
    pub database_url: Option<String>,

    /// `prod` or `dev`.
    #[serde(default = "default_environment")]
    pub environment: Environment,
}

fn default_namespace() -> String {
    "execbox".to_string()
}

/// Cluster scoping.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct KubernetesConfig {
    /// Namespace all deployments and pods are created in.
    #[serde(
        default = "default_namespace",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub namespace: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
        }
    }
}

/// Root configuration for the execbox service.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExecboxConfig {
    /// HTTP frontend settings.
    pub server: ServerConfig,

    /// Cluster scoping.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// The shared runner pool executing built artifacts. This is the pool
    /// that should be sandboxed and resource-limited.
    pub runner_pool: WorkerPoolConfig,

    /// Language executors to register at startup, each with its own builder
    /// pool.
    pub executors: Vec<ExecutorConfig>,
}

impl ExecboxConfig {
    /// # Errors
    ///
    /// Will return `Err` if we can't load the file.
    pub fn try_from_json5_file(config_file: &str) -> Result<Self, Error> {
        let json_contents = std::fs::read_to_string(config_file)
            .err_tip(|| format!("Could not open config file {config_file}"))?;
        Ok(serde_json5::from_str(&json_contents)?)
    }
}
