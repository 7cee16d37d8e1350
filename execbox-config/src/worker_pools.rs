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

use serde::{Deserialize, Serialize};

use crate::serde_utils::{
    convert_numeric_with_shellexpand, convert_optional_numeric_with_shellexpand,
    convert_string_with_shellexpand,
};

/// Supported language runtimes.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Golang,
}

impl Language {
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::Golang => "golang",
        }
    }
}

const fn default_pool_size() -> i32 {
    5
}

/// Per-pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerPoolConfig {
    /// Pool name. Also used as the deployment name, the container name and
    /// the `execbox/pool` label value, so it must be a valid DNS label.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub name: String,

    /// Container image to boot for every worker in the pool.
    #[serde(deserialize_with = "convert_string_with_shellexpand")]
    pub image: String,

    /// Desired replica count. The deployment controller keeps this many
    /// unclaimed workers alive, replacing each one that gets claimed.
    #[serde(
        default = "default_pool_size",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub size: i32,

    /// Run the workers under the isolating runtime class (gVisor). Enable for
    /// pools that execute untrusted code.
    #[serde(default)]
    pub sandboxed: bool,

    /// Optional CPU request per worker. A value of `n` requests `n * 100`
    /// milli-cores.
    #[serde(
        default,
        deserialize_with = "convert_optional_numeric_with_shellexpand"
    )]
    pub cpu: Option<u16>,

    /// Optional memory request per worker in MiB.
    #[serde(
        default,
        deserialize_with = "convert_optional_numeric_with_shellexpand"
    )]
    pub memory_mib: Option<u32>,
}

/// One language executor and the builder pool backing it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Language tag requests are dispatched on.
    pub language: Language,

    /// Builder pool owned by this executor. Builders carry the toolchain
    /// image and are not sandboxed by default.
    pub pool: WorkerPoolConfig,
}
