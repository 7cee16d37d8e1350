// Copyright 2023 The NativeLink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod task;

use std::env;
use std::sync::OnceLock;

use execbox_error::{Code, make_err};
use tracing::metadata::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, registry};

// Re-export tracing mostly for use in macros.
pub use tracing as __tracing;

// Create a tracing layer intended for stdout printing.
//
// The output of this layer is configurable via the `EXECBOX_LOG` environment
// variable.
fn tracing_stdout_layer() -> impl Layer<Registry> {
    let log_fmt = env::var("EXECBOX_LOG").unwrap_or_else(|_| "pretty".to_string());

    let stdout_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    match log_fmt.as_str() {
        "compact" => fmt::layer()
            .compact()
            .with_timer(fmt::time::time())
            .with_filter(stdout_filter)
            .boxed(),
        "json" => fmt::layer()
            .json()
            .with_timer(fmt::time::time())
            .with_filter(stdout_filter)
            .boxed(),
        _ => fmt::layer()
            .pretty()
            .with_timer(fmt::time::time())
            .with_filter(stdout_filter)
            .boxed(),
    }
}

/// Initialize tracing for the whole process.
///
/// # Errors
///
/// Returns `Err` if logging was already initialized.
pub fn init_tracing() -> Result<(), execbox_error::Error> {
    static INITIALIZED: OnceLock<()> = OnceLock::new();

    if INITIALIZED.get().is_some() {
        return Err(make_err!(Code::Internal, "Logging already initialized"));
    }

    registry().with(tracing_stdout_layer()).init();

    INITIALIZED.set(()).unwrap_or(());

    Ok(())
}
