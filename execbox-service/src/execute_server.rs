// Copyright 2024 The NativeLink Authors. All rights reserved.
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

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use execbox_error::Code;
use execbox_executor::ExecutorService;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// Language tag used while requests do not carry one.
const DEFAULT_LANGUAGE: &str = "golang";

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub output: String,
}

/// HTTP surface over the executor registry.
///
/// User-program failures never reach this layer as errors; the executor folds
/// them into the `output` string and the request succeeds. Everything that
/// does arrive as an error is an infrastructure problem and maps to a 4xx/5xx
/// status with the message as the body.
#[derive(Clone)]
pub struct ExecuteServer {
    service: Arc<ExecutorService>,
}

impl ExecuteServer {
    #[must_use]
    pub fn new(service: Arc<ExecutorService>) -> Self {
        Self { service }
    }

    #[must_use]
    pub fn into_router(self) -> Router {
        Router::new()
            .route("/api/execute", post(handle_execute))
            .route("/status", get(handle_status))
            .with_state(self.service)
    }
}

fn status_code_for(code: Code) -> StatusCode {
    match code {
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::DeadlineExceeded | Code::Cancelled => StatusCode::GATEWAY_TIMEOUT,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn handle_execute(
    State(service): State<Arc<ExecutorService>>,
    Json(request): Json<ExecuteRequest>,
) -> (StatusCode, Json<ExecuteResponse>) {
    info!(code = %request.code, "received request");

    match service.execute(DEFAULT_LANGUAGE, &request.code).await {
        Ok(output) => {
            info!("completed request");
            (StatusCode::OK, Json(ExecuteResponse { output }))
        }
        Err(err) => {
            error!(?err, "failed to execute code");
            (
                status_code_for(err.code),
                Json(ExecuteResponse {
                    output: err.message_string(),
                }),
            )
        }
    }
}

async fn handle_status() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
