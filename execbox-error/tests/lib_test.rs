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

use std::io;

use execbox_error::{Code, Error, ResultExt, make_err, make_input_err};
use kube::core::ErrorResponse;
use pretty_assertions::assert_eq;
use serde::de::Error as DeError;
use serde::ser::Error as SerError;

#[test]
fn test_make_err_formats_message() {
    let error = make_err!(Code::Internal, "the {} failed after {} tries", "watch", 3);
    assert_eq!(error.code, Code::Internal);
    assert_eq!(
        error.messages,
        vec!["the watch failed after 3 tries".to_string()]
    );
}

#[test]
fn test_make_input_err_uses_invalid_argument() {
    let error = make_input_err!("bad field {}", "size");
    assert_eq!(error.code, Code::InvalidArgument);
    assert_eq!(error.messages, vec!["bad field size".to_string()]);
}

#[test]
fn test_new_with_empty_message_has_no_messages() {
    let error = Error::new(Code::NotFound, String::new());
    assert_eq!(error.messages, Vec::<String>::new());
}

#[test]
fn test_err_tip_appends_message_and_keeps_code() {
    let result: Result<(), Error> = Err(make_err!(Code::Aborted, "conflict"));
    let error = result.err_tip(|| "while claiming worker").unwrap_err();
    assert_eq!(error.code, Code::Aborted);
    assert_eq!(
        error.messages,
        vec!["conflict".to_string(), "while claiming worker".to_string()]
    );
}

#[test]
fn test_err_tip_with_code_replaces_code() {
    let result: Result<(), Error> = Err(make_err!(Code::Unknown, "stderr text"));
    let error = result
        .err_tip_with_code(|_| (Code::Internal, "while writing file"))
        .unwrap_err();
    assert_eq!(error.code, Code::Internal);
    assert_eq!(
        error.messages,
        vec!["stderr text".to_string(), "while writing file".to_string()]
    );
}

#[test]
fn test_err_tip_with_code_some() {
    let option = Some(42);
    let result: Result<i32, Error> =
        option.err_tip_with_code(|_error| (Code::Unknown, "Should not appear"));
    assert!(result.is_ok());
    assert_eq!(result.unwrap(), 42);
}

#[test]
fn test_err_tip_with_code_none() {
    let option: Option<i32> = None;
    let result: Result<i32, Error> =
        option.err_tip_with_code(|_error| (Code::NotFound, "no worker registered"));
    let error = result.unwrap_err();
    assert_eq!(error.code, Code::NotFound);
    assert_eq!(error.messages, vec!["no worker registered".to_string()]);
}

#[test]
fn test_merge_joins_messages_with_separator() {
    let lhs: Result<(), Error> = Err(make_err!(Code::Internal, "first"));
    let rhs: Result<(), Error> = Err(make_err!(Code::Internal, "second"));
    let error = lhs.merge(rhs).unwrap_err();
    assert_eq!(
        error.messages,
        vec![
            "first".to_string(),
            "---".to_string(),
            "second".to_string()
        ]
    );
}

#[test]
fn test_io_error_kind_mapping() {
    let error: Error = io::Error::new(io::ErrorKind::NotFound, "missing").into();
    assert_eq!(error.code, Code::NotFound);

    let error: Error = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
    assert_eq!(error.code, Code::DeadlineExceeded);

    let error: Error = io::Error::new(io::ErrorKind::ConnectionRefused, "down").into();
    assert_eq!(error.code, Code::Unavailable);
}

#[test]
fn test_kube_api_conflict_maps_to_aborted() {
    let error: Error = kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "Operation cannot be fulfilled on pods \"worker-abc\"".to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    })
    .into();
    assert_eq!(error.code, Code::Aborted);
}

#[test]
fn test_kube_api_forbidden_maps_to_permission_denied() {
    let error: Error = kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "pods is forbidden".to_string(),
        reason: "Forbidden".to_string(),
        code: 403,
    })
    .into();
    assert_eq!(error.code, Code::PermissionDenied);
}

#[test]
fn test_serde_serialization_error_custom() {
    let error = <Error as SerError>::custom("Serialization failed due to invalid input");
    assert_eq!(error.code, Code::InvalidArgument);
    assert_eq!(
        error.messages,
        vec!["Serialization failed due to invalid input".to_string()]
    );
}

#[test]
fn test_serde_deserialization_error_custom() {
    let error = <Error as DeError>::custom("Deserialization failed due to corrupted data");
    assert_eq!(error.code, Code::InvalidArgument);
    assert_eq!(
        error.messages,
        vec!["Deserialization failed due to corrupted data".to_string()]
    );
}

#[test]
fn test_message_string_joins_messages() {
    let error = Error::new_with_messages(
        Code::Internal,
        vec!["streaming".to_string(), "while running exec".to_string()],
    );
    assert_eq!(error.message_string(), "streaming : while running exec");
}
