// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Error Taxonomy
//!
//! Every error that crosses the RPC boundary is an [`RpcError`]: a kind with a
//! fixed numeric code, a human readable message and an optional `extra`
//! payload. The wire form is `{code, message, extra?}`; clients rebuild the
//! kind from `code` with [`ErrorKind::from_code`].
//!
//! | Kind | Code | errno (FreeBSD) |
//! |------|------|-----------------|
//! | `INVALID_STATE` | 1 | EPERM |
//! | `SERVICE_NOT_FOUND` | 2 | ENOENT |
//! | `UNKNOWN_TASK` | 3 | ESRCH |
//! | `CALL_ERROR` | 5 | EIO |
//! | `PERMISSION_DENIED` | 13 | EACCES |
//! | `ALREADY_REGISTERED` | 17 | EEXIST |
//! | `INVALID_PARAMETERS` | 22 | EINVAL |
//! | `CONNECTION_CLOSED` | 57 | ENOTCONN |
//! | `TIMEOUT` | 60 | ETIMEDOUT |
//! | `METHOD_NOT_FOUND` | 78 | ENOSYS |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ServiceNotFound,
    MethodNotFound,
    UnknownTask,
    InvalidParameters,
    PermissionDenied,
    CallError,
    InvalidState,
    AlreadyRegistered,
    ConnectionClosed,
    Timeout,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::ServiceNotFound,
        ErrorKind::MethodNotFound,
        ErrorKind::UnknownTask,
        ErrorKind::InvalidParameters,
        ErrorKind::PermissionDenied,
        ErrorKind::CallError,
        ErrorKind::InvalidState,
        ErrorKind::AlreadyRegistered,
        ErrorKind::ConnectionClosed,
        ErrorKind::Timeout,
    ];

    pub fn code(self) -> i32 {
        match self {
            ErrorKind::InvalidState => 1,
            ErrorKind::ServiceNotFound => 2,
            ErrorKind::UnknownTask => 3,
            ErrorKind::CallError => 5,
            ErrorKind::PermissionDenied => 13,
            ErrorKind::AlreadyRegistered => 17,
            ErrorKind::InvalidParameters => 22,
            ErrorKind::ConnectionClosed => 57,
            ErrorKind::Timeout => 60,
            ErrorKind::MethodNotFound => 78,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ErrorKind::ServiceNotFound => "SERVICE_NOT_FOUND",
            ErrorKind::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorKind::UnknownTask => "UNKNOWN_TASK",
            ErrorKind::InvalidParameters => "INVALID_PARAMETERS",
            ErrorKind::PermissionDenied => "PERMISSION_DENIED",
            ErrorKind::CallError => "CALL_ERROR",
            ErrorKind::InvalidState => "INVALID_STATE",
            ErrorKind::AlreadyRegistered => "ALREADY_REGISTERED",
            ErrorKind::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorKind::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Structured error returned by every RPC boundary in the runtime
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
    pub extra: Option<Value>,
}

/// Wire representation of an [`RpcError`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = Some(extra);
        self
    }

    pub fn service_not_found(service: &str) -> Self {
        Self::new(
            ErrorKind::ServiceNotFound,
            format!("Service {} not found", service),
        )
    }

    pub fn method_not_found(service: &str, method: &str) -> Self {
        Self::new(
            ErrorKind::MethodNotFound,
            format!("Method {} in service {} not found", method, service),
        )
    }

    pub fn unknown_task(name: &str) -> Self {
        Self::new(ErrorKind::UnknownTask, format!("Task {} not found", name))
    }

    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameters, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, message)
    }

    pub fn call_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CallError, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidState, message)
    }

    pub fn already_registered(what: &str, name: &str) -> Self {
        Self::new(
            ErrorKind::AlreadyRegistered,
            format!("{} {} is already registered", what, name),
        )
    }

    pub fn connection_closed() -> Self {
        Self::new(ErrorKind::ConnectionClosed, "Connection closed")
    }

    pub fn code(&self) -> i32 {
        self.kind.code()
    }

    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.kind.code(),
            message: self.message.clone(),
            extra: self.extra.clone(),
        }
    }

    /// Rebuild an error from its wire form. Unknown codes become `CALL_ERROR`
    /// with the original code kept in `extra`.
    pub fn from_payload(payload: ErrorPayload) -> Self {
        match ErrorKind::from_code(payload.code) {
            Some(kind) => Self {
                kind,
                message: payload.message,
                extra: payload.extra,
            },
            None => Self {
                kind: ErrorKind::CallError,
                message: payload.message,
                extra: Some(serde_json::json!({
                    "code": payload.code,
                    "extra": payload.extra,
                })),
            },
        }
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<RpcError>() {
            Ok(rpc) => rpc,
            Err(other) => RpcError::call_error(other.to_string())
                .with_extra(serde_json::json!({ "trace": format!("{:?}", other) })),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::invalid_parameters(err.to_string())
    }
}
