// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Types shared with the server, plus the client error.

use std::time::Duration;

pub use dispatcher_core::domain::error::{ErrorKind, ErrorPayload, RpcError};
pub use dispatcher_core::domain::event::Event;
pub use dispatcher_core::domain::session::{LoginGrant, Principal};
pub use dispatcher_core::domain::task::{QueueInfo, TaskId, TaskProgress, TaskRecord, TaskState};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),

    /// The server answered with an error frame
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Connection closed")]
    Closed,

    #[error("Unexpected reply: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Error kind as the server reported it; local failures map onto the
    /// closest kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Rpc(e) => e.kind,
            ClientError::Timeout(_) => ErrorKind::Timeout,
            ClientError::Connect(_) | ClientError::Closed => ErrorKind::ConnectionClosed,
            ClientError::Protocol(_) => ErrorKind::CallError,
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Protocol(err.to_string())
    }
}
