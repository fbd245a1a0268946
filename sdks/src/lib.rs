// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Client for the NAS middleware dispatcher.
//!
//! ```no_run
//! # async fn demo() -> Result<(), dispatcher_client::ClientError> {
//! use dispatcher_client::MiddlewareClient;
//! use serde_json::json;
//!
//! let client = MiddlewareClient::connect("ws://127.0.0.1:5000/socket").await?;
//! client.login("root", "secret").await?;
//! let services = client.call("discovery.get_services", json!([])).await?;
//! let id = client.submit_task("pool.scrub", json!(["tank"])).await?;
//! let record = client.wait_task(id).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod types;

pub use client::MiddlewareClient;
pub use types::*;
