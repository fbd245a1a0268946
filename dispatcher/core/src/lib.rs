// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # NAS Dispatcher Core
//!
//! The middleware runtime of the storage appliance: RPC dispatch, the task
//! balancer, the event bus, the plugin registration surface and the
//! WebSocket protocol endpoint.
//!
//! # Architecture
//!
//! - **domain**: wire-independent types (tasks, queues, events, errors, config)
//! - **application**: the balancer, the RPC context, built-in services and the dispatcher root
//! - **infrastructure**: the event bus, datastore drivers, event source supervision
//! - **presentation**: the JSON-over-WebSocket protocol endpoint

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use application::dispatcher::{Dispatcher, DispatcherBuilder, ShutdownReason};
pub use domain::error::{ErrorKind, RpcError};
