// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Application layer: the dispatcher root, the RPC context, the balancer,
//! the plugin loader, hooks and the built-in services.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer

pub mod balancer;
pub mod builtin;
pub mod dispatcher;
pub mod hooks;
pub mod plugin_loader;
pub mod rpc_context;
