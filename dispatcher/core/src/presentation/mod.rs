// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Presentation layer: the JSON frame protocol and its WebSocket endpoint.
//!
//! # Architecture
//!
//! - **Layer:** Presentation Layer

pub mod connection;
pub mod protocol;
pub mod ws;

pub use connection::{Connection, Outbound};
pub use protocol::Frame;
pub use ws::{bind, serve};
