// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Infrastructure adapters: the event bus, datastore drivers, event source
//! supervision, event persistence, session authentication and login tokens.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer

pub mod auth;
pub mod datastore;
pub mod event_bus;
pub mod event_log;
pub mod event_source;
pub mod token_store;
