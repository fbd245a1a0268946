// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain types shared by every layer of the dispatcher.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Data model and collaborator contracts, no I/O

pub mod error;
pub mod task;
pub mod event;
pub mod session;
pub mod service;
pub mod schema;
pub mod plugin;
pub mod repository;
pub mod node_config;
