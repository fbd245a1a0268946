// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Services bound by every dispatcher before plugins load.

mod discovery;
mod management;
mod task;

pub use discovery::DiscoveryService;
pub use management::ManagementService;
pub use task::TaskService;
