// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Driver module - container runtime backends.

mod command;
pub mod docker;
pub mod lxc;
pub mod mock;
mod parse;
mod traits;

pub use docker::DockerDriver;
pub use lxc::LxcDriver;
pub use mock::{MockCall, MockDriver, MockOp};
pub use traits::*;
