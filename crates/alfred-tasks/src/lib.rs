// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod periodic;
mod runner;

pub use periodic::PeriodicScheduler;
pub use runner::{TaskFuture, TaskHandler, TaskRunner};
