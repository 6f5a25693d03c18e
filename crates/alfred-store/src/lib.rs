// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod connection;
mod ids;
mod migrations;
pub mod queries;

pub use connection::{connect, connect_at, open_in_memory, with_tx, Db, StoreError};
pub use ids::{new_id, now_iso};
pub use migrations::run_migrations;

pub use rusqlite::Connection;
