// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod embed;
mod envelope;
mod maintenance;
mod redact;
mod writer;

pub use envelope::{enforce_action_envelope, requires_action_envelope};
pub use maintenance::{prune_events, PruneSummary};
pub use redact::redact_payload;
pub use writer::{emit, fetch_event, EventInput, StoredEvent};
