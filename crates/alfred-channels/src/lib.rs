// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod adapter;
mod dispatch;
mod registry;

pub use adapter::{is_history_sync_frame, ChannelAdapter, ChannelError, InboundMessage};
pub use dispatch::{send_channel_message, DispatchOutcome};
pub use registry::ChannelRegistry;
