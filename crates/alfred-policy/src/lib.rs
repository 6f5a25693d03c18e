// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod engine;

pub use engine::{decision, ToolProfile, RiskTier, SAFE_DURING_LOCKDOWN, SESSION_TOOLS};
