// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
/// Truncate a model reply at the first control-token marker.
///
/// Some backends leak raw harmony-style control tokens (`<|end|>`,
/// `<|start|>assistant<|channel|>…`) into the text channel.  Everything from
/// the first `<|` on is dropped; plain text passes through untouched.
pub fn strip_control_tokens(text: &str) -> String {
    match text.find("<|") {
        Some(idx) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
