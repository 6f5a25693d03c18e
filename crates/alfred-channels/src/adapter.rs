// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Error in channel send/receive operations.  Transport errors are
/// retryable; the dispatcher's backoff loop consumes them.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ChannelError {
    pub message: String,
    pub retryable: bool,
}

impl ChannelError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// One normalized inbound message from a channel webhook payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub external_msg_id: String,
    pub sender_id: String,
    pub text: String,
}

/// A messaging channel backend (WhatsApp, Telegram, …).
///
/// `send_text` returns the transport HTTP status; the dispatcher owns the
/// retry policy, adapters stay single-shot.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel type key (`"whatsapp"`, `"telegram"`, `"cli"`).
    fn channel_type(&self) -> &str;

    async fn send_text(&self, recipient: &str, text: &str) -> Result<u16, ChannelError>;

    /// Parse a raw webhook payload into inbound messages.  History-sync
    /// frames (`data.type == "append"`, case-insensitive) are not real
    /// traffic and must be discarded here.
    fn parse_inbound(&self, payload: &Value) -> Vec<InboundMessage>;

    /// Best-effort typing indicator; default is a no-op.
    async fn send_presence(&self, _recipient: &str, _presence: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Whether this adapter supports presence updates.
    fn supports_presence(&self) -> bool {
        false
    }
}

/// Shared helper for adapters: `true` when the frame is a history-sync
/// replay that must be dropped.
pub fn is_history_sync_frame(payload: &Value) -> bool {
    payload
        .pointer("/data/type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.eq_ignore_ascii_case("append"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn history_sync_frames_are_detected_case_insensitively() {
        assert!(is_history_sync_frame(&json!({"data": {"type": "append"}})));
        assert!(is_history_sync_frame(&json!({"data": {"type": "APPEND"}})));
        assert!(!is_history_sync_frame(&json!({"data": {"type": "message"}})));
        assert!(!is_history_sync_frame(&json!({"no_data": true})));
    }

    #[test]
    fn transport_errors_are_retryable() {
        assert!(ChannelError::transport("connection reset").retryable);
    }
}
