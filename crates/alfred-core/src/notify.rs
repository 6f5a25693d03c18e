// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use tokio::sync::mpsc;

/// Notifications emitted by the orchestrator during a step.  Consumers
/// (CLI, UIs) subscribe to drive progress display; every send is
/// best-effort and never blocks the step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentNotification {
    /// The step started working on a thread.
    Thinking { thread_id: String },
    /// The primary lane failed and the fallback answered.
    Fallback { primary_error: String },
    /// The step delegated work to another agent.
    Delegated { to_agent_id: String },
    /// The step finished, successfully or not.
    Done { thread_id: String },
}

pub(crate) fn notify(
    sender: &Option<mpsc::Sender<AgentNotification>>,
    notification: AgentNotification,
) {
    if let Some(sender) = sender {
        let _ = sender.try_send(notification);
    }
}
