// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use alfred_model::RouterHealth;
use alfred_store::queries::SystemState;

/// Split a leading-slash command into `(command, args)`.  Returns `None` for
/// plain text.
pub fn parse_command(text: &str) -> Option<(String, Vec<String>)> {
    if !text.starts_with('/') {
        return None;
    }
    let mut tokens = text.split_whitespace();
    let command = tokens.next()?.to_lowercase();
    Some((command, tokens.map(str::to_string).collect()))
}

/// Commands the orchestrator answers without a model call.
pub(crate) fn is_known_command(command: &str) -> bool {
    matches!(command, "/status" | "/help")
}

pub(crate) fn status_reply(state: &SystemState, health: &RouterHealth) -> String {
    let lockdown = if state.lockdown {
        format!("on ({})", state.lockdown_reason)
    } else {
        "off".to_string()
    };
    format!(
        "status: ok | lockdown: {lockdown} | restarting: {} | providers: primary={} fallback={}",
        if state.restarting { "yes" } else { "no" },
        if health.primary { "up" } else { "down" },
        if health.fallback { "up" } else { "down" },
    )
}

pub(crate) fn help_reply() -> String {
    "commands: /status (system and provider health), /help (this text), /quit (leave chat)"
        .to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert!(parse_command("hello there").is_none());
        assert!(parse_command("").is_none());
    }

    #[test]
    fn commands_are_lowercased_and_split() {
        let (command, args) = parse_command("/Status now please").unwrap();
        assert_eq!(command, "/status");
        assert_eq!(args, vec!["now", "please"]);
    }

    #[test]
    fn status_reply_mentions_providers() {
        let reply = status_reply(
            &SystemState::default(),
            &RouterHealth { primary: true, fallback: false },
        );
        assert!(reply.contains("providers"));
        assert!(reply.contains("primary=up"));
        assert!(reply.contains("fallback=down"));
    }

    #[test]
    fn status_reply_reports_lockdown_reason() {
        let state = SystemState {
            lockdown: true,
            lockdown_reason: "readyz_fail_streak".to_string(),
            ..SystemState::default()
        };
        let reply = status_reply(&state, &RouterHealth { primary: true, fallback: true });
        assert!(reply.contains("lockdown: on (readyz_fail_streak)"));
    }

    #[test]
    fn known_commands() {
        assert!(is_known_command("/status"));
        assert!(is_known_command("/help"));
        assert!(!is_known_command("/deploy"));
    }
}
