// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod commands;
mod context;
mod notify;
mod prompt;
mod step;
mod strip;
mod tasks;

pub use commands::parse_command;
pub use context::StepContext;
pub use notify::AgentNotification;
pub use prompt::{build_prompt_with_report, PromptInput, PromptReport};
pub use step::{run_agent_step, StepOutcome};
pub use strip::strip_control_tokens;
pub use tasks::register_core_tasks;
