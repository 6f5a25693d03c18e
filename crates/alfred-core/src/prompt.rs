// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Prompt assembly under a token budget.
//!
//! Sections pack in a fixed order; when the budget is tight, memory context
//! gives way first, then the conversation tail, then the long summary.
//! Token counts use the chars/4 heuristic shared with the session layer.

use std::collections::BTreeMap;

use alfred_tools::ToolSchema;

const CLIP_MARK: char = '\u{2026}';

/// Everything the builder needs for one prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptInput {
    pub system_context: String,
    pub summary_short: String,
    pub summary_long: String,
    pub memory_chunks: Vec<String>,
    pub tail: Vec<String>,
    pub token_budget: usize,
    pub max_memory_items: usize,
    pub tools: Vec<ToolSchema>,
}

/// Section accounting for the `prompt.build` event.
#[derive(Debug, Clone, Default)]
pub struct PromptReport {
    pub prompt_mode: &'static str,
    /// Section name → included size in tokens.
    pub sections: BTreeMap<&'static str, usize>,
    pub clipped: bool,
}

fn approx_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

fn clip_to_tokens(text: &str, budget_tokens: usize) -> (String, bool) {
    let budget_chars = budget_tokens * 4;
    if text.chars().count() <= budget_chars {
        return (text.to_string(), false);
    }
    let clipped: String = text.chars().take(budget_chars.saturating_sub(1)).collect();
    (format!("{clipped}{CLIP_MARK}"), true)
}

/// Build `(system_part, user_part, report)`.
///
/// The system part carries the system context and a `## Tooling` section
/// listing the available tool schemas; the user part carries `[summary.*]`,
/// `[context]` and `[tail]` sections.
pub fn build_prompt_with_report(input: &PromptInput) -> (String, String, PromptReport) {
    let budget = input.token_budget.max(2);
    let mut report = PromptReport {
        prompt_mode: "full",
        ..Default::default()
    };

    let mut system_part = format!("[system]\n{}\n", input.system_context);
    if !input.tools.is_empty() {
        system_part.push_str("\n## Tooling\n");
        for tool in &input.tools {
            system_part.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        }
    }

    // Budget shares per user-part section; memory shrinks first, then the
    // tail, then the long summary.
    let memory_chunks: Vec<&str> = input
        .memory_chunks
        .iter()
        .take(input.max_memory_items.max(1))
        .map(String::as_str)
        .collect();
    let mut remaining = budget.saturating_sub(approx_tokens(&system_part));
    if remaining < budget / 4 {
        remaining = budget / 4;
        report.prompt_mode = "clipped";
    }

    let short_budget = (remaining / 8).max(1);
    let long_budget = (remaining / 4).max(1);
    let memory_budget = (remaining / 4).max(1);
    let tail_budget = remaining
        .saturating_sub(short_budget + long_budget + memory_budget)
        .max(1);

    let (short, short_clipped) = clip_to_tokens(&input.summary_short, short_budget);
    let (long, long_clipped) = clip_to_tokens(&input.summary_long, long_budget);
    let (memory, memory_clipped) = clip_to_tokens(&memory_chunks.join("\n"), memory_budget);
    let (tail, tail_clipped) = clip_to_tokens(&input.tail.join("\n"), tail_budget);
    report.clipped = short_clipped || long_clipped || memory_clipped || tail_clipped;
    if report.clipped {
        report.prompt_mode = "clipped";
    }

    let mut user_part = String::new();
    user_part.push_str(&format!("[summary.short]\n{short}\n"));
    user_part.push_str(&format!("[summary.long]\n{long}\n"));
    user_part.push_str(&format!("[context]\n{memory}\n"));
    user_part.push_str(&format!("[tail]\n{tail}\n"));

    report.sections.insert("system", approx_tokens(&system_part));
    report.sections.insert("summary.short", approx_tokens(&short));
    report.sections.insert("summary.long", approx_tokens(&long));
    report.sections.insert("context", approx_tokens(&memory));
    report.sections.insert("tail", approx_tokens(&tail));

    (system_part, user_part, report)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
