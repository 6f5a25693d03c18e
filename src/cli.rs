// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};

/// Command-line surface of the alfred runtime.
#[derive(Parser, Debug)]
#[command(name = "alfred", version, about = "Multi-agent conversational assistant runtime")]
pub struct Cli {
    /// Verbose tracing to stderr (also honours RUST_LOG).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Insert a user message, run (or enqueue) the agent step, print the reply.
    Ask {
        /// The message to send.
        message: String,
        /// External user id the message belongs to.
        #[arg(long, default_value = "cli_user")]
        user_id: String,
        /// Target an explicit thread id instead of the user's open thread.
        #[arg(long)]
        thread: Option<String>,
        /// Start a fresh thread for this message.
        #[arg(long)]
        new_thread: bool,
        /// Enqueue the step on the task runner instead of running it inline,
        /// then wait for the reply.
        #[arg(long)]
        enqueue: bool,
        /// How long to wait for the assistant reply.
        #[arg(long, default_value_t = 30)]
        timeout_s: u64,
        /// Print a JSON envelope instead of plain text.
        #[arg(long)]
        json: bool,
    },

    /// Interactive REPL against the local runtime; `/quit` ends.
    Chat {
        #[arg(long, default_value = "cli_user")]
        user_id: String,
    },

    /// Run the ordered gate commands and summarize pass/fail.
    ///
    /// Exits non-zero when any gate fails (enforce mode).
    TestGates {
        /// Stop at the first failing gate.
        #[arg(long)]
        fail_fast: bool,
        /// Print the per-gate results as JSON.
        #[arg(long)]
        json: bool,
    },
}
