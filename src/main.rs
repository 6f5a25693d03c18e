// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::warn;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use alfred_channels::ChannelRegistry;
use alfred_config::Settings;
use alfred_core::{register_core_tasks, run_agent_step, StepContext, StepOutcome};
use alfred_model::{
    BrokerMgmtProbe, MockProvider, ModelProvider, OpenAiCompatProvider, ProviderRouter,
};
use alfred_store::{queries, Db};
use alfred_tasks::{PeriodicScheduler, TaskRunner};
use alfred_tools::builtin::{
    EchoTool, KnowledgeSearchTool, MemorySearchTool, SessionHistoryTool, SessionListTool,
    SessionSendTool,
};
use alfred_tools::{ToolRegistry, ToolRuntime};

use cli::{Cli, Commands};

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = Settings::from_env();
    if let Err(err) = settings.validate_for_env() {
        eprintln!("configuration error: {err}");
        std::process::exit(EXIT_USAGE);
    }

    let code = match run(cli, settings).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            EXIT_FAILURE
        }
    };
    std::process::exit(code);
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli, settings: Settings) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Ask {
            message,
            user_id,
            thread,
            new_thread,
            enqueue,
            timeout_s,
            json,
        } => {
            let ctx = build_context(&settings).await?;
            let code = ask(
                &ctx, &message, &user_id, thread.as_deref(), new_thread, enqueue, timeout_s, json,
            )
            .await;
            drain_runner(&ctx).await;
            code
        }
        Commands::Chat { user_id } => {
            let ctx = build_context(&settings).await?;
            chat(&ctx, &user_id).await
        }
        Commands::TestGates { fail_fast, json } => test_gates(fail_fast, json),
    }
}

fn provider_for(name: &str, base_url: &str, model: &str) -> Arc<dyn ModelProvider> {
    if base_url.is_empty() {
        // Unconfigured dev environments get the scripted mock lane.
        Arc::new(MockProvider::with_text(
            name,
            "No model provider is configured; set MODEL_PRIMARY_BASE_URL.",
        ))
    } else {
        Arc::new(OpenAiCompatProvider::new(name, base_url, model, None))
    }
}

/// Wire the runtime: store, tools, providers, runner, core tasks.
async fn build_context(settings: &Settings) -> anyhow::Result<Arc<StepContext>> {
    let db = Db::at_path(Path::new(&settings.app_db)).context("opening the database")?;
    let runner = Arc::new(TaskRunner::new(settings.task_runner_max_concurrent));

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(SessionListTool);
    registry.register(SessionHistoryTool);
    registry.register(SessionSendTool::new(Arc::clone(&runner)));
    registry.register(KnowledgeSearchTool);
    registry.register(MemorySearchTool);
    let registry = Arc::new(registry);

    {
        let conn = db.open()?;
        queries::ensure_system_state(&conn)?;
        queries::ensure_principal(&conn, "main", "agent")?;
        for tool in registry.names() {
            queries::grant_permission(&conn, "main", &tool)?;
        }
    }

    let router = Arc::new(ProviderRouter::new(
        provider_for(
            "primary",
            &settings.model_primary_base_url,
            &settings.model_primary_name,
        ),
        provider_for(
            "fallback",
            &settings.model_fallback_base_url,
            &settings.model_fallback_name,
        ),
        Arc::new(BrokerMgmtProbe::new(
            settings.broker_mgmt_url.clone(),
            settings.broker_mgmt_user.clone(),
            settings.broker_mgmt_password.clone(),
        )),
        settings.queue_threshold_local_llm,
    ));

    let ctx = Arc::new(StepContext {
        db,
        settings: settings.clone(),
        runtime: ToolRuntime::new(registry),
        router,
        runner,
        channels: Arc::new(ChannelRegistry::new()),
        notifications: None,
    });
    register_core_tasks(Arc::clone(&ctx));
    Ok(ctx)
}

fn classify_error(message: &str) -> &'static str {
    let lowered = message.to_lowercase();
    if lowered.contains("dns") || lowered.contains("name resolution") {
        "dns_resolution"
    } else if lowered.contains("timed out") || lowered.contains("timeout") {
        "timeout"
    } else if lowered.contains("unreachable") || lowered.contains("connection refused") {
        "network_unreachable"
    } else if lowered.contains("provider") || lowered.contains("model") {
        "provider_unavailable"
    } else {
        "internal"
    }
}

fn print_failure(json: bool, message: &str) -> i32 {
    if json {
        println!(
            "{}",
            json!({
                "ok": false,
                "error": { "code": classify_error(message), "message": message },
            })
        );
    } else {
        eprintln!("error: {message}");
    }
    EXIT_FAILURE
}

#[allow(clippy::too_many_arguments)]
async fn ask(
    ctx: &Arc<StepContext>,
    message: &str,
    user_id: &str,
    thread: Option<&str>,
    new_thread: bool,
    enqueue: bool,
    timeout_s: u64,
    json: bool,
) -> anyhow::Result<i32> {
    let (thread_id, user_msg_created_at) = {
        let conn = ctx.db.open()?;
        let user = queries::ensure_user(&conn, user_id)?;
        let channel = queries::ensure_channel(&conn, &user, "cli")?;
        let thread_id = match thread {
            Some(explicit) => {
                if queries::thread_owner(&conn, explicit)?.is_none() {
                    eprintln!("unknown thread: {explicit}");
                    return Ok(EXIT_USAGE);
                }
                explicit.to_string()
            }
            None if new_thread => queries::create_thread(&conn, &user, &channel)?,
            None => queries::ensure_open_thread(&conn, &user, &channel)?,
        };
        let message_id = queries::insert_message(&conn, &thread_id, "user", message)?;
        let created_at: String = conn.query_row(
            "SELECT created_at FROM messages WHERE id = ?1",
            [&message_id],
            |row| row.get(0),
        )?;
        (thread_id, created_at)
    };

    let trace_id = alfred_store::new_id("trc");
    let timeout = Duration::from_secs(timeout_s.max(1));

    let reply = if enqueue {
        let queued = ctx.runner.send_task(
            "agent_step",
            json!({"trace_id": trace_id, "thread_id": thread_id, "actor_id": "main"}),
            Some("agent_default"),
        );
        if !queued {
            return Ok(print_failure(json, "task runner refused the step"));
        }
        wait_for_reply(ctx, &thread_id, &user_msg_created_at, timeout).await
    } else {
        match tokio::time::timeout(timeout, run_agent_step(ctx, &trace_id, &thread_id, "main"))
            .await
        {
            Err(_) => Err("agent step timed out".to_string()),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Ok(Ok(StepOutcome::Replied { text, .. })) => Ok(text),
            Ok(Ok(StepOutcome::Skipped { reason })) => Err(format!("step skipped: {reason}")),
            Ok(Ok(StepOutcome::Failed { trace_id })) => {
                Err(format!("provider unavailable (trace {trace_id})"))
            }
        }
    };

    match reply {
        Ok(text) => {
            if json {
                println!(
                    "{}",
                    json!({"ok": true, "reply": text, "thread_id": thread_id, "trace_id": trace_id})
                );
            } else {
                println!("{text}");
            }
            Ok(EXIT_OK)
        }
        Err(message) => Ok(print_failure(json, &message)),
    }
}

/// Poll for an assistant message appended after the user's message.
async fn wait_for_reply(
    ctx: &Arc<StepContext>,
    thread_id: &str,
    after: &str,
    timeout: Duration,
) -> Result<String, String> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        {
            let conn = ctx.db.open().map_err(|err| err.to_string())?;
            let reply: Option<String> = conn
                .query_row(
                    "SELECT content FROM messages \
                     WHERE thread_id = ?1 AND role = 'assistant' AND created_at > ?2 \
                     ORDER BY created_at DESC LIMIT 1",
                    (thread_id, after),
                    |row| row.get(0),
                )
                .ok();
            if let Some(reply) = reply {
                return Ok(reply);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err("timed out waiting for the assistant reply".to_string());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Drain in-flight tasks (outbound sends, delegated steps) before exit.
async fn drain_runner(ctx: &Arc<StepContext>) {
    ctx.runner
        .shutdown(Duration::from_secs(
            ctx.settings.task_runner_shutdown_timeout_seconds,
        ))
        .await;
}

async fn chat(ctx: &Arc<StepContext>, user_id: &str) -> anyhow::Result<i32> {
    println!("alfred chat - /quit to exit");

    // A chat session is long-lived, so the periodic loop runs alongside it:
    // user-defined schedules tick, old events age out, threads compact.
    let periodic = Arc::new(PeriodicScheduler::new(Arc::clone(&ctx.runner)));
    periodic.add("scheduler_tick", Duration::from_secs(5), json!({}));
    periodic.add("periodic_compaction", Duration::from_secs(600), json!({}));
    periodic.add("event_maintenance", Duration::from_secs(3600), json!({}));
    let periodic_task = {
        let periodic = Arc::clone(&periodic);
        tokio::spawn(async move { periodic.run().await })
    };

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        let code = ask(ctx, line, user_id, None, false, false, 60, false).await?;
        if code != EXIT_OK {
            warn!("turn failed");
        }
    }

    periodic.shutdown();
    let _ = periodic_task.await;
    drain_runner(ctx).await;
    Ok(EXIT_OK)
}

struct Gate {
    name: &'static str,
    command: &'static str,
}

/// Ordered quality gates.  `test-gates` is enforce-mode: any failure exits
/// non-zero.
const GATES: &[Gate] = &[
    Gate { name: "fmt", command: "cargo fmt --all --check" },
    Gate { name: "unit", command: "cargo test --workspace --quiet" },
];

fn test_gates(fail_fast: bool, json: bool) -> anyhow::Result<i32> {
    let mut results = Vec::new();
    let mut failed = false;
    for gate in GATES {
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg(gate.command)
            .status()
            .with_context(|| format!("spawning gate {}", gate.name))?;
        let passed = status.success();
        results.push((gate.name, passed));
        if !passed {
            failed = true;
            if fail_fast {
                break;
            }
        }
    }

    if json {
        println!(
            "{}",
            json!({
                "ok": !failed,
                "gates": results
                    .iter()
                    .map(|(name, passed)| json!({"name": name, "passed": passed}))
                    .collect::<Vec<_>>(),
            })
        );
    } else {
        for (name, passed) in &results {
            println!("{name}: {}", if *passed { "pass" } else { "FAIL" });
        }
        println!("{}", if failed { "gates failed" } else { "all gates passed" });
    }
    Ok(if failed { EXIT_FAILURE } else { EXIT_OK })
}
