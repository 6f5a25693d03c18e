// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Invalid or missing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("missing parent directory for APP_DB: {0}")]
    MissingDbParent(String),
}

/// Deployment environment; `prod` turns validation warnings into hard errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppEnv {
    #[default]
    Dev,
    Prod,
}

impl FromStr for AppEnv {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Ok(AppEnv::Prod),
            _ => Ok(AppEnv::Dev),
        }
    }
}

/// What happens when a memory write contains PII (emails, phone numbers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PiiRedactMode {
    Off,
    #[default]
    Mask,
    Deny,
}

impl FromStr for PiiRedactMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(PiiRedactMode::Off),
            "mask" => Ok(PiiRedactMode::Mask),
            "deny" => Ok(PiiRedactMode::Deny),
            other => Err(other.to_string()),
        }
    }
}

/// Runtime settings.  Every knob comes from the environment so the binary
/// can run unconfigured in `dev`; `prod` validation is strict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// SQLite database file path
    pub app_db: String,
    pub app_env: AppEnv,

    // ── Task runner ──────────────────────────────────────────────────────────
    /// Bounded parallelism of the in-process task runner
    pub task_runner_max_concurrent: usize,
    /// Graceful drain cap for `TaskRunner::shutdown`
    pub task_runner_shutdown_timeout_seconds: u64,

    // ── Scheduler ─────────────────────────────────────────────────────────────
    /// Default catch-up ceiling per schedule when the row carries none
    pub scheduler_max_catchup: u32,

    // ── Backpressure thresholds (0 disables the check) ───────────────────────
    pub queue_threshold_local_llm: u64,
    pub queue_threshold_agent_priority: u64,
    pub queue_threshold_agent_default: u64,
    pub queue_threshold_tools_io: u64,

    // ── Lockdown triggers ─────────────────────────────────────────────────────
    /// Consecutive readyz failures that flip the system into lockdown
    pub lockdown_readyz_fail_threshold: u32,
    /// Exec-host failure count that flips the system into lockdown
    pub lockdown_exec_host_fail_threshold: u32,

    // ── Memory governance ─────────────────────────────────────────────────────
    pub memory_secret_scan_enabled: bool,
    pub memory_pii_redact_mode: PiiRedactMode,

    // ── Retention / approvals ────────────────────────────────────────────────
    pub event_retention_days: u32,
    pub approval_ttl_minutes: u32,
    /// File holding the admin unlock code; rotated out of band
    pub admin_unlock_code_path: String,

    // ── Broker management API (backpressure probe) ───────────────────────────
    /// Empty string disables the overload probe entirely
    pub broker_mgmt_url: String,
    pub broker_mgmt_user: String,
    pub broker_mgmt_password: String,

    // ── Model providers ───────────────────────────────────────────────────────
    pub model_primary_base_url: String,
    pub model_primary_name: String,
    pub model_fallback_base_url: String,
    pub model_fallback_name: String,

    // ── Prompt budget ─────────────────────────────────────────────────────────
    pub prompt_token_budget: usize,
    pub prompt_max_memory_items: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_db: "alfred.db".to_string(),
            app_env: AppEnv::Dev,
            task_runner_max_concurrent: 8,
            task_runner_shutdown_timeout_seconds: 10,
            scheduler_max_catchup: 10,
            queue_threshold_local_llm: 0,
            queue_threshold_agent_priority: 0,
            queue_threshold_agent_default: 0,
            queue_threshold_tools_io: 0,
            lockdown_readyz_fail_threshold: 3,
            lockdown_exec_host_fail_threshold: 5,
            memory_secret_scan_enabled: true,
            memory_pii_redact_mode: PiiRedactMode::Mask,
            event_retention_days: 30,
            approval_ttl_minutes: 15,
            admin_unlock_code_path: "admin_unlock_code".to_string(),
            broker_mgmt_url: String::new(),
            broker_mgmt_user: String::new(),
            broker_mgmt_password: String::new(),
            model_primary_base_url: String::new(),
            model_primary_name: "primary".to_string(),
            model_fallback_base_url: String::new(),
            model_fallback_name: "fallback".to_string(),
            prompt_token_budget: 6000,
            prompt_max_memory_items: 5,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr + Copy>(key: &'static str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "unparseable env value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &'static str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.trim(), "1" | "true" | "TRUE" | "yes" | "on"),
        Err(_) => default,
    }
}

impl Settings {
    /// Build settings from the process environment, falling back to defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let d = Settings::default();
        Settings {
            app_db: env_string("APP_DB", &d.app_db),
            app_env: env_string("APP_ENV", "dev").parse().unwrap_or_default(),
            task_runner_max_concurrent: env_parse(
                "TASK_RUNNER_MAX_CONCURRENT",
                d.task_runner_max_concurrent,
            ),
            task_runner_shutdown_timeout_seconds: env_parse(
                "TASK_RUNNER_SHUTDOWN_TIMEOUT_SECONDS",
                d.task_runner_shutdown_timeout_seconds,
            ),
            scheduler_max_catchup: env_parse("SCHEDULER_MAX_CATCHUP", d.scheduler_max_catchup),
            queue_threshold_local_llm: env_parse(
                "QUEUE_THRESHOLD_LOCAL_LLM",
                d.queue_threshold_local_llm,
            ),
            queue_threshold_agent_priority: env_parse(
                "QUEUE_THRESHOLD_AGENT_PRIORITY",
                d.queue_threshold_agent_priority,
            ),
            queue_threshold_agent_default: env_parse(
                "QUEUE_THRESHOLD_AGENT_DEFAULT",
                d.queue_threshold_agent_default,
            ),
            queue_threshold_tools_io: env_parse(
                "QUEUE_THRESHOLD_TOOLS_IO",
                d.queue_threshold_tools_io,
            ),
            lockdown_readyz_fail_threshold: env_parse(
                "LOCKDOWN_READYZ_FAIL_THRESHOLD",
                d.lockdown_readyz_fail_threshold,
            ),
            lockdown_exec_host_fail_threshold: env_parse(
                "LOCKDOWN_EXEC_HOST_FAIL_THRESHOLD",
                d.lockdown_exec_host_fail_threshold,
            ),
            memory_secret_scan_enabled: env_bool(
                "MEMORY_SECRET_SCAN_ENABLED",
                d.memory_secret_scan_enabled,
            ),
            memory_pii_redact_mode: env_string("MEMORY_PII_REDACT_MODE", "mask")
                .parse()
                .unwrap_or_default(),
            event_retention_days: env_parse("EVENT_RETENTION_DAYS", d.event_retention_days),
            approval_ttl_minutes: env_parse("APPROVAL_TTL_MINUTES", d.approval_ttl_minutes),
            admin_unlock_code_path: env_string(
                "ADMIN_UNLOCK_CODE_PATH",
                &d.admin_unlock_code_path,
            ),
            broker_mgmt_url: env_string("BROKER_MGMT_URL", ""),
            broker_mgmt_user: env_string("BROKER_MGMT_USER", ""),
            broker_mgmt_password: env_string("BROKER_MGMT_PASSWORD", ""),
            model_primary_base_url: env_string("MODEL_PRIMARY_BASE_URL", ""),
            model_primary_name: env_string("MODEL_PRIMARY_NAME", &d.model_primary_name),
            model_fallback_base_url: env_string("MODEL_FALLBACK_BASE_URL", ""),
            model_fallback_name: env_string("MODEL_FALLBACK_NAME", &d.model_fallback_name),
            prompt_token_budget: env_parse("PROMPT_TOKEN_BUDGET", d.prompt_token_budget),
            prompt_max_memory_items: env_parse(
                "PROMPT_MAX_MEMORY_ITEMS",
                d.prompt_max_memory_items,
            ),
        }
    }

    /// Preflight validation.  `dev` tolerates a missing DB parent directory
    /// (it is created on connect); `prod` refuses to start on anything
    /// suspicious.
    pub fn validate_for_env(&self) -> Result<(), ConfigError> {
        if self.task_runner_max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TASK_RUNNER_MAX_CONCURRENT",
                value: "0".to_string(),
            });
        }
        if self.event_retention_days == 0 {
            return Err(ConfigError::InvalidValue {
                key: "EVENT_RETENTION_DAYS",
                value: "0".to_string(),
            });
        }
        if self.app_env == AppEnv::Prod {
            let parent = Path::new(&self.app_db).parent();
            if let Some(parent) = parent {
                if !parent.as_os_str().is_empty() && !parent.is_dir() {
                    return Err(ConfigError::MissingDbParent(
                        parent.to_string_lossy().into_owned(),
                    ));
                }
            }
            if self.model_primary_base_url.is_empty() && self.model_fallback_base_url.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "MODEL_PRIMARY_BASE_URL",
                    value: "<empty>".to_string(),
                });
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
