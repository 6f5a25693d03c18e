// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cron;
mod service;
mod tick;

pub use cron::{cron_matches, parse_interval_seconds, CronError};
pub use service::{
    estimate_schedule_backlog, fetch_due_schedules_report, DueDispatch, ScheduleMetric,
};
pub use tick::{scheduler_tick, TickSummary};
