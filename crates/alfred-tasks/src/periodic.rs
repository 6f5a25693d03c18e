// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use crate::runner::TaskRunner;

struct Entry {
    name: String,
    interval: Duration,
    kwargs: Value,
    next_run: Instant,
}

/// Fires registered tasks on fixed intervals.
///
/// Entries advance from the firing time, so a late tick does not cause
/// catch-up bursts; dispatch failures are logged and the entry still
/// advances.
pub struct PeriodicScheduler {
    runner: Arc<TaskRunner>,
    entries: Mutex<Vec<Entry>>,
    stopped: AtomicBool,
    notify: Notify,
}

impl PeriodicScheduler {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        Self {
            runner,
            entries: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn add(&self, name: &str, interval: Duration, kwargs: Value) {
        let interval = interval.max(Duration::from_secs(1));
        self.entries.lock().expect("entries lock").push(Entry {
            name: name.to_string(),
            interval,
            kwargs,
            next_run: Instant::now() + interval,
        });
    }

    /// Tick loop; returns after [`shutdown`](Self::shutdown).
    pub async fn run(&self) {
        while !self.stopped.load(Ordering::SeqCst) {
            let now = Instant::now();
            {
                let mut entries = self.entries.lock().expect("entries lock");
                for entry in entries.iter_mut() {
                    if now < entry.next_run {
                        continue;
                    }
                    let ok =
                        self.runner
                            .send_task(&entry.name, entry.kwargs.clone(), None);
                    if !ok {
                        warn!(task = %entry.name, "failed to dispatch periodic task");
                    }
                    entry.next_run = now + entry.interval;
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
