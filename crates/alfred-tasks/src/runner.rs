// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// The future a task handler produces.  Handler failures are logged by the
/// runner and never crash it.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A named task implementation.  Implemented for plain closures.
pub trait TaskHandler: Send + Sync {
    fn call(&self, kwargs: Value) -> TaskFuture;
}

impl<F> TaskHandler for F
where
    F: Fn(Value) -> TaskFuture + Send + Sync,
{
    fn call(&self, kwargs: Value) -> TaskFuture {
        self(kwargs)
    }
}

struct BackgroundLoop {
    handle: Handle,
    stop: tokio::sync::mpsc::UnboundedSender<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Lightweight fire-and-forget task dispatcher for the local runtime.
///
/// Queue labels are advisory; dispatch is in-order-enough with bounded
/// parallelism.  `send_task` works from both async and sync call sites: when
/// no tokio runtime is ambient, a background runtime thread is spawned
/// lazily and reused.
pub struct TaskRunner {
    registry: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    shutting_down: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    background: Mutex<Option<BackgroundLoop>>,
}

impl TaskRunner {
    pub fn new(max_concurrent: usize) -> Self {
        let limit = max_concurrent.max(1);
        Self {
            registry: RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(limit)),
            max_concurrent: limit,
            shutting_down: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(Vec::new()),
            background: Mutex::new(None),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn register(&self, name: &str, handler: Arc<dyn TaskHandler>) {
        self.registry
            .write()
            .expect("registry lock")
            .insert(name.to_string(), handler);
    }

    /// Dispatch `name` with `kwargs`.  Returns `false` when the runner is
    /// shutting down or the name is unregistered.
    pub fn send_task(&self, name: &str, kwargs: Value, queue: Option<&str>) -> bool {
        let _ = queue; // advisory label only
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!(task = name, "task runner is shutting down; skipping task");
            return false;
        }
        let handler = {
            let registry = self.registry.read().expect("registry lock");
            match registry.get(name) {
                Some(handler) => Arc::clone(handler),
                None => {
                    error!(task = name, "unknown task");
                    return false;
                }
            }
        };

        let task_name = name.to_string();
        let semaphore = Arc::clone(&self.semaphore);
        let in_flight = Arc::clone(&self.in_flight);
        let fut = async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            in_flight.fetch_add(1, Ordering::SeqCst);
            if let Err(err) = handler.call(kwargs).await {
                error!(task = %task_name, error = %err, "task failed");
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);
        };

        let join = match Handle::try_current() {
            Ok(handle) => handle.spawn(fut),
            Err(_) => match self.ensure_background() {
                Some(handle) => handle.spawn(fut),
                None => {
                    error!(task = name, "failed to create task runner loop thread");
                    return false;
                }
            },
        };
        let mut handles = self.handles.lock().expect("handles lock");
        handles.retain(|h| !h.is_finished());
        handles.push(join);
        true
    }

    /// Drain in-flight tasks up to `timeout`, then cancel the rest and stop
    /// the background loop thread if one was spawned.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("handles lock");
            guard.drain(..).collect()
        };
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let drain = futures::future::join_all(handles.into_iter().map(|h| async move {
            let _ = h.await;
        }));
        if tokio::time::timeout(timeout.max(Duration::from_secs(1)), drain)
            .await
            .is_err()
        {
            warn!("task runner shutdown timed out; cancelling remaining tasks");
            for abort in aborts {
                abort.abort();
            }
        }

        let background = self.background.lock().expect("background lock").take();
        if let Some(mut background) = background {
            let _ = background.stop.send(());
            if let Some(thread) = background.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn ensure_background(&self) -> Option<Handle> {
        let mut guard = self.background.lock().expect("background lock");
        if let Some(background) = guard.as_ref() {
            return Some(background.handle.clone());
        }
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .ok()?;
        let handle = runtime.handle().clone();
        let (stop_tx, mut stop_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let thread = std::thread::Builder::new()
            .name("alfred-task-runner".to_string())
            .spawn(move || {
                runtime.block_on(async {
                    let _ = stop_rx.recv().await;
                });
                runtime.shutdown_timeout(Duration::from_secs(2));
            })
            .ok()?;
        *guard = Some(BackgroundLoop {
            handle: handle.clone(),
            stop: stop_tx,
            thread: Some(thread),
        });
        Some(handle)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
