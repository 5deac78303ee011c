//! Long-lived worker pool and the run-scoped cancellation token.
//!
//! Workers pull from a single FIFO queue; a panicking task is promoted
//! to an error on its handle and the worker keeps serving. Shutdown is
//! orderly: the queue closes, outstanding tasks drain, then the threads
//! are joined.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Default worker count: leave one core for the rest of the system and
/// never spawn more than four encoders at once.
pub fn default_workers() -> usize {
    let cores = num_cpus::get();
    cores.saturating_sub(1).clamp(1, 4)
}

/// Cooperative cancellation flag shared by a run and its jobs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPanicked {
    pub detail: String,
}

impl std::fmt::Display for TaskPanicked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker task panicked: {}", self.detail)
    }
}

impl std::error::Error for TaskPanicked {}

/// Handle to one submitted task's eventual result.
pub struct TaskHandle<T> {
    rx: Receiver<Result<T, TaskPanicked>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes. A disconnected channel means the
    /// pool was torn down before the task ran.
    pub fn wait(self) -> Result<T, TaskPanicked> {
        self.rx.recv().unwrap_or_else(|_| {
            Err(TaskPanicked {
                detail: "pool shut down before the task completed".into(),
            })
        })
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("optimise-worker-{id}"))
                    .spawn(move || loop {
                        // Take one job while holding the lock, release
                        // it before running so other workers keep
                        // pulling.
                        let job = {
                            let guard = receiver.lock().unwrap_or_else(|e| e.into_inner());
                            guard.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            sender: Some(sender),
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task; strictly FIFO to free workers.
    pub fn submit<T, F>(&self, task: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = channel();
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(task)).map_err(|payload| {
                let detail = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                tracing::error!(detail = %detail, "worker task panicked");
                TaskPanicked { detail }
            });
            let _ = tx.send(result);
        });

        if let Some(sender) = &self.sender {
            // A send failure means every worker died; the handle will
            // report the disconnect.
            let _ = sender.send(job);
        }
        TaskHandle { rx }
    }

    /// Close the queue and join the workers after outstanding tasks
    /// drain.
    pub fn shutdown(mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
