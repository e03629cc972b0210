//! Bounded worker pools.
//!
//! A pool owns a fixed number of named worker threads pulling boxed tasks
//! from a bounded queue. Two flavors exist:
//!
//! - [`TaskPool`]: fire-and-forget units of work.
//! - [`ResultPool`]: every unit returns a value, delivered on a result
//!   channel in completion order.
//!
//! Closing a pool lets workers drain whatever is still queued and exit.
//! Cancelling stops them at the next task boundary and abandons queued work;
//! it is meant for teardown only.
//!
//! A panicking task never takes its worker down: the panic is caught, logged,
//! and (for [`ResultPool`]) reported as [`PoolError::TaskPanicked`].

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, warn};

/// Unit of work accepted by [`TaskPool`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Unit of work accepted by [`ResultPool`].
pub type ResultTask<R> = Box<dyn FnOnce() -> R + Send + 'static>;

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),

    /// The pool no longer accepts work.
    #[error("task pool is closed")]
    Closed,

    /// The task panicked while running.
    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// The task was dropped without reporting back.
    #[error("task was dropped before completing")]
    TaskLost,
}

/// Cloneable handle used to queue work on a [`TaskPool`].
///
/// The pool only finishes draining once every submitter has been dropped.
#[derive(Clone)]
pub struct TaskSubmitter {
    tasks: Sender<Task>,
}

impl TaskSubmitter {
    /// Queues a task, blocking while the queue is full.
    pub fn submit(&self, task: Task) -> Result<(), PoolError> {
        self.tasks.send(task).map_err(|_| PoolError::Closed)
    }
}

/// Fixed-size pool of worker threads.
pub struct TaskPool {
    name: String,
    submitter: TaskSubmitter,
    cancel: Sender<()>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Spawns `workers` threads sharing a queue of `capacity` pending tasks.
    pub fn spawn(name: &str, workers: usize, capacity: usize) -> Result<Self, PoolError> {
        assert!(workers > 0, "pool needs at least one worker");

        let (task_tx, task_rx) = channel::bounded::<Task>(capacity);
        let (cancel_tx, cancel_rx) = channel::bounded::<()>(0);

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let task_rx = task_rx.clone();
            let cancel_rx = cancel_rx.clone();
            let pool_name = name.to_string();

            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || {
                    while let Some(task) = next_task(&task_rx, &cancel_rx) {
                        if let Err(message) = run_guarded(task) {
                            warn!("[{}] task panicked: {}", pool_name, message);
                        }
                    }
                    debug!("[{}] worker {} exiting", pool_name, index);
                })?;
            handles.push(handle);
        }

        debug!("spawned pool '{}' ({} workers, queue {})", name, workers, capacity);

        Ok(Self {
            name: name.to_string(),
            submitter: TaskSubmitter { tasks: task_tx },
            cancel: cancel_tx,
            workers: handles,
        })
    }

    /// Returns a handle for queueing work.
    #[must_use]
    pub fn submitter(&self) -> TaskSubmitter {
        self.submitter.clone()
    }

    /// Queues a task on this pool.
    pub fn submit(&self, task: Task) -> Result<(), PoolError> {
        self.submitter.submit(task)
    }

    /// Stops accepting work, waits for queued tasks to finish, joins workers.
    ///
    /// Outstanding [`TaskSubmitter`] clones keep the queue open; drop them
    /// first or this blocks until they are.
    pub fn close(self) {
        let Self {
            name,
            submitter,
            cancel,
            workers,
        } = self;

        drop(submitter);
        for handle in workers {
            let _ = handle.join();
        }
        drop(cancel);
        debug!("pool '{}' closed", name);
    }

    /// Stops workers at the next task boundary. Queued work is abandoned and
    /// running tasks are left to finish on their own.
    pub fn cancel(self) {
        let Self { name, cancel, .. } = self;
        drop(cancel);
        debug!("pool '{}' cancelled", name);
    }
}

/// Fixed-size pool whose tasks each produce a value.
pub struct ResultPool<R> {
    tasks: Option<Sender<ResultTask<R>>>,
    results: Receiver<Result<R, PoolError>>,
    cancel: Option<Sender<()>>,
}

impl<R: Send + 'static> ResultPool<R> {
    /// Spawns `workers` threads; both the task queue and the result channel
    /// hold `capacity` entries.
    pub fn spawn(name: &str, workers: usize, capacity: usize) -> Result<Self, PoolError> {
        assert!(workers > 0, "pool needs at least one worker");

        let (task_tx, task_rx) = channel::bounded::<ResultTask<R>>(capacity);
        let (result_tx, result_rx) = channel::bounded::<Result<R, PoolError>>(capacity);
        let (cancel_tx, cancel_rx) = channel::bounded::<()>(0);

        for index in 0..workers {
            let task_rx = task_rx.clone();
            let cancel_rx = cancel_rx.clone();
            let result_tx = result_tx.clone();
            let pool_name = name.to_string();

            thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || {
                    while let Some(task) = next_task(&task_rx, &cancel_rx) {
                        let result = run_guarded(task).map_err(|message| {
                            warn!("[{}] task panicked: {}", pool_name, message);
                            PoolError::TaskPanicked(message)
                        });
                        if result_tx.send(result).is_err() {
                            break;
                        }
                    }
                })?;
        }

        // Results close once the last worker drops its sender.
        drop(result_tx);

        Ok(Self {
            tasks: Some(task_tx),
            results: result_rx,
            cancel: Some(cancel_tx),
        })
    }

    /// Queues a task, blocking while the queue is full.
    pub fn submit(&self, task: ResultTask<R>) -> Result<(), PoolError> {
        match &self.tasks {
            Some(tasks) => tasks.send(task).map_err(|_| PoolError::Closed),
            None => Err(PoolError::Closed),
        }
    }

    /// Stops accepting new work. Workers drain the queue and exit, after
    /// which the result channel disconnects.
    pub fn close(&mut self) {
        self.tasks.take();
    }

    /// Stops workers at the next task boundary, abandoning queued work.
    pub fn cancel(&mut self) {
        self.tasks.take();
        self.cancel.take();
    }

    /// Result channel; yields one entry per executed task.
    #[must_use]
    pub fn results(&self) -> &Receiver<Result<R, PoolError>> {
        &self.results
    }
}

/// Waits for the next task; `None` once the pool is closed or cancelled.
fn next_task<T>(tasks: &Receiver<T>, cancel: &Receiver<()>) -> Option<T> {
    // Cancellation wins over queued work whenever both are ready.
    if matches!(
        cancel.try_recv(),
        Err(channel::TryRecvError::Disconnected)
    ) {
        return None;
    }

    crossbeam::select! {
        recv(cancel) -> _ => None,
        recv(tasks) -> task => task.ok(),
    }
}

/// Runs a task, converting a panic into its message.
fn run_guarded<R>(task: impl FnOnce() -> R) -> Result<R, String> {
    panic::catch_unwind(AssertUnwindSafe(task)).map_err(panic_message)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
