#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::types::{Result, StoreError};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    available: Condvar,
}

/// Fixed set of worker threads running commit and finalize work.
///
/// Jobs are started in submission order; with more than one worker they may
/// finish in any order.
pub struct TaskPool {
    name: String,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Starts `workers` threads named `{name}-{n}`.
    pub fn new(name: &str, workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(StoreError::Config("task pool needs at least one worker"));
        }
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState::default()),
            available: Condvar::new(),
        });
        let mut handles = Vec::with_capacity(workers);
        for n in 0..workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || worker_loop(shared))?;
            handles.push(handle);
        }
        debug!(pool = name, workers, "dispatch.pool.start");
        Ok(Self {
            name: name.to_owned(),
            shared,
            workers: handles,
        })
    }

    /// Queues `job` and returns a ticket that completes with its result.
    pub fn submit<F>(&self, job: F) -> Ticket
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let (ticket, completer) = Ticket::pending();
        let wrapped: Job = Box::new(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(job)) {
                Ok(result) => result,
                Err(_) => Err(StoreError::Task("task panicked".into())),
            };
            completer.finish(outcome);
        });
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Ticket::completed(Err(StoreError::Task(format!(
                "task pool {} is shut down",
                self.name
            ))));
        }
        queue.jobs.push_back(wrapped);
        drop(queue);
        self.shared.available.notify_one();
        ticket
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            // The last owner may be dropped from inside one of our own jobs.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!(pool = %self.name, "dispatch.pool.worker_panicked");
            }
        }
        debug!(pool = %self.name, "dispatch.pool.stop");
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };
        job();
    }
}

struct TicketState {
    result: Mutex<Option<Result<()>>>,
    done: Condvar,
}

/// Completion handle for asynchronous commit and finalize work.
///
/// Call [`Ticket::wait`] to block until the work finishes.
#[must_use = "a ticket reports whether the background work succeeded"]
pub struct Ticket {
    state: Arc<TicketState>,
}

impl Ticket {
    /// A ticket that is already finished with `outcome`.
    pub fn completed(outcome: Result<()>) -> Self {
        Self {
            state: Arc::new(TicketState {
                result: Mutex::new(Some(outcome)),
                done: Condvar::new(),
            }),
        }
    }

    pub(crate) fn pending() -> (Self, Completer) {
        let state = Arc::new(TicketState {
            result: Mutex::new(None),
            done: Condvar::new(),
        });
        (
            Self {
                state: Arc::clone(&state),
            },
            Completer { state },
        )
    }

    /// Returns true once the work has finished.
    pub fn is_done(&self) -> bool {
        self.state.result.lock().is_some()
    }

    /// Blocks until the work finishes and returns its result.
    pub fn wait(self) -> Result<()> {
        let mut guard = self.state.result.lock();
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            self.state.done.wait(&mut guard);
        }
    }
}

pub(crate) struct Completer {
    state: Arc<TicketState>,
}

impl Completer {
    pub(crate) fn finish(self, outcome: Result<()>) {
        let mut result = self.state.result.lock();
        *result = Some(outcome);
        self.state.done.notify_all();
    }
}
