//! Background reclamation threads.
//!
//! Three threads wake on a fixed interval and run one pass each over the
//! page heads, the version heads, and the transaction table. They hold only a
//! weak reference to the cache and exit once it is gone or stop is signalled.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{trace, warn};

use super::CacheInner;
use crate::types::Result;

const JOIN_DEADLINE: Duration = Duration::from_secs(1);

/// One reclamation pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SweepPass {
    /// Evict idle page heads.
    PageHeads,
    /// Reclaim unreferenced versions and prune superseded snapshots.
    Versions,
    /// Drop finished transaction heads.
    Transactions,
}

impl SweepPass {
    const ALL: [SweepPass; 3] = [SweepPass::PageHeads, SweepPass::Versions, SweepPass::Transactions];

    fn name(self) -> &'static str {
        match self {
            SweepPass::PageHeads => "page-heads",
            SweepPass::Versions => "versions",
            SweepPass::Transactions => "transactions",
        }
    }

    pub(crate) fn run(self, cache: &CacheInner) -> Result<usize> {
        match self {
            SweepPass::PageHeads => cache.sweep_page_heads(),
            SweepPass::Versions => cache.reclaim_versions(),
            SweepPass::Transactions => cache.reap_transactions(),
        }
    }
}

struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
    exited: Mutex<usize>,
    done: Condvar,
}

/// Counts a sweep thread as exited however its loop ends.
struct ExitGuard(Arc<StopSignal>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        *self.0.exited.lock() += 1;
        self.0.done.notify_all();
    }
}

pub(crate) struct Sweeper {
    stop: Arc<StopSignal>,
    threads: Vec<JoinHandle<()>>,
}

impl Sweeper {
    pub(crate) fn start(cache: &Arc<CacheInner>, interval: Duration) -> Result<Self> {
        let stop = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
            exited: Mutex::new(0),
            done: Condvar::new(),
        });
        let mut threads = Vec::with_capacity(SweepPass::ALL.len());
        for pass in SweepPass::ALL {
            let weak = Arc::downgrade(cache);
            let signal = Arc::clone(&stop);
            let handle = thread::Builder::new()
                .name(format!("sweep-{}", pass.name()))
                .spawn(move || {
                    let _exit = ExitGuard(Arc::clone(&signal));
                    sweep_loop(pass, weak, signal, interval)
                })?;
            threads.push(handle);
        }
        Ok(Self { stop, threads })
    }

    /// Signals every thread and waits up to a deadline for them to exit.
    pub(crate) fn stop(&mut self) {
        *self.stop.stopped.lock() = true;
        self.stop.wake.notify_all();
        let deadline = Instant::now() + JOIN_DEADLINE;
        let all_exited = {
            let mut exited = self.stop.exited.lock();
            while *exited < self.threads.len() {
                if self.stop.done.wait_until(&mut exited, deadline).timed_out() {
                    break;
                }
            }
            *exited >= self.threads.len()
        };
        for handle in self.threads.drain(..) {
            if all_exited || handle.is_finished() {
                if handle.join().is_err() {
                    warn!("sweeper.thread_panicked");
                }
            } else {
                warn!("sweeper.join_timeout");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep_loop(pass: SweepPass, cache: Weak<CacheInner>, stop: Arc<StopSignal>, interval: Duration) {
    loop {
        {
            let mut stopped = stop.stopped.lock();
            if !*stopped {
                stop.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                return;
            }
        }
        let Some(cache) = cache.upgrade() else {
            return;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| pass.run(&cache))) {
            Ok(Ok(0)) => {}
            Ok(Ok(reclaimed)) => trace!(pass = pass.name(), reclaimed, "sweeper.tick"),
            Ok(Err(err)) => warn!(pass = pass.name(), error = %err, "sweeper.tick_failed"),
            Err(_) => warn!(pass = pass.name(), "sweeper.tick_panicked"),
        }
    }
}
