//! # Background Workers
//!
//! ```text
//!                 commit (WakeTarget)
//!   processors ─────────────┬───────────────┬────────────────┐
//!                           ▼               ▼                ▼
//!                     ┌──────────┐    ┌──────────┐    ┌─────────────┐
//!                     │  Sender  │    │ Invoker  │    │   Polling   │
//!                     └────┬─────┘    └────┬─────┘    └──────┬──────┘
//!                          │ Transport     │ MessageDeliverer│ MakeConnection
//!                          ▼               ▼                 ▼ (via Sender)
//! ```
//!
//! Each worker runs on its own thread, sleeps on its [`WakeSignal`] and
//! exposes `run_once` so tests can drive it step by step.

pub mod housekeeping;
pub mod invoker;
pub mod polling;
pub mod retransmission;
pub mod sender;
pub mod signal;

pub use invoker::Invoker;
pub use polling::{PollSchedule, PollingManager};
pub use sender::Sender;
pub use signal::{WakeSignal, WorkerSignals};

use crate::error::{RmError, RmResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Back-off after a lost deadlock before the worker scans again.
const DEADLOCK_BACKOFF: Duration = Duration::from_millis(10);

/// A background loop body.
pub trait Worker: Send + 'static {
    const NAME: &'static str;

    /// Do one unit of work. `Some(ZERO)` asks to be called again at once,
    /// `Some(d)` to be called within `d`, `None` to sleep the idle time.
    fn run_once(&mut self) -> RmResult<Option<Duration>>;

    /// Maximum sleep between two calls.
    fn idle_time(&self) -> Duration;

    fn signal(&self) -> &WakeSignal;
}

fn run_loop<W: Worker>(mut worker: W, stop: Arc<AtomicBool>) {
    info!("[{}] Started", W::NAME);
    while !stop.load(Ordering::SeqCst) {
        let wait = match worker.run_once() {
            Ok(Some(next)) => next.min(worker.idle_time()),
            Ok(None) => worker.idle_time(),
            Err(err) if err.is_deadlock() => {
                debug!("[{}] Lost deadlock, retrying: {}", W::NAME, err);
                DEADLOCK_BACKOFF
            }
            Err(err) => {
                warn!("[{}] Pass failed: {}", W::NAME, err);
                worker.idle_time()
            }
        };
        if !wait.is_zero() {
            worker.signal().wait_timeout(wait);
        }
    }
    info!("[{}] Stopped", W::NAME);
}

/// Threads of the running workers.
#[derive(Debug)]
pub struct WorkerSet {
    stop: Arc<AtomicBool>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        }
    }

    pub fn spawn<W: Worker>(&mut self, worker: W) -> RmResult<()> {
        let stop = Arc::clone(&self.stop);
        let handle = std::thread::Builder::new()
            .name(W::NAME.to_string())
            .spawn(move || run_loop(worker, stop))
            .map_err(|e| RmError::Worker {
                name: W::NAME.to_string(),
                reason: e.to_string(),
            })?;
        self.handles.push((W::NAME, handle));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Ask every worker to stop, wake them, and join.
    pub fn shutdown(self, signals: &WorkerSignals) -> RmResult<()> {
        self.stop.store(true, Ordering::SeqCst);
        signals.sender.notify();
        signals.invoker.notify();
        signals.polling.notify();
        let mut failed = None;
        for (name, handle) in self.handles {
            if handle.join().is_err() {
                failed = Some(RmError::Worker {
                    name: name.to_string(),
                    reason: "thread panicked".to_string(),
                });
            }
        }
        failed.map_or(Ok(()), Err)
    }
}

impl Default for WorkerSet {
    fn default() -> Self {
        Self::new()
    }
}
