//! Wake-up signal between committing transactions and the workers.
//!
//! A notification that arrives while the worker is busy is latched, so the
//! next wait returns immediately and no commit is ever missed.

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct WakeSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        *self.pending.lock() = true;
        self.cond.notify_all();
    }

    /// Wait for a notification or until `timeout`; true when notified.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }

    pub fn is_pending(&self) -> bool {
        *self.pending.lock()
    }
}

/// The three worker wake-ups owned by a storage manager.
#[derive(Debug, Default)]
pub struct WorkerSignals {
    pub sender: WakeSignal,
    pub invoker: WakeSignal,
    pub polling: WakeSignal,
}
