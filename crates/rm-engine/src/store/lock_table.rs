//! # Bean Locks
//!
//! Per-bean exclusive locks with a waits-for graph.
//!
//! ```text
//!   T1 ──waits-for──→ T2 ──waits-for──→ T3
//!                                        │
//!   T3 enlists a bean held by T1 ────────┘  → cycle, T3 fails fast
//! ```
//!
//! ## Invariants
//!
//! - A bean is owned by at most one transaction
//! - A transaction has at most one outgoing waits-for edge
//! - A transaction never blocks when blocking would close a cycle

use crate::domain::BeanKey;
use crate::error::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Default)]
struct LockState {
    owners: HashMap<BeanKey, TransactionId>,
    waits_for: HashMap<TransactionId, TransactionId>,
}

impl LockState {
    /// Follow waits-for edges from `from`; true if `target` is reached.
    fn reaches(&self, from: TransactionId, target: TransactionId) -> bool {
        let mut current = from;
        // A chain longer than the edge count must be looping elsewhere
        for _ in 0..=self.waits_for.len() {
            match self.waits_for.get(&current) {
                Some(&next) if next == target => return true,
                Some(&next) => current = next,
                None => return false,
            }
        }
        false
    }
}

/// Outcome of a lock attempt that could not be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConflict {
    pub holder: TransactionId,
}

#[derive(Debug, Default)]
pub struct LockTable {
    state: Mutex<LockState>,
    released: Condvar,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `key` for `tx`, blocking while another transaction holds it.
    ///
    /// Returns `Ok(true)` when newly acquired, `Ok(false)` when `tx` already
    /// held it, and `Err` when waiting would deadlock.
    pub fn acquire(&self, tx: TransactionId, key: &BeanKey) -> Result<bool, LockConflict> {
        let mut state = self.state.lock();
        loop {
            match state.owners.get(key).copied() {
                None => {
                    state.owners.insert(key.clone(), tx);
                    state.waits_for.remove(&tx);
                    return Ok(true);
                }
                Some(owner) if owner == tx => {
                    state.waits_for.remove(&tx);
                    return Ok(false);
                }
                Some(holder) => {
                    if state.reaches(holder, tx) {
                        state.waits_for.remove(&tx);
                        return Err(LockConflict { holder });
                    }
                    debug!("[rm-tx] Transaction {} waiting for {} on {}", tx, holder, key);
                    state.waits_for.insert(tx, holder);
                    self.released.wait(&mut state);
                }
            }
        }
    }

    /// Release every key in `keys` owned by `tx` and wake all waiters.
    pub fn release_all<'a, I>(&self, tx: TransactionId, keys: I)
    where
        I: IntoIterator<Item = &'a BeanKey>,
    {
        let mut state = self.state.lock();
        for key in keys {
            if state.owners.get(key) == Some(&tx) {
                state.owners.remove(key);
            }
        }
        state.waits_for.remove(&tx);
        drop(state);
        self.released.notify_all();
    }

    pub fn owner_of(&self, key: &BeanKey) -> Option<TransactionId> {
        self.state.lock().owners.get(key).copied()
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().owners.len()
    }
}
