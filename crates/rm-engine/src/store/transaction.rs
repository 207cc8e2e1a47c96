//! # Transactions
//!
//! A [`Transaction`] is the unit of work every bean mutation runs under.
//!
//! ```text
//! begin ──→ enlist/insert/update/delete/find ... ──→ commit   (locks released, workers woken)
//!                    │                          └──→ rollback (prior images restored)
//!                    └── would deadlock ──→ rolled back, RmError::Deadlock
//! ```
//!
//! ## Invariants
//!
//! - At most one live transaction per thread
//! - Every bean read or written through a transaction is locked by it until it ends
//! - Rollback restores every record and stored message the transaction changed
//! - A transaction is bound to the thread that began it (it is `!Send`)

use crate::domain::{Bean, BeanKey, BeanQuery, RmEnvelope};
use crate::error::{RmError, RmResult, TransactionId};
use crate::store::{StoreShared, StoredBean, Tables, WakeTarget};
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::{debug, warn};

type UndoOp = Box<dyn FnOnce(&mut Tables)>;

pub struct Transaction {
    id: TransactionId,
    thread: ThreadId,
    shared: Arc<StoreShared>,
    held: Vec<BeanKey>,
    held_set: HashSet<BeanKey>,
    touched: HashSet<BeanKey>,
    touched_messages: HashSet<String>,
    undo: Vec<UndoOp>,
    wake: HashSet<WakeTarget>,
    active: bool,
    _not_send: PhantomData<*const ()>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, thread: ThreadId, shared: Arc<StoreShared>) -> Self {
        Self {
            id,
            thread,
            shared,
            held: Vec::new(),
            held_set: HashSet::new(),
            touched: HashSet::new(),
            touched_messages: HashSet::new(),
            undo: Vec::new(),
            wake: HashSet::new(),
            active: true,
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Keys currently locked by this transaction.
    pub fn held_keys(&self) -> &[BeanKey] {
        &self.held
    }

    fn ensure_active(&self) -> RmResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(RmError::NoActiveTransaction)
        }
    }

    /// Lock `bean` to this transaction, blocking while another holds it.
    pub fn enlist<B: Bean>(&mut self, bean: &B) -> RmResult<()> {
        self.enlist_key(bean.bean_key())
    }

    pub(crate) fn enlist_key(&mut self, key: BeanKey) -> RmResult<()> {
        self.ensure_active()?;
        if self.held_set.contains(&key) {
            return Ok(());
        }
        match self.shared.locks.acquire(self.id, &key) {
            Ok(_) => {
                self.held_set.insert(key.clone());
                self.held.push(key);
                Ok(())
            }
            Err(conflict) => {
                warn!(
                    "[rm-tx] Deadlock: transaction {} would wait on {} held by {}; rolling back",
                    self.id, key, conflict.holder
                );
                self.abort();
                Err(RmError::Deadlock {
                    transaction: self.id,
                    holder: conflict.holder,
                    bean: key,
                })
            }
        }
    }

    /// Ask for a worker wake-up on commit.
    pub fn request_wake(&mut self, target: WakeTarget) {
        self.wake.insert(target);
    }

    fn record_undo<B: StoredBean>(&mut self, tables: &Tables, key: &str) {
        if self.touched.insert(BeanKey::new(B::KIND, key)) {
            let prior = B::table(tables).get(key).cloned();
            let key = key.to_string();
            self.undo
                .push(Box::new(move |tables: &mut Tables| B::table_mut(tables).restore(&key, prior)));
        }
    }

    fn record_message_undo(&mut self, tables: &Tables, key: &str) {
        if self.touched_messages.insert(key.to_string()) {
            let prior = tables.messages.get(key).cloned();
            let key = key.to_string();
            self.undo
                .push(Box::new(move |tables: &mut Tables| tables.messages.restore(&key, prior)));
        }
    }

    /// Insert a new record; errors if the key exists.
    pub fn insert<B: StoredBean>(&mut self, bean: B) -> RmResult<()> {
        self.enlist_key(bean.bean_key())?;
        let shared = Arc::clone(&self.shared);
        let mut tables = shared.tables.lock();
        if B::table(&tables).contains(bean.key()) {
            return Err(RmError::DuplicateBean {
                kind: B::KIND,
                key: bean.key().to_string(),
            });
        }
        self.record_undo::<B>(&tables, bean.key());
        B::table_mut(&mut tables).put(bean);
        if let Some(target) = B::WAKES {
            self.wake.insert(target);
        }
        Ok(())
    }

    /// Replace an existing record; errors if it is missing.
    pub fn update<B: StoredBean>(&mut self, bean: B) -> RmResult<()> {
        self.enlist_key(bean.bean_key())?;
        let shared = Arc::clone(&self.shared);
        let mut tables = shared.tables.lock();
        if !B::table(&tables).contains(bean.key()) {
            return Err(RmError::BeanNotFound {
                kind: B::KIND,
                key: bean.key().to_string(),
            });
        }
        self.record_undo::<B>(&tables, bean.key());
        B::table_mut(&mut tables).put(bean);
        if let Some(target) = B::WAKES {
            self.wake.insert(target);
        }
        Ok(())
    }

    /// Remove a record, returning it when it existed.
    pub fn delete<B: StoredBean>(&mut self, key: &str) -> RmResult<Option<B>> {
        self.enlist_key(BeanKey::new(B::KIND, key))?;
        let shared = Arc::clone(&self.shared);
        let mut tables = shared.tables.lock();
        if !B::table(&tables).contains(key) {
            return Ok(None);
        }
        self.record_undo::<B>(&tables, key);
        Ok(B::table_mut(&mut tables).remove(key))
    }

    /// Lock and read a record by primary key.
    pub fn retrieve<B: StoredBean>(&mut self, key: &str) -> RmResult<Option<B>> {
        self.enlist_key(BeanKey::new(B::KIND, key))?;
        let tables = self.shared.tables.lock();
        Ok(B::table(&tables).get(key).cloned())
    }

    /// Lock and return every record matching `query`.
    ///
    /// Records that change so they no longer match while this transaction
    /// waits for their lock are left out.
    pub fn find<B, Q>(&mut self, query: &Q) -> RmResult<Vec<B>>
    where
        B: StoredBean,
        Q: BeanQuery<B> + ?Sized,
    {
        self.ensure_active()?;
        let keys = B::table(&self.shared.tables.lock()).matching_keys(query);
        let mut found = Vec::with_capacity(keys.len());
        for key in keys {
            self.enlist_key(BeanKey::new(B::KIND, key.as_str()))?;
            let tables = self.shared.tables.lock();
            if let Some(bean) = B::table(&tables).get(&key).filter(|b| query.matches(b)) {
                found.push(bean.clone());
            }
        }
        Ok(found)
    }

    /// Like [`find`](Self::find) but errors when more than one record matches.
    pub fn find_unique<B, Q>(&mut self, query: &Q) -> RmResult<Option<B>>
    where
        B: StoredBean,
        Q: BeanQuery<B> + ?Sized,
    {
        let mut found = self.find(query)?;
        if found.len() > 1 {
            return Err(RmError::NonUniqueResult {
                kind: B::KIND,
                count: found.len(),
            });
        }
        Ok(found.pop())
    }

    /// Store (or replace) a message under `key`.
    pub fn store_message(&mut self, key: &str, envelope: RmEnvelope) -> RmResult<()> {
        self.ensure_active()?;
        let shared = Arc::clone(&self.shared);
        let mut tables = shared.tables.lock();
        self.record_message_undo(&tables, key);
        tables.messages.put(key, envelope);
        Ok(())
    }

    pub fn retrieve_message(&self, key: &str) -> RmResult<Option<RmEnvelope>> {
        self.ensure_active()?;
        Ok(self.shared.tables.lock().messages.get(key).cloned())
    }

    /// Replace a stored message; errors if it is missing.
    pub fn update_message(&mut self, key: &str, envelope: RmEnvelope) -> RmResult<()> {
        self.ensure_active()?;
        let shared = Arc::clone(&self.shared);
        let mut tables = shared.tables.lock();
        if tables.messages.get(key).is_none() {
            return Err(RmError::MessageNotFound {
                key: key.to_string(),
            });
        }
        self.record_message_undo(&tables, key);
        tables.messages.put(key, envelope);
        Ok(())
    }

    pub fn remove_message(&mut self, key: &str) -> RmResult<Option<RmEnvelope>> {
        self.ensure_active()?;
        let shared = Arc::clone(&self.shared);
        let mut tables = shared.tables.lock();
        if tables.messages.get(key).is_none() {
            return Ok(None);
        }
        self.record_message_undo(&tables, key);
        Ok(tables.messages.remove(key))
    }

    /// Make the changes visible, release locks and wake workers with new work.
    pub fn commit(mut self) -> RmResult<()> {
        self.ensure_active()?;
        self.undo.clear();
        self.finish();
        for target in self.wake.drain() {
            self.shared.signal(target);
        }
        debug!("[rm-tx] Transaction {} committed", self.id);
        Ok(())
    }

    /// Undo every change and release locks without waking anyone.
    pub fn rollback(mut self) {
        if self.active {
            self.abort();
        }
    }

    fn abort(&mut self) {
        {
            let mut tables = self.shared.tables.lock();
            while let Some(op) = self.undo.pop() {
                op(&mut tables);
            }
        }
        self.wake.clear();
        self.finish();
        debug!("[rm-tx] Transaction {} rolled back", self.id);
    }

    fn finish(&mut self) {
        self.shared.locks.release_all(self.id, self.held.iter());
        self.held.clear();
        self.held_set.clear();
        self.shared.end_transaction(self.thread, self.id);
        self.active = false;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.active {
            warn!(
                "[rm-tx] Transaction {} dropped without commit; rolling back",
                self.id
            );
            self.abort();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("active", &self.active)
            .field("held", &self.held)
            .finish()
    }
}
