//! # Bean Store
//!
//! In-memory storage for the four bean kinds plus the message store, shared
//! by transport threads and the workers.
//!
//! ## Modules
//!
//! - `bean_table`: keyed table of one bean kind
//! - `message_store`: stored envelopes referenced by pending records
//! - `lock_table`: per-bean locks and the waits-for graph
//! - `transaction`: unit of work with undo log and commit-time wake-ups
//! - `codec`: versioned encode/decode of stored records
//!
//! ## Access Rules
//!
//! | Path | Locks | Use |
//! |------|-------|-----|
//! | `Transaction::*` | yes | every mutation, reads that feed a mutation |
//! | `StorageManager::snapshot` | no | worker candidate selection, reports |

mod bean_table;
pub mod codec;
mod lock_table;
mod message_store;
mod transaction;

pub use bean_table::BeanTable;
pub use codec::{BeanCodec, BincodeBeanCodec, SerializationError, StoredRecord, CODEC_VERSION};
pub use lock_table::{LockConflict, LockTable};
pub use message_store::MessageStore;
pub use transaction::Transaction;

use crate::domain::{
    Bean, BeanQuery, InvokerBean, RmEnvelope, RmdBean, RmsBean, SenderBean,
};
use crate::error::{RmError, RmResult, TransactionId};
use crate::workers::signal::WorkerSignals;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::info;

/// Worker to wake when a transaction commits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WakeTarget {
    Sender,
    Invoker,
    Polling,
}

/// All tables, guarded by one mutex.
#[derive(Debug, Default)]
pub struct Tables {
    pub(crate) rms: BeanTable<RmsBean>,
    pub(crate) rmd: BeanTable<RmdBean>,
    pub(crate) sender: BeanTable<SenderBean>,
    pub(crate) invoker: BeanTable<InvokerBean>,
    pub(crate) messages: MessageStore,
}

/// Bean kinds that live in [`Tables`].
pub trait StoredBean: Bean {
    /// Worker woken when a record of this kind is inserted or updated.
    const WAKES: Option<WakeTarget>;

    fn table(tables: &Tables) -> &BeanTable<Self>;

    fn table_mut(tables: &mut Tables) -> &mut BeanTable<Self>;
}

impl StoredBean for RmsBean {
    const WAKES: Option<WakeTarget> = None;

    fn table(tables: &Tables) -> &BeanTable<Self> {
        &tables.rms
    }

    fn table_mut(tables: &mut Tables) -> &mut BeanTable<Self> {
        &mut tables.rms
    }
}

impl StoredBean for RmdBean {
    const WAKES: Option<WakeTarget> = Some(WakeTarget::Invoker);

    fn table(tables: &Tables) -> &BeanTable<Self> {
        &tables.rmd
    }

    fn table_mut(tables: &mut Tables) -> &mut BeanTable<Self> {
        &mut tables.rmd
    }
}

impl StoredBean for SenderBean {
    const WAKES: Option<WakeTarget> = Some(WakeTarget::Sender);

    fn table(tables: &Tables) -> &BeanTable<Self> {
        &tables.sender
    }

    fn table_mut(tables: &mut Tables) -> &mut BeanTable<Self> {
        &mut tables.sender
    }
}

impl StoredBean for InvokerBean {
    const WAKES: Option<WakeTarget> = Some(WakeTarget::Invoker);

    fn table(tables: &Tables) -> &BeanTable<Self> {
        &tables.invoker
    }

    fn table_mut(tables: &mut Tables) -> &mut BeanTable<Self> {
        &mut tables.invoker
    }
}

/// State shared between the manager handle and its transactions.
#[derive(Debug, Default)]
pub(crate) struct StoreShared {
    pub(crate) tables: Mutex<Tables>,
    pub(crate) locks: LockTable,
    active: Mutex<HashMap<ThreadId, TransactionId>>,
    next_id: AtomicU64,
    pub(crate) signals: WorkerSignals,
}

impl StoreShared {
    pub(crate) fn signal(&self, target: WakeTarget) {
        match target {
            WakeTarget::Sender => self.signals.sender.notify(),
            WakeTarget::Invoker => self.signals.invoker.notify(),
            WakeTarget::Polling => self.signals.polling.notify(),
        }
    }

    pub(crate) fn end_transaction(&self, thread: ThreadId, id: TransactionId) {
        let mut active = self.active.lock();
        if active.get(&thread) == Some(&id) {
            active.remove(&thread);
        }
    }
}

/// Record counts, for reports and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub rms: usize,
    pub rmd: usize,
    pub sender: usize,
    pub invoker: usize,
    pub messages: usize,
}

/// Handle to the in-memory store. Cheap to clone.
#[derive(Clone, Debug, Default)]
pub struct StorageManager {
    shared: Arc<StoreShared>,
}

impl StorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a transaction on the calling thread.
    pub fn begin(&self) -> RmResult<Transaction> {
        let thread = std::thread::current().id();
        let mut active = self.shared.active.lock();
        if let Some(&existing) = active.get(&thread) {
            return Err(RmError::TransactionAlreadyActive { existing });
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        active.insert(thread, id);
        drop(active);
        Ok(Transaction::new(id, thread, Arc::clone(&self.shared)))
    }

    /// True when the calling thread owns a live transaction.
    pub fn has_active_transaction(&self) -> bool {
        self.shared
            .active
            .lock()
            .contains_key(&std::thread::current().id())
    }

    /// Unlocked copy of every record matching `query`.
    pub fn snapshot<B, Q>(&self, query: &Q) -> Vec<B>
    where
        B: StoredBean,
        Q: BeanQuery<B> + ?Sized,
    {
        B::table(&self.shared.tables.lock()).matching(query)
    }

    /// Unlocked read of one record.
    pub fn peek<B: StoredBean>(&self, key: &str) -> Option<B> {
        B::table(&self.shared.tables.lock()).get(key).cloned()
    }

    /// Unlocked read of a stored message.
    pub fn message(&self, key: &str) -> Option<RmEnvelope> {
        self.shared.tables.lock().messages.get(key).cloned()
    }

    pub fn counts(&self) -> StoreCounts {
        let tables = self.shared.tables.lock();
        StoreCounts {
            rms: tables.rms.len(),
            rmd: tables.rmd.len(),
            sender: tables.sender.len(),
            invoker: tables.invoker.len(),
            messages: tables.messages.len(),
        }
    }

    pub fn signals(&self) -> &WorkerSignals {
        &self.shared.signals
    }

    pub fn wake(&self, target: WakeTarget) {
        self.shared.signal(target);
    }

    pub fn locks(&self) -> &LockTable {
        &self.shared.locks
    }

    /// Encode every record and stored message with `codec`.
    pub fn export_snapshot<C: BeanCodec + ?Sized>(&self, codec: &C) -> RmResult<Vec<Vec<u8>>> {
        let tables = self.shared.tables.lock();
        let records = tables
            .rms
            .values()
            .cloned()
            .map(StoredRecord::Rms)
            .chain(tables.rmd.values().cloned().map(StoredRecord::Rmd))
            .chain(tables.sender.values().cloned().map(StoredRecord::Sender))
            .chain(tables.invoker.values().cloned().map(StoredRecord::Invoker))
            .chain(
                tables
                    .messages
                    .iter()
                    .map(|(key, envelope)| StoredRecord::Message {
                        key: key.clone(),
                        envelope: envelope.clone(),
                    }),
            );
        records
            .map(|record| codec.encode(&record).map_err(RmError::from))
            .collect()
    }

    /// Load records produced by [`export_snapshot`](Self::export_snapshot).
    ///
    /// Existing rows with the same keys are replaced. Must not run while
    /// transactions are live.
    pub fn import_snapshot<C: BeanCodec + ?Sized>(
        &self,
        codec: &C,
        records: &[Vec<u8>],
    ) -> RmResult<usize> {
        let decoded = records
            .iter()
            .map(|bytes| codec.decode(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        let count = decoded.len();
        let mut tables = self.shared.tables.lock();
        for record in decoded {
            match record {
                StoredRecord::Rms(bean) => {
                    tables.rms.put(bean);
                }
                StoredRecord::Rmd(bean) => {
                    tables.rmd.put(bean);
                }
                StoredRecord::Sender(bean) => {
                    tables.sender.put(bean);
                }
                StoredRecord::Invoker(bean) => {
                    tables.invoker.put(bean);
                }
                StoredRecord::Message { key, envelope } => {
                    tables.messages.put(&key, envelope);
                }
            }
        }
        drop(tables);
        info!("[rm-store] Imported {} records", count);
        self.wake(WakeTarget::Sender);
        self.wake(WakeTarget::Invoker);
        Ok(count)
    }
}

impl From<SerializationError> for RmError {
    fn from(err: SerializationError) -> Self {
        RmError::Serialization {
            message: err.message,
        }
    }
}
