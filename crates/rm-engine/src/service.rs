//! # Reliable Messaging Service
//!
//! [`RmEngine`] wires the storage manager, the processors and the three
//! workers together and implements [`ReliableMessagingApi`].
//!
//! ## Architecture
//!
//! 1. [`EngineCore`] holds the synchronous host operations; each runs in its
//!    own transaction on the calling thread
//! 2. The async API hands every call to a blocking thread, so a transaction
//!    never spans an `.await`
//! 3. `start`/`stop` manage the Sender, Invoker and Polling Manager threads

use crate::config::RmConfig;
use crate::domain::{
    InvokerBean, InvokerQuery, RmEnvelope, RmdBean, RmsBean, RmsQuery, SequenceState, Timestamp,
};
use crate::error::{RmError, RmResult};
use crate::ports::inbound::{
    CreateSequenceRequest, IncomingSequenceReport, ReliableMessagingApi, SendOptions,
    SequenceReport, SequenceStatus,
};
use crate::ports::outbound::{MessageDeliverer, SystemTimeSource, TimeSource, Transport};
use crate::processors::{
    acknowledgement, application, create_sequence, dispatch, termination, EngineContext,
};
use crate::store::Transaction;
use crate::workers::{Invoker, PollingManager, Sender, WorkerSet};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts of a host operation that loses a deadlock.
const HOST_DEADLOCK_RETRIES: usize = 3;

/// Poll period of [`ReliableMessagingApi::wait_until_completed`].
const COMPLETION_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Coarse status of a sending sequence in `state`.
pub fn status_of(state: SequenceState) -> SequenceStatus {
    match state {
        SequenceState::Creating => SequenceStatus::Unknown,
        SequenceState::Established | SequenceState::Closed | SequenceState::Terminating => {
            SequenceStatus::Established
        }
        SequenceState::Terminated => SequenceStatus::Terminated,
        SequenceState::TimedOut => SequenceStatus::TimedOut,
    }
}

fn report(rms: &RmsBean) -> SequenceReport {
    SequenceReport {
        internal_sequence_id: Some(rms.internal_sequence_id.clone()),
        sequence_id: rms.sequence_id.clone(),
        status: status_of(rms.state),
        state: Some(rms.state),
        acknowledged: rms.client_completed_messages.clone(),
        highest_sent: rms.highest_out_message_number,
        last_send_error: rms.last_send_error.clone(),
        last_send_error_timestamp: rms.last_send_error_timestamp,
    }
}

/// Synchronous host operations.
pub struct EngineCore {
    ctx: Arc<EngineContext>,
    transport: Arc<dyn Transport>,
    deliverer: Arc<dyn MessageDeliverer>,
}

impl EngineCore {
    fn transact<T, F>(&self, mut op: F) -> RmResult<T>
    where
        F: FnMut(&mut Transaction) -> RmResult<T>,
    {
        let mut attempt = 1;
        loop {
            match self.ctx.in_transaction(&mut op) {
                Err(err) if err.is_deadlock() && attempt < HOST_DEADLOCK_RETRIES => {
                    debug!("[rm-engine] Host operation lost a deadlock, retrying: {}", err);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn create_sequence(&self, request: &CreateSequenceRequest) -> RmResult<String> {
        self.transact(|tx| create_sequence::start_sequence(&self.ctx, tx, request))
    }

    pub fn send(
        &self,
        internal_sequence_id: &str,
        payload: &[u8],
        options: &SendOptions,
    ) -> RmResult<u64> {
        self.transact(|tx| {
            application::send_application_message(
                &self.ctx,
                tx,
                internal_sequence_id,
                payload.to_vec(),
                options,
            )
        })
    }

    pub fn terminate_sequence(&self, internal_sequence_id: &str) -> RmResult<()> {
        self.transact(|tx| termination::request_termination(&self.ctx, tx, internal_sequence_id))
    }

    pub fn close_sequence(&self, internal_sequence_id: &str) -> RmResult<()> {
        self.transact(|tx| termination::close_sequence(&self.ctx, tx, internal_sequence_id))
    }

    pub fn send_ack_request(&self, internal_sequence_id: &str) -> RmResult<()> {
        self.transact(|tx| acknowledgement::queue_ack_request(&self.ctx, tx, internal_sequence_id))
    }

    /// Report by internal id, falling back to the negotiated id.
    pub fn sequence_status(&self, id: &str) -> SequenceReport {
        let rms = self.ctx.store.peek::<RmsBean>(id).or_else(|| {
            self.ctx
                .store
                .snapshot::<RmsBean, _>(&RmsQuery::by_sequence_id(id))
                .into_iter()
                .next()
        });
        rms.as_ref()
            .map_or_else(|| SequenceReport::unknown(id), report)
    }

    pub fn receive_application_message(
        &self,
        sequence_id: &str,
        message_number: u64,
        message: &RmEnvelope,
    ) -> RmResult<Option<RmEnvelope>> {
        let last_message = message
            .headers
            .sequence
            .as_ref()
            .is_some_and(|header| header.last_message);
        self.transact(|tx| {
            application::receive(&self.ctx, tx, sequence_id, message_number, last_message, message)
        })
    }

    pub fn process_inbound(&self, envelope: RmEnvelope) -> RmResult<Option<RmEnvelope>> {
        dispatch(&self.ctx, envelope)
    }

    pub fn incoming_sequence_report(&self, sequence_id: &str) -> RmResult<IncomingSequenceReport> {
        let rmd = self
            .ctx
            .store
            .peek::<RmdBean>(sequence_id)
            .ok_or_else(|| RmError::SequenceNotFound {
                id: sequence_id.to_string(),
            })?;
        let pending_deliveries = self
            .ctx
            .store
            .snapshot::<InvokerBean, _>(&InvokerQuery::for_sequence(sequence_id))
            .len();
        Ok(IncomingSequenceReport {
            sequence_id: rmd.sequence_id,
            state: rmd.state,
            received: rmd.server_completed_messages,
            next_to_deliver: rmd.next_msg_no_to_process,
            highest_received: rmd.highest_in_message_number,
            pending_deliveries,
        })
    }

    fn rms(&self, internal_sequence_id: &str) -> RmResult<RmsBean> {
        self.ctx
            .store
            .peek::<RmsBean>(internal_sequence_id)
            .ok_or_else(|| RmError::SequenceNotFound {
                id: internal_sequence_id.to_string(),
            })
    }

    pub fn last_send_error(&self, internal_sequence_id: &str) -> RmResult<Option<(String, Timestamp)>> {
        let rms = self.rms(internal_sequence_id)?;
        Ok(rms.last_send_error.zip(rms.last_send_error_timestamp))
    }

    pub fn force_dispatch(&self, sequence_id: &str, allow_later_delivery: bool) -> RmResult<usize> {
        Invoker::new(Arc::clone(&self.ctx), Arc::clone(&self.deliverer))
            .force_dispatch(sequence_id, allow_later_delivery)
    }

    pub fn sequence_id_of(&self, internal_sequence_id: &str) -> RmResult<Option<String>> {
        Ok(self.rms(internal_sequence_id)?.sequence_id)
    }

    pub fn outbound_for_inbound(&self, inbound_sequence_id: &str) -> RmResult<Option<String>> {
        self.ctx
            .store
            .peek::<RmdBean>(inbound_sequence_id)
            .map(|rmd| rmd.outbound_internal_sequence)
            .ok_or_else(|| RmError::SequenceNotFound {
                id: inbound_sequence_id.to_string(),
            })
    }
}

struct EngineInner {
    core: EngineCore,
    workers: Mutex<Option<WorkerSet>>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.get_mut().take() {
            if let Err(err) = workers.shutdown(self.core.ctx.store.signals()) {
                warn!("[rm-engine] Worker shutdown on drop failed: {}", err);
            }
        }
    }
}

/// The reliable messaging engine. Cheap to clone.
#[derive(Clone)]
pub struct RmEngine {
    inner: Arc<EngineInner>,
}

impl RmEngine {
    pub fn new(
        config: RmConfig,
        transport: Arc<dyn Transport>,
        deliverer: Arc<dyn MessageDeliverer>,
    ) -> RmResult<Self> {
        Self::with_time_source(config, transport, deliverer, Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(
        config: RmConfig,
        transport: Arc<dyn Transport>,
        deliverer: Arc<dyn MessageDeliverer>,
        clock: Arc<dyn TimeSource>,
    ) -> RmResult<Self> {
        config.validate()?;
        let ctx = Arc::new(EngineContext::new(config, clock));
        Ok(Self {
            inner: Arc::new(EngineInner {
                core: EngineCore {
                    ctx,
                    transport,
                    deliverer,
                },
                workers: Mutex::new(None),
            }),
        })
    }

    pub fn core(&self) -> &EngineCore {
        &self.inner.core
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.inner.core.ctx
    }

    pub fn config(&self) -> &RmConfig {
        &self.inner.core.ctx.config
    }

    /// Sender bound to this engine, for driving passes by hand.
    pub fn sender(&self) -> Sender {
        Sender::new(
            Arc::clone(&self.inner.core.ctx),
            Arc::clone(&self.inner.core.transport),
        )
    }

    pub fn invoker(&self) -> Invoker {
        Invoker::new(
            Arc::clone(&self.inner.core.ctx),
            Arc::clone(&self.inner.core.deliverer),
        )
    }

    pub fn polling(&self) -> PollingManager {
        PollingManager::new(Arc::clone(&self.inner.core.ctx))
    }

    /// Spawn the worker threads; a no-op when already running.
    pub fn start(&self) -> RmResult<()> {
        let mut slot = self.inner.workers.lock();
        if slot.is_some() {
            return Ok(());
        }
        let mut workers = WorkerSet::new();
        workers.spawn(self.sender())?;
        workers.spawn(self.invoker())?;
        workers.spawn(self.polling())?;
        info!("[rm-engine] Started {} workers", workers.len());
        *slot = Some(workers);
        Ok(())
    }

    /// Stop and join the worker threads.
    pub fn stop(&self) -> RmResult<()> {
        let workers = self.inner.workers.lock().take();
        match workers {
            Some(workers) => {
                workers.shutdown(self.inner.core.ctx.store.signals())?;
                info!("[rm-engine] Workers stopped");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.workers.lock().is_some()
    }

    async fn blocking<T, F>(&self, op: F) -> RmResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&EngineCore) -> RmResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner.core))
            .await
            .map_err(|err| RmError::Worker {
                name: "rm-host".to_string(),
                reason: err.to_string(),
            })?
    }
}

impl std::fmt::Debug for RmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RmEngine")
            .field("context", &self.inner.core.ctx)
            .field("running", &self.is_running())
            .finish()
    }
}

#[async_trait]
impl ReliableMessagingApi for RmEngine {
    async fn create_sequence(&self, request: CreateSequenceRequest) -> RmResult<String> {
        self.blocking(move |core| core.create_sequence(&request)).await
    }

    async fn send(
        &self,
        internal_sequence_id: &str,
        payload: Vec<u8>,
        options: SendOptions,
    ) -> RmResult<u64> {
        let id = internal_sequence_id.to_string();
        self.blocking(move |core| core.send(&id, &payload, &options))
            .await
    }

    async fn terminate_sequence(&self, internal_sequence_id: &str) -> RmResult<()> {
        let id = internal_sequence_id.to_string();
        self.blocking(move |core| core.terminate_sequence(&id)).await
    }

    async fn close_sequence(&self, internal_sequence_id: &str) -> RmResult<()> {
        let id = internal_sequence_id.to_string();
        self.blocking(move |core| core.close_sequence(&id)).await
    }

    async fn send_ack_request(&self, internal_sequence_id: &str) -> RmResult<()> {
        let id = internal_sequence_id.to_string();
        self.blocking(move |core| core.send_ack_request(&id)).await
    }

    async fn sequence_status(&self, id: &str) -> RmResult<SequenceReport> {
        Ok(self.core().sequence_status(id))
    }

    async fn receive_application_message(
        &self,
        sequence_id: &str,
        message_number: u64,
        message: RmEnvelope,
    ) -> RmResult<Option<RmEnvelope>> {
        let id = sequence_id.to_string();
        self.blocking(move |core| core.receive_application_message(&id, message_number, &message))
            .await
    }

    async fn process_inbound(&self, envelope: RmEnvelope) -> RmResult<Option<RmEnvelope>> {
        self.blocking(move |core| core.process_inbound(envelope))
            .await
    }

    async fn incoming_sequence_report(&self, sequence_id: &str) -> RmResult<IncomingSequenceReport> {
        self.core().incoming_sequence_report(sequence_id)
    }

    async fn last_send_error(
        &self,
        internal_sequence_id: &str,
    ) -> RmResult<Option<(String, Timestamp)>> {
        self.core().last_send_error(internal_sequence_id)
    }

    async fn wait_until_completed(
        &self,
        internal_sequence_id: &str,
        max_wait: Duration,
    ) -> RmResult<SequenceReport> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let report = self.core().sequence_status(internal_sequence_id);
            match (report.state, report.status) {
                (None, _) => {
                    return Err(RmError::SequenceNotFound {
                        id: internal_sequence_id.to_string(),
                    })
                }
                (_, SequenceStatus::TimedOut) => {
                    return Err(RmError::SequenceTimedOut {
                        id: internal_sequence_id.to_string(),
                    })
                }
                (_, SequenceStatus::Terminated) => return Ok(report),
                (_, SequenceStatus::Established) if report.is_fully_acknowledged() => {
                    return Ok(report)
                }
                _ => {}
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(RmError::WaitTimeout {
                    what: format!("completion of {}", internal_sequence_id),
                });
            }
            tokio::time::sleep(COMPLETION_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn force_dispatch(&self, sequence_id: &str, allow_later_delivery: bool) -> RmResult<usize> {
        let id = sequence_id.to_string();
        self.blocking(move |core| core.force_dispatch(&id, allow_later_delivery))
            .await
    }

    async fn sequence_id_of(&self, internal_sequence_id: &str) -> RmResult<Option<String>> {
        self.core().sequence_id_of(internal_sequence_id)
    }

    async fn outbound_for_inbound(&self, inbound_sequence_id: &str) -> RmResult<Option<String>> {
        self.core().outbound_for_inbound(inbound_sequence_id)
    }
}

#[cfg(test)]
mod tests;
