//! # Sender
//!
//! Transmits due pending-send records over the [`Transport`].
//!
//! ```text
//! pick lowest time_to_send ──→ tx₁: lock RMS, bean; adjust; build wire form; commit
//!                                   │
//!                                   ▼
//!                           Transport::send (no locks held)
//!                                   │
//!                                   ▼
//!                   tx₂: record outcome; drop one-shot records; commit
//!                                   │
//!                                   ▼
//!                   back-channel response ──→ dispatch
//! ```
//!
//! Housekeeping runs from this loop every `housekeeping_interval`.

use crate::domain::{
    is_back_channel_address, MessageType, RmEnvelope, RmsBean, SenderBean, SenderQuery,
    SequenceEvent, Timestamp,
};
use crate::error::RmResult;
use crate::ports::{Transport, TransportError};
use crate::processors::outbound::{discard, prepare_outbound};
use crate::processors::termination::complete_termination;
use crate::processors::{dispatch, EngineContext};
use crate::workers::housekeeping;
use crate::workers::retransmission::{adjust, Decision};
use crate::workers::{WakeSignal, Worker};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub struct Sender {
    ctx: Arc<EngineContext>,
    transport: Arc<dyn Transport>,
    last_housekeeping: Option<Timestamp>,
}

impl Sender {
    pub fn new(ctx: Arc<EngineContext>, transport: Arc<dyn Transport>) -> Self {
        Self {
            ctx,
            transport,
            last_housekeeping: None,
        }
    }

    fn candidates(&self) -> Vec<SenderBean> {
        let mut pending: Vec<SenderBean> = self.ctx.store.snapshot(&SenderQuery {
            send: Some(true),
            transport_available: Some(true),
            ..Default::default()
        });
        pending.retain(|bean| bean.time_to_send >= 0 && (bean.resend || bean.sent_count == 0));
        pending.sort_by_key(|bean| (bean.time_to_send, bean.message_number));
        pending
    }

    /// Time until the earliest pending record falls due.
    pub fn next_due_in(&self) -> Option<Duration> {
        let now = self.ctx.now();
        self.candidates()
            .first()
            .map(|bean| Duration::from_millis((bean.time_to_send as u64).saturating_sub(now)))
    }

    /// Transmit the earliest due record; false when nothing is due.
    pub fn send_next(&self) -> RmResult<bool> {
        let now = self.ctx.now();
        let Some(next) = self.candidates().into_iter().find(|bean| bean.is_due(now)) else {
            return Ok(false);
        };
        self.transmit(&next.message_id)?;
        Ok(true)
    }

    /// Transmit every record due now, each at most once.
    pub fn send_due(&self) -> RmResult<usize> {
        let now = self.ctx.now();
        let due: Vec<SenderBean> = self
            .candidates()
            .into_iter()
            .filter(|bean| bean.is_due(now))
            .collect();
        let mut sent = 0;
        for bean in due {
            if self.transmit(&bean.message_id)? {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// One transmission attempt of `message_id`; true when it went out.
    pub fn transmit(&self, message_id: &str) -> RmResult<bool> {
        let ctx = &self.ctx;
        let now = ctx.now();
        let Some(candidate) = ctx.store.peek::<SenderBean>(message_id) else {
            return Ok(false);
        };

        let mut tx = ctx.store.begin()?;
        let mut rms = match candidate.internal_sequence_id.as_deref() {
            Some(id) => tx.retrieve::<RmsBean>(id)?,
            None => None,
        };
        let Some(mut bean) = tx.retrieve::<SenderBean>(message_id)? else {
            tx.commit()?;
            return Ok(false);
        };
        if !bean.is_due(now) {
            tx.commit()?;
            return Ok(false);
        }

        if let Some(rms) = &rms {
            let finished = rms.timed_out
                || (rms.terminated && bean.message_type != MessageType::TerminateSequence);
            if finished {
                debug!(
                    "[rm-sender] Parking {} of finished sequence {}",
                    bean.message_id, rms.internal_sequence_id
                );
                bean.send = false;
                tx.update(bean)?;
                tx.commit()?;
                return Ok(false);
            }
        }

        if is_back_channel_address(bean.to_address.as_deref()) {
            debug!(
                "[rm-sender] {} waits for a MakeConnection from its peer",
                bean.message_id
            );
            bean.transport_available = false;
            tx.update(bean)?;
            tx.commit()?;
            return Ok(false);
        }

        match adjust(&ctx.config, &mut bean, rms.as_ref(), now) {
            Decision::GiveUp { reason } => {
                bean.send = false;
                tx.update(bean.clone())?;
                if let Some(rms) = rms.as_mut() {
                    if !rms.state.is_terminal() {
                        rms.apply(SequenceEvent::TimeOut)?;
                    }
                    rms.record_send_error(reason.clone(), now);
                    tx.update(rms.clone())?;
                }
                tx.commit()?;
                error!(
                    "[rm-sender] Giving up on {} ({:?}): {}",
                    bean.message_id, bean.message_type, reason
                );
                return Ok(false);
            }
            Decision::Send { next_time_to_send } => bean.time_to_send = next_time_to_send,
        }

        let envelope = prepare_outbound(ctx, &mut tx, &bean, rms.as_ref())?;
        tx.update(bean.clone())?;
        tx.commit()?;

        let outcome = if ctx.config.drops(bean.message_type) {
            debug!(
                "[rm-sender] Dropping {} ({:?}) by configuration",
                bean.message_id, bean.message_type
            );
            Ok(None)
        } else {
            debug!(
                "[rm-sender] Sending {} ({:?}) #{} attempt {}",
                bean.message_id, bean.message_type, bean.message_number, bean.sent_count
            );
            self.transport.send(&envelope)
        };

        self.record_outcome(&bean, outcome.as_ref().err(), now)?;
        if let Ok(Some(response)) = outcome {
            self.handle_response(response);
        }
        Ok(true)
    }

    fn record_outcome(
        &self,
        bean: &SenderBean,
        failure: Option<&TransportError>,
        now: Timestamp,
    ) -> RmResult<()> {
        let ctx = &self.ctx;
        ctx.in_transaction(|tx| {
            let mut rms = match bean.internal_sequence_id.as_deref() {
                Some(id) => tx.retrieve::<RmsBean>(id)?,
                None => None,
            };
            let mut rms_changed = false;

            if let Some(err) = failure {
                warn!(
                    "[rm-sender] Transmission of {} failed: {}",
                    bean.message_id, err
                );
                if let Some(rms) = rms.as_mut() {
                    rms.record_send_error(err.to_string(), now);
                    rms_changed = true;
                }
            }

            if !bean.resend {
                discard(tx, &bean.message_id)?;
            }

            // WS-RM 1.0 has no TerminateSequenceResponse.
            if bean.message_type == MessageType::TerminateSequence && !bean.resend {
                if let Some(rms) = rms.as_mut() {
                    complete_termination(ctx, tx, rms)?;
                    rms_changed = true;
                }
            }

            if let (true, Some(rms)) = (rms_changed, rms) {
                tx.update(rms)?;
            }
            Ok(())
        })
    }

    /// Process a synchronous back-channel response as an inbound message.
    fn handle_response(&self, response: RmEnvelope) {
        let message_id = response.message_id.clone();
        match dispatch(&self.ctx, response) {
            Ok(Some(follow_up)) => {
                let addressable = follow_up
                    .to
                    .as_ref()
                    .is_some_and(|epr| !epr.is_anonymous());
                if !addressable {
                    debug!(
                        "[rm-sender] Dropping reply to back-channel response {}",
                        message_id
                    );
                    return;
                }
                if let Err(err) = self.transport.send(&follow_up) {
                    warn!(
                        "[rm-sender] Reply to back-channel response {} failed: {}",
                        message_id, err
                    );
                }
            }
            Ok(None) => {}
            Err(err) => warn!(
                "[rm-sender] Back-channel response {} not processed: {}",
                message_id, err
            ),
        }
    }

    fn housekeeping_due(&self, now: Timestamp) -> bool {
        let interval = self.ctx.config.housekeeping_interval.as_millis() as u64;
        self.last_housekeeping
            .map_or(true, |last| now.saturating_sub(last) >= interval)
    }
}

impl Worker for Sender {
    const NAME: &'static str = "rm-sender";

    fn run_once(&mut self) -> RmResult<Option<Duration>> {
        let now = self.ctx.now();
        if self.housekeeping_due(now) {
            self.last_housekeeping = Some(now);
            let report = housekeeping::run(&self.ctx, now)?;
            if report != housekeeping::HousekeepingReport::default() {
                debug!("[rm-sender] Housekeeping: {:?}", report);
            }
        }
        if self.send_next()? {
            return Ok(Some(Duration::ZERO));
        }
        Ok(self.next_due_in())
    }

    fn idle_time(&self) -> Duration {
        self.ctx.config.sender_sleep_time
    }

    fn signal(&self) -> &WakeSignal {
        &self.ctx.store.signals().sender
    }
}
