//! Invoker: hands received application messages to the mediation engine,
//! in message-number order per sequence.
//!
//! A delivery runs while the sequence record is locked, so two deliveries
//! of one sequence never overlap. A failed delivery rolls back and the
//! message stays queued for the next pass.

use crate::domain::{InvokerBean, InvokerQuery, RmdBean, RmdQuery};
use crate::error::{RmError, RmResult};
use crate::ports::{Delivery, MessageDeliverer};
use crate::processors::EngineContext;
use crate::workers::{WakeSignal, Worker};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct Invoker {
    ctx: Arc<EngineContext>,
    deliverer: Arc<dyn MessageDeliverer>,
}

impl Invoker {
    pub fn new(ctx: Arc<EngineContext>, deliverer: Arc<dyn MessageDeliverer>) -> Self {
        Self { ctx, deliverer }
    }

    /// Deliver everything deliverable now; returns the number delivered.
    pub fn deliver_pending(&self) -> RmResult<usize> {
        let mut delivered = 0;
        for rmd in self.ctx.store.snapshot::<RmdBean, _>(&RmdQuery::default()) {
            while self.deliver_next(&rmd.sequence_id)?.is_some() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    fn pick(&self, rmd: &RmdBean) -> Option<InvokerBean> {
        let mut queued: Vec<InvokerBean> = self
            .ctx
            .store
            .snapshot(&InvokerQuery::for_sequence(rmd.sequence_id.clone()));
        queued.sort_by_key(|bean| bean.message_number);
        if !self.ctx.config.invoke_in_order {
            return queued.into_iter().next();
        }
        queued.into_iter().find(|bean| {
            bean.message_number == rmd.next_msg_no_to_process
                || rmd.is_out_of_order_allowed(bean.message_number)
        })
    }

    /// Deliver the next message of `sequence_id`, if one is ready.
    pub fn deliver_next(&self, sequence_id: &str) -> RmResult<Option<u64>> {
        let ctx = &self.ctx;
        let mut tx = ctx.store.begin()?;
        let Some(mut rmd) = tx.retrieve::<RmdBean>(sequence_id)? else {
            tx.commit()?;
            return Ok(None);
        };
        let Some(candidate) = self.pick(&rmd) else {
            tx.commit()?;
            return Ok(None);
        };
        let Some(bean) = tx.retrieve::<InvokerBean>(&candidate.message_store_key)? else {
            tx.commit()?;
            return Ok(None);
        };

        let Some(envelope) = tx.retrieve_message(&bean.message_store_key)? else {
            error!(
                "[rm-invoker] Message {} of {} lost its stored body; dropping",
                bean.message_number, sequence_id
            );
            tx.delete::<InvokerBean>(&bean.message_store_key)?;
            tx.commit()?;
            return Ok(Some(bean.message_number));
        };

        let delivery = Delivery {
            sequence_id: sequence_id.to_string(),
            message_number: bean.message_number,
            envelope,
        };
        if let Err(err) = self.deliverer.deliver(&delivery) {
            tx.rollback();
            warn!(
                "[rm-invoker] Delivery of {} #{} failed, will retry: {}",
                sequence_id, bean.message_number, err
            );
            return Ok(None);
        }

        tx.delete::<InvokerBean>(&bean.message_store_key)?;
        tx.remove_message(&bean.message_store_key)?;
        if bean.message_number == rmd.next_msg_no_to_process {
            rmd.next_msg_no_to_process += 1;
            self.skip_delivered(&mut rmd);
            tx.update(rmd.clone())?;
        }
        tx.commit()?;

        debug!(
            "[rm-invoker] Delivered {} #{}",
            sequence_id, bean.message_number
        );
        if rmd.is_complete() && rmd.last_message_number == Some(bean.message_number) {
            info!("[rm-invoker] Sequence {} fully delivered", sequence_id);
        }
        Ok(Some(bean.message_number))
    }

    /// Advance past numbers already delivered out of order.
    fn skip_delivered(&self, rmd: &mut RmdBean) {
        loop {
            let next = rmd.next_msg_no_to_process;
            let delivered_early = rmd.is_out_of_order_allowed(next)
                && rmd.server_completed_messages.contains(next)
                && self
                    .ctx
                    .store
                    .snapshot::<InvokerBean, _>(&InvokerQuery {
                        sequence_id: Some(rmd.sequence_id.clone()),
                        message_number: Some(next),
                    })
                    .is_empty();
            if !delivered_early {
                break;
            }
            rmd.next_msg_no_to_process += 1;
        }
    }

    /// Deliver every queued message of `sequence_id` regardless of gaps.
    ///
    /// With `allow_later_delivery`, numbers skipped over may still be
    /// delivered if they arrive later.
    pub fn force_dispatch(&self, sequence_id: &str, allow_later_delivery: bool) -> RmResult<usize> {
        let ctx = &self.ctx;
        let mut tx = ctx.store.begin()?;
        let Some(mut rmd) = tx.retrieve::<RmdBean>(sequence_id)? else {
            tx.rollback();
            return Err(RmError::SequenceNotFound {
                id: sequence_id.to_string(),
            });
        };

        let mut queued = tx.find::<InvokerBean, _>(&InvokerQuery::for_sequence(sequence_id))?;
        queued.sort_by_key(|bean| bean.message_number);
        let mut delivered = 0;
        for bean in queued {
            let Some(envelope) = tx.retrieve_message(&bean.message_store_key)? else {
                tx.delete::<InvokerBean>(&bean.message_store_key)?;
                continue;
            };
            let delivery = Delivery {
                sequence_id: sequence_id.to_string(),
                message_number: bean.message_number,
                envelope,
            };
            if let Err(err) = self.deliverer.deliver(&delivery) {
                warn!(
                    "[rm-invoker] Forced delivery of {} #{} failed: {}",
                    sequence_id, bean.message_number, err
                );
                break;
            }
            tx.delete::<InvokerBean>(&bean.message_store_key)?;
            tx.remove_message(&bean.message_store_key)?;
            delivered += 1;
        }

        let highest = rmd.highest_in_message_number;
        if allow_later_delivery && highest >= rmd.next_msg_no_to_process {
            rmd.out_of_order_ranges
                .get_or_insert_with(Default::default)
                .add_range(rmd.next_msg_no_to_process, highest);
        }
        rmd.next_msg_no_to_process = rmd.next_msg_no_to_process.max(highest + 1);
        tx.update(rmd)?;
        tx.commit()?;

        info!(
            "[rm-invoker] Forced dispatch of {} delivered {} messages",
            sequence_id, delivered
        );
        Ok(delivered)
    }
}

impl Worker for Invoker {
    const NAME: &'static str = "rm-invoker";

    fn run_once(&mut self) -> RmResult<Option<Duration>> {
        self.deliver_pending()?;
        Ok(None)
    }

    fn idle_time(&self) -> Duration {
        self.ctx.config.invoker_sleep_time
    }

    fn signal(&self) -> &WakeSignal {
        &self.ctx.store.signals().invoker
    }
}
