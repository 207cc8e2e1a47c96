//! Periodic sweep run from the Sender loop.
//!
//! 1. Sending sequences idle past the inactivity timeout are timed out.
//! 2. Receiving sequences idle past the inactivity timeout are terminated.
//! 3. Finished sequences idle past the removal timeout are deleted together
//!    with their residual pending records.
//! 4. Messages parked for a back-channel longer than the transport wait time
//!    are reported and made due again.

use crate::domain::{
    InvokerBean, InvokerQuery, RmdBean, RmdQuery, RmsBean, RmsQuery, SenderBean, SenderQuery,
    SequenceEvent, Timestamp,
};
use crate::error::RmResult;
use crate::processors::outbound::discard_matching;
use crate::processors::EngineContext;
use std::time::Duration;
use tracing::{info, warn};

/// What one sweep changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    pub timed_out: usize,
    pub inbound_terminated: usize,
    pub removed_outbound: usize,
    pub removed_inbound: usize,
    pub orphans: usize,
}

fn idle_for(last_activated: Timestamp, now: Timestamp, limit: Duration) -> bool {
    now.saturating_sub(last_activated) > limit.as_millis() as u64
}

pub fn run(ctx: &EngineContext, now: Timestamp) -> RmResult<HousekeepingReport> {
    let mut report = HousekeepingReport::default();
    if let Some(limit) = ctx.config.inactivity_timeout {
        report.timed_out = time_out_idle_outbound(ctx, now, limit)?;
        report.inbound_terminated = terminate_idle_inbound(ctx, now, limit)?;
    }
    if let Some(limit) = ctx.config.sequence_removal_timeout {
        report.removed_outbound = remove_finished_outbound(ctx, now, limit)?;
        report.removed_inbound = remove_finished_inbound(ctx, now, limit)?;
    }
    report.orphans = reset_orphans(ctx, now)?;
    Ok(report)
}

fn time_out_idle_outbound(ctx: &EngineContext, now: Timestamp, limit: Duration) -> RmResult<usize> {
    let candidates: Vec<RmsBean> = ctx.store.snapshot(&RmsQuery {
        terminated: Some(false),
        timed_out: Some(false),
        ..Default::default()
    });
    let mut count = 0;
    for candidate in candidates {
        if !idle_for(candidate.last_activated_time, now, limit) {
            continue;
        }
        let timed_out = ctx.in_transaction(|tx| {
            let Some(mut rms) = tx.retrieve::<RmsBean>(&candidate.internal_sequence_id)? else {
                return Ok(false);
            };
            if rms.state.is_terminal() || !idle_for(rms.last_activated_time, now, limit) {
                return Ok(false);
            }
            rms.apply(SequenceEvent::TimeOut)?;
            rms.record_send_error("inactivity timeout", now);
            tx.update(rms)?;
            Ok(true)
        })?;
        if timed_out {
            warn!(
                "[rm-sender] Sequence {} timed out after {} ms of inactivity",
                candidate.internal_sequence_id,
                limit.as_millis()
            );
            count += 1;
        }
    }
    Ok(count)
}

fn terminate_idle_inbound(ctx: &EngineContext, now: Timestamp, limit: Duration) -> RmResult<usize> {
    let candidates: Vec<RmdBean> = ctx.store.snapshot(&RmdQuery {
        terminated: Some(false),
        ..Default::default()
    });
    let mut count = 0;
    for candidate in candidates {
        if !idle_for(candidate.last_activated_time, now, limit) {
            continue;
        }
        let terminated = ctx.in_transaction(|tx| {
            let Some(mut rmd) = tx.retrieve::<RmdBean>(&candidate.sequence_id)? else {
                return Ok(false);
            };
            if rmd.terminated || !idle_for(rmd.last_activated_time, now, limit) {
                return Ok(false);
            }
            rmd.apply(SequenceEvent::Terminate)?;
            rmd.last_activated_time = now;
            tx.update(rmd)?;
            Ok(true)
        })?;
        if terminated {
            info!(
                "[rm-sender] Inbound sequence {} terminated after inactivity",
                candidate.sequence_id
            );
            count += 1;
        }
    }
    Ok(count)
}

fn remove_finished_outbound(ctx: &EngineContext, now: Timestamp, limit: Duration) -> RmResult<usize> {
    let finished: Vec<RmsBean> = ctx
        .store
        .snapshot(&RmsQuery::default())
        .into_iter()
        .filter(|rms: &RmsBean| rms.state.is_terminal() && idle_for(rms.last_activated_time, now, limit))
        .collect();
    for rms in &finished {
        let id = rms.internal_sequence_id.as_str();
        ctx.in_transaction(|tx| {
            tx.delete::<RmsBean>(id)?;
            discard_matching(tx, &SenderQuery::for_internal_sequence(id))
        })?;
        ctx.polls.forget(id);
        info!("[rm-sender] Removed finished sequence {}", id);
    }
    Ok(finished.len())
}

fn remove_finished_inbound(ctx: &EngineContext, now: Timestamp, limit: Duration) -> RmResult<usize> {
    let finished: Vec<RmdBean> = ctx
        .store
        .snapshot(&RmdQuery {
            terminated: Some(true),
            ..Default::default()
        })
        .into_iter()
        .filter(|rmd: &RmdBean| idle_for(rmd.last_activated_time, now, limit))
        .collect();
    for rmd in &finished {
        let id = rmd.sequence_id.as_str();
        let undelivered = ctx.in_transaction(|tx| {
            tx.delete::<RmdBean>(id)?;
            discard_matching(
                tx,
                &SenderQuery {
                    sequence_id: Some(id.to_string()),
                    ..Default::default()
                },
            )?;
            let pending = tx.find::<InvokerBean, _>(&InvokerQuery::for_sequence(id))?;
            for bean in &pending {
                tx.delete::<InvokerBean>(&bean.message_store_key)?;
                tx.remove_message(&bean.message_store_key)?;
            }
            Ok(pending.len())
        })?;
        ctx.polls.forget(id);
        if undelivered > 0 {
            warn!(
                "[rm-sender] Removed inbound sequence {} with {} undelivered messages",
                id, undelivered
            );
        } else {
            info!("[rm-sender] Removed inbound sequence {}", id);
        }
    }
    Ok(finished.len())
}

fn reset_orphans(ctx: &EngineContext, now: Timestamp) -> RmResult<usize> {
    let wait = ctx.config.transport_wait_time.as_millis() as u64;
    let parked: Vec<SenderBean> = ctx.store.snapshot(&SenderQuery {
        transport_available: Some(false),
        ..Default::default()
    });
    let mut count = 0;
    for candidate in parked {
        let since = candidate.time_to_send.max(0) as u64;
        if now.saturating_sub(since) <= wait {
            continue;
        }
        let reset = ctx.in_transaction(|tx| {
            let Some(mut bean) = tx.retrieve::<SenderBean>(&candidate.message_id)? else {
                return Ok(false);
            };
            if bean.transport_available {
                return Ok(false);
            }
            bean.time_to_send = now as i64;
            tx.update(bean)?;
            Ok(true)
        })?;
        if reset {
            warn!(
                "[rm-sender] Message {} ({:?}) has waited over {} ms for a back-channel",
                candidate.message_id,
                candidate.message_type,
                wait
            );
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RmConfig;
    use crate::domain::{MessageType, RmEnvelope, RmVersion, SequenceState};
    use crate::ports::MockTimeSource;
    use crate::processors::outbound::{queue_outbound, sender_bean};
    use std::sync::Arc;

    fn context(config: RmConfig) -> EngineContext {
        EngineContext::new(config, Arc::new(MockTimeSource::new(0)))
    }

    fn established(id: &str) -> RmsBean {
        let mut rms = RmsBean::new(id, format!("cs-{}", id), RmVersion::V1_1, 0);
        rms.sequence_id = Some(format!("seq-{}", id));
        rms.apply(SequenceEvent::Establish).unwrap();
        rms
    }

    #[test]
    fn test_inactivity_times_out_and_terminates() {
        let ctx = context(RmConfig {
            inactivity_timeout: Some(Duration::from_millis(1_000)),
            sequence_removal_timeout: None,
            ..RmConfig::for_testing()
        });
        let mut rmd = RmdBean::new("in", RmVersion::V1_1, 0);
        rmd.apply(SequenceEvent::Establish).unwrap();
        ctx.in_transaction(|tx| {
            tx.insert(established("out"))?;
            tx.insert(rmd.clone())
        })
        .unwrap();

        assert_eq!(run(&ctx, 900).unwrap(), HousekeepingReport::default());

        let report = run(&ctx, 1_500).unwrap();
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.inbound_terminated, 1);
        let rms: RmsBean = ctx.store.peek("out").unwrap();
        assert_eq!(rms.state, SequenceState::TimedOut);
        assert_eq!(rms.last_send_error.as_deref(), Some("inactivity timeout"));
        assert!(ctx.store.peek::<RmdBean>("in").unwrap().terminated);
    }

    #[test]
    fn test_finished_sequences_are_removed_with_residue() {
        let ctx = context(RmConfig::for_testing());
        let mut rms = established("out");
        rms.apply(SequenceEvent::Terminate).unwrap();
        ctx.in_transaction(|tx| {
            tx.insert(rms.clone())?;
            let envelope = RmEnvelope::new();
            let bean = sender_bean(&envelope, MessageType::Application, Some(&rms), 0);
            queue_outbound(tx, envelope, bean)
        })
        .unwrap();
        ctx.in_transaction(|tx| tx.insert(established("live"))).unwrap();

        assert_eq!(run(&ctx, 400).unwrap().removed_outbound, 0);
        assert_eq!(run(&ctx, 600).unwrap().removed_outbound, 1);
        assert!(ctx.store.peek::<RmsBean>("out").is_none());
        assert!(ctx.store.peek::<RmsBean>("live").is_some());
        let counts = ctx.store.counts();
        assert_eq!(counts.sender, 0);
        assert_eq!(counts.messages, 0);
    }

    #[test]
    fn test_parked_message_is_reported_and_reset() {
        let ctx = context(RmConfig::for_testing());
        ctx.in_transaction(|tx| {
            let envelope = RmEnvelope::new();
            let mut bean = sender_bean(&envelope, MessageType::Acknowledgement, None, 0);
            bean.transport_available = false;
            queue_outbound(tx, envelope, bean)
        })
        .unwrap();

        assert_eq!(run(&ctx, 1_000).unwrap().orphans, 0);
        assert_eq!(run(&ctx, 3_000).unwrap().orphans, 1);
        let beans: Vec<SenderBean> = ctx.store.snapshot(&SenderQuery::default());
        assert_eq!(beans[0].time_to_send, 3_000);
        assert!(!beans[0].transport_available);
    }
}
