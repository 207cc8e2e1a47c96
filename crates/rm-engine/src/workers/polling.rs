//! Polling manager: sends MakeConnection for sequences whose peer cannot
//! reach this endpoint.
//!
//! | Record | Polls when | Selector |
//! |--------|-----------|----------|
//! | RMS in polling mode | forced, unacknowledged messages, or replies expected | address (our WS-MC anonymous URI) |
//! | RMD in polling mode | forced, or its reverse sequence expects replies | identifier |

use crate::domain::{BeanQuery, MakeConnection, RmdBean, RmdQuery, RmsBean, Timestamp};
use crate::error::RmResult;
use crate::processors::make_connection::queue_poll;
use crate::processors::EngineContext;
use crate::workers::{WakeSignal, Worker};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Forced poll requests and the last poll time per sequence.
#[derive(Debug, Default)]
pub struct PollSchedule {
    forced: Mutex<HashSet<String>>,
    last_poll: Mutex<HashMap<String, Timestamp>>,
}

impl PollSchedule {
    /// Poll for `key` on the next pass regardless of spacing.
    pub fn schedule(&self, key: &str) {
        self.forced.lock().insert(key.to_string());
    }

    pub fn take_forced(&self) -> HashSet<String> {
        std::mem::take(&mut *self.forced.lock())
    }

    pub fn is_scheduled(&self, key: &str) -> bool {
        self.forced.lock().contains(key)
    }

    fn spaced(&self, key: &str, now: Timestamp, wait: Duration) -> bool {
        self.last_poll
            .lock()
            .get(key)
            .map_or(true, |&last| now.saturating_sub(last) >= wait.as_millis() as u64)
    }

    fn record(&self, key: &str, now: Timestamp) {
        self.last_poll.lock().insert(key.to_string(), now);
    }

    /// Drop bookkeeping for a removed sequence.
    pub fn forget(&self, key: &str) {
        self.forced.lock().remove(key);
        self.last_poll.lock().remove(key);
    }
}

struct PollingMode;

impl BeanQuery<RmsBean> for PollingMode {
    fn matches(&self, bean: &RmsBean) -> bool {
        bean.polling_mode && bean.sequence_id.is_some() && !bean.state.is_terminal()
    }
}

impl std::fmt::Debug for PollingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PollingMode")
    }
}

pub struct PollingManager {
    ctx: Arc<EngineContext>,
}

impl PollingManager {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Queue the polls due now; returns how many were queued.
    pub fn poll_once(&self) -> RmResult<usize> {
        let ctx = &self.ctx;
        if !ctx.config.enable_make_connection {
            return Ok(0);
        }
        let now = ctx.now();
        let wait = ctx.config.polling_wait_time;
        let forced = ctx.polls.take_forced();
        let mut queued = 0;

        for rms in ctx.store.snapshot::<RmsBean, _>(&PollingMode) {
            let key = rms.internal_sequence_id.as_str();
            let wanted = forced.contains(key)
                || !rms.all_sent_acknowledged()
                || rms.expected_replies > 0;
            if !wanted || !(forced.contains(key) || ctx.polls.spaced(key, now, wait)) {
                continue;
            }
            let (Some(to), Some(address)) = (rms.to_epr.as_ref(), poll_address(&rms)) else {
                continue;
            };
            let selector = MakeConnection {
                address: Some(address),
                identifier: None,
            };
            ctx.in_transaction(|tx| queue_poll(ctx, tx, to, selector, rms.rm_version))?;
            ctx.polls.record(key, now);
            queued += 1;
        }

        let polling_rmds: Vec<RmdBean> = ctx.store.snapshot(&RmdQuery {
            polling_mode: Some(true),
            terminated: Some(false),
            ..Default::default()
        });
        for rmd in polling_rmds {
            let key = rmd.sequence_id.as_str();
            let reverse = rmd
                .outbound_internal_sequence
                .as_deref()
                .and_then(|id| ctx.store.peek::<RmsBean>(id));
            let Some(reverse) = reverse else { continue };
            if !forced.contains(key) && reverse.expected_replies == 0 {
                continue;
            }
            if !(forced.contains(key) || ctx.polls.spaced(key, now, wait)) {
                continue;
            }
            let Some(to) = reverse.to_epr.as_ref() else { continue };
            let selector = MakeConnection {
                address: None,
                identifier: Some(rmd.sequence_id.clone()),
            };
            ctx.in_transaction(|tx| queue_poll(ctx, tx, to, selector, rmd.rm_version))?;
            ctx.polls.record(key, now);
            queued += 1;
        }

        if queued > 0 {
            debug!("[rm-polling] Queued {} MakeConnection polls", queued);
        }
        Ok(queued)
    }
}

/// WS-MC anonymous address this sequence's peer parks messages under.
fn poll_address(rms: &RmsBean) -> Option<String> {
    [rms.reply_to_epr.as_ref(), rms.acks_to_epr.as_ref()]
        .into_iter()
        .flatten()
        .find(|epr| epr.is_make_connection_anonymous())
        .map(|epr| epr.address.clone())
}

impl Worker for PollingManager {
    const NAME: &'static str = "rm-polling";

    fn run_once(&mut self) -> RmResult<Option<Duration>> {
        self.poll_once()?;
        Ok(None)
    }

    fn idle_time(&self) -> Duration {
        self.ctx.config.polling_wait_time
    }

    fn signal(&self) -> &WakeSignal {
        &self.ctx.store.signals().polling
    }
}

impl std::fmt::Debug for PollingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingManager").finish_non_exhaustive()
    }
}
